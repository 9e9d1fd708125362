//! WebSocket session lifecycle.
//!
//! Each accepted socket runs two tasks: the read loop (this module's
//! `serve_connection`, driven by the upgrade handler) and a spawned write
//! task that drains the connection's bounded outbound queue. Admission
//! failures are reported over the established socket as a `pusher:error`
//! frame followed by a close with the matching code, which is how
//! Pusher-protocol clients expect to learn about bad keys or capacity.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info};

use ripple_core::connection::generate_socket_id;
use ripple_core::errors::CODE_RECONNECT;
use ripple_core::{protocol, App, BrokerError, ClientConnection};

use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_HANDSHAKE_REJECTIONS_TOTAL,
};
use crate::server::AppState;
use crate::websocket::router;

/// Interval between transport-level pings from the write task.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /app/{key}` — the client WebSocket endpoint.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let secure = state.settings.behind_tls_proxy
        || headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("https"));
    ws.on_upgrade(move |socket| run_session(state, key, secure, socket))
}

async fn run_session(state: Arc<AppState>, key: String, secure: bool, socket: WebSocket) {
    match admit(&state, &key, secure) {
        Ok(app) => serve_connection(state, app, socket).await,
        Err(err) => reject(socket, &err).await,
    }
}

/// Admission checks, in rejection-code order: key, enabled, SSL.
///
/// Capacity is not checked here: the slot is reserved atomically during
/// registration, so racing handshakes cannot overshoot the cap.
fn admit(state: &AppState, key: &str, secure: bool) -> ripple_core::Result<App> {
    let app = state.registry.app_by_key(key)?;
    if !app.enabled {
        return Err(BrokerError::AppDisabled(app.id));
    }
    if app.only_ssl && !secure {
        return Err(BrokerError::SslRequired(app.id));
    }
    Ok(app)
}

async fn reject(socket: WebSocket, err: &BrokerError) {
    let (mut sink, _stream) = socket.split();
    reject_sink(&mut sink, err).await;
}

async fn reject_sink(sink: &mut SplitSink<WebSocket, Message>, err: &BrokerError) {
    counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "reason" => rejection_label(err)).increment(1);
    debug!(error = %err, "rejecting connection");
    let frame = protocol::error_frame(err.code(), &err.to_string());
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: err.code().unwrap_or(CODE_RECONNECT),
            reason: err.to_string().into(),
        })))
        .await;
}

fn rejection_label(err: &BrokerError) -> &'static str {
    match err {
        BrokerError::AppNotFound(_) => "app_not_found",
        BrokerError::AppDisabled(_) => "app_disabled",
        BrokerError::SslRequired(_) => "ssl_required",
        BrokerError::OverCapacity => "over_capacity",
        _ => "other",
    }
}

async fn serve_connection(state: Arc<AppState>, app: App, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // Register before replying: the capacity slot must be reserved before
    // the client hears anything, so two racing handshakes cannot both
    // slip under the cap.
    let (tx, rx) = mpsc::channel(state.settings.outbound_queue);
    let conn = Arc::new(ClientConnection::new(
        generate_socket_id(),
        app.id.clone(),
        tx,
    ));
    if let Err(err) = state
        .registry
        .add_connection_capped(Arc::clone(&conn), state.settings.max_connections)
    {
        reject_sink(&mut sink, &err).await;
        return;
    }

    // The established frame goes straight to the socket, before the write
    // task exists, so it is always the first frame the client sees.
    let established = protocol::connection_established(&conn.socket_id);
    let sent = match serde_json::to_string(&established) {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    };
    if !sent {
        let _ = state.registry.disconnect(&conn);
        return;
    }
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(app_id = %app.id, socket_id = %conn.socket_id, "connection established");

    let writer = tokio::spawn(write_task(sink, rx, Arc::clone(&conn)));

    let conn_cancel = conn.cancel_token();
    loop {
        tokio::select! {
            () = conn_cancel.cancelled() => break,
            () = state.shutdown.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = router::handle_frame(&state, &app, &conn, text.as_str()) {
                        debug!(
                            socket_id = %conn.socket_id,
                            error = %err,
                            "frame rejected"
                        );
                        let _ = conn.send_json(&protocol::error_frame(err.code(), &err.to_string()));
                        if err.is_fatal() {
                            conn.set_close_reason(
                                err.code().unwrap_or(CODE_RECONNECT),
                                err.to_string(),
                            );
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Transport ping/pong handled by the stack; binary ignored.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(socket_id = %conn.socket_id, error = %e, "socket read error");
                    break;
                }
            },
        }
    }

    let outcome = state.registry.disconnect(&conn);
    state.webhooks.enqueue(&app, outcome.webhooks);
    if !outcome.overflowed.is_empty() {
        let extra = state.registry.evict(outcome.overflowed);
        state.webhooks.enqueue(&app, extra);
    }
    let _ = writer.await;
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(app_id = %app.id, socket_id = %conn.socket_id, "connection closed");
}

/// Drain the outbound queue into the socket, interleaving liveness pings.
///
/// On cancellation the already-queued frames are flushed first, so an
/// error frame enqueued just before a fatal close still reaches the
/// client, and the close frame carries the code the read loop recorded.
async fn write_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    conn: Arc<ClientConnection>,
) {
    let cancel = conn.cancel_token();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame.as_str().into())).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
            }
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if sink.send(Message::Text(frame.as_str().into())).await.is_err() {
            return;
        }
    }
    let close = conn.take_close_reason().map(|(code, reason)| CloseFrame {
        code,
        reason: reason.into(),
    });
    let _ = sink.send(Message::Close(close)).await;
}
