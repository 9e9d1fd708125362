//! Inbound frame router.
//!
//! Parses each text frame and dispatches it against the registry. Auth
//! is verified here, before any topology mutation; the registry itself
//! only trusts its callers.

use std::sync::Arc;

use ripple_core::channel::ChannelKind;
use ripple_core::protocol::ClientFrame;
use ripple_core::registry::OpOutcome;
use ripple_core::{auth, protocol, App, BrokerError, ClientConnection, Result};

use crate::server::AppState;

/// Handle one inbound text frame for an established connection.
///
/// Errors are reported to the client by the caller; only fatal ones end
/// the session.
pub fn handle_frame(
    state: &AppState,
    app: &App,
    conn: &Arc<ClientConnection>,
    text: &str,
) -> Result<()> {
    match protocol::parse_frame(text)? {
        ClientFrame::Subscribe {
            channel,
            auth,
            channel_data,
        } => {
            if ChannelKind::of(&channel).requires_auth() {
                auth::verify_subscription(
                    &app.secret,
                    auth.as_deref(),
                    &conn.socket_id,
                    &channel,
                    channel_data.as_deref(),
                )?;
            }
            let outcome =
                state
                    .registry
                    .subscribe(&app.id, &conn.socket_id, &channel, channel_data.as_deref())?;
            settle(state, app, outcome);
            Ok(())
        }
        ClientFrame::Unsubscribe { channel } => {
            let outcome = state
                .registry
                .unsubscribe(&app.id, &conn.socket_id, &channel)?;
            settle(state, app, outcome);
            Ok(())
        }
        ClientFrame::Ping => {
            let _ = conn.send_json(&protocol::pong());
            Ok(())
        }
        ClientFrame::Pong => Ok(()),
        ClientFrame::ClientEvent {
            event,
            channel,
            data,
        } => {
            if !app.client_events {
                return Err(BrokerError::ClientEventsDisabled);
            }
            // Client events only flow on authenticated channels the sender
            // is actually subscribed to.
            if !ChannelKind::of(&channel).requires_auth() || !conn.is_subscribed(&channel) {
                return Err(BrokerError::ClientEventRejected);
            }
            let outcome =
                state
                    .registry
                    .publish(&app.id, &channel, &event, &data, Some(&conn.socket_id))?;
            settle(state, app, outcome);
            Ok(())
        }
    }
}

/// Hand an operation's side effects off: webhooks to the dispatcher,
/// overflowed connections to eviction (which may itself produce webhooks).
pub(crate) fn settle(state: &AppState, app: &App, outcome: OpOutcome) {
    state.webhooks.enqueue(app, outcome.webhooks);
    if !outcome.overflowed.is_empty() {
        let extra = state.registry.evict(outcome.overflowed);
        state.webhooks.enqueue(app, extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use ripple_core::Registry;

    use crate::config::Settings;
    use crate::webhooks::{RetryPolicy, WebhookDispatcher};

    fn test_app(client_events: bool) -> App {
        App {
            id: "app1".into(),
            key: "key1".into(),
            secret: "sekrit".into(),
            name: String::new(),
            only_ssl: false,
            enabled: true,
            client_events,
            webhooks_enabled: false,
            webhook_url: None,
        }
    }

    fn test_state(app: &App) -> AppState {
        let cancel = CancellationToken::new();
        let (webhooks, _worker) = WebhookDispatcher::spawn(
            RetryPolicy {
                attempts: 1,
                base_backoff: Duration::from_millis(1),
            },
            cancel.clone(),
        );
        AppState {
            registry: Registry::new(vec![app.clone()]),
            webhooks,
            settings: Settings::default(),
            shutdown: cancel,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    fn connect(state: &AppState, socket_id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(ClientConnection::new(socket_id.into(), "app1".into(), tx));
        state.registry.add_connection(Arc::clone(&conn)).unwrap();
        (conn, rx)
    }

    fn recv_frame(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let text = rx.try_recv().expect("expected frame");
        serde_json::from_str(&text).unwrap()
    }

    fn subscribe_frame(channel: &str, auth: Option<&str>, channel_data: Option<&str>) -> String {
        let mut data = json!({ "channel": channel });
        if let Some(auth) = auth {
            data["auth"] = json!(auth);
        }
        if let Some(cd) = channel_data {
            data["channel_data"] = json!(cd);
        }
        json!({ "event": "pusher:subscribe", "data": data }).to_string()
    }

    fn signed_auth(app: &App, socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
        let sig = auth::sign_subscription(&app.secret, socket_id, channel, channel_data);
        format!("{}:{sig}", app.key)
    }

    #[tokio::test]
    async fn public_subscribe_needs_no_auth() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");

        handle_frame(&state, &app, &conn, &subscribe_frame("room", None, None)).unwrap();
        let frame = recv_frame(&mut rx);
        assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");
        assert!(state.registry.is_subscribed("app1", "1.1", "room"));
    }

    #[tokio::test]
    async fn private_subscribe_without_auth_rejected() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");

        let err = handle_frame(&state, &app, &conn, &subscribe_frame("private-room", None, None))
            .unwrap_err();
        assert!(matches!(err, BrokerError::AuthMalformed { .. }));
        assert!(!err.is_fatal());
        assert!(rx.try_recv().is_err());
        assert!(!state.registry.is_subscribed("app1", "1.1", "private-room"));
    }

    #[tokio::test]
    async fn private_subscribe_with_valid_auth() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");

        let auth = signed_auth(&app, "1.1", "private-room", None);
        handle_frame(
            &state,
            &app,
            &conn,
            &subscribe_frame("private-room", Some(&auth), None),
        )
        .unwrap();
        assert_eq!(
            recv_frame(&mut rx)["event"],
            "pusher_internal:subscription_succeeded"
        );
    }

    #[tokio::test]
    async fn private_subscribe_with_bad_signature() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, _rx) = connect(&state, "1.1");

        // Signed for a different socket id.
        let auth = signed_auth(&app, "9.9", "private-room", None);
        let err = handle_frame(
            &state,
            &app,
            &conn,
            &subscribe_frame("private-room", Some(&auth), None),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerError::AuthInvalid { .. }));
    }

    #[tokio::test]
    async fn presence_subscribe_signs_channel_data() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");

        let data = r#"{"user_id":"u1","user_info":{"name":"Ada"}}"#;
        let auth = signed_auth(&app, "1.1", "presence-room", Some(data));
        handle_frame(
            &state,
            &app,
            &conn,
            &subscribe_frame("presence-room", Some(&auth), Some(data)),
        )
        .unwrap();
        let frame = recv_frame(&mut rx);
        assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");

        // Tampered channel_data invalidates the signature.
        let (conn2, _rx2) = connect(&state, "2.2");
        let tampered = r#"{"user_id":"u2","user_info":{}}"#;
        let err = handle_frame(
            &state,
            &app,
            &conn2,
            &subscribe_frame("presence-room", Some(&auth), Some(tampered)),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerError::AuthInvalid { .. }));
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");

        handle_frame(&state, &app, &conn, r#"{"event":"pusher:ping"}"#).unwrap();
        assert_eq!(recv_frame(&mut rx)["event"], "pusher:pong");
    }

    #[tokio::test]
    async fn unsubscribe_then_publish_misses() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");

        handle_frame(&state, &app, &conn, &subscribe_frame("room", None, None)).unwrap();
        let _ = recv_frame(&mut rx);
        handle_frame(
            &state,
            &app,
            &conn,
            &json!({"event": "pusher:unsubscribe", "data": {"channel": "room"}}).to_string(),
        )
        .unwrap();
        let _ = state
            .registry
            .publish("app1", "room", "msg", &json!({}), None)
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_event_disabled_for_app() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, _rx) = connect(&state, "1.1");

        let err = handle_frame(
            &state,
            &app,
            &conn,
            &json!({"event": "client-x", "channel": "private-room", "data": {}}).to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerError::ClientEventsDisabled));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn client_event_requires_subscription() {
        let app = test_app(true);
        let state = test_state(&app);
        let (conn, _rx) = connect(&state, "1.1");

        let err = handle_frame(
            &state,
            &app,
            &conn,
            &json!({"event": "client-x", "channel": "private-room", "data": {}}).to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerError::ClientEventRejected));
    }

    #[tokio::test]
    async fn client_event_rejected_on_public_channel() {
        let app = test_app(true);
        let state = test_state(&app);
        let (conn, mut rx) = connect(&state, "1.1");
        handle_frame(&state, &app, &conn, &subscribe_frame("room", None, None)).unwrap();
        let _ = recv_frame(&mut rx);

        let err = handle_frame(
            &state,
            &app,
            &conn,
            &json!({"event": "client-x", "channel": "room", "data": {}}).to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, BrokerError::ClientEventRejected));
    }

    #[tokio::test]
    async fn client_event_fans_out_excluding_sender() {
        let app = test_app(true);
        let state = test_state(&app);
        let (c1, mut rx1) = connect(&state, "1.1");
        let (c2, mut rx2) = connect(&state, "2.2");

        for (conn, socket_id) in [(&c1, "1.1"), (&c2, "2.2")] {
            let auth = signed_auth(&app, socket_id, "private-room", None);
            handle_frame(
                &state,
                &app,
                conn,
                &subscribe_frame("private-room", Some(&auth), None),
            )
            .unwrap();
        }
        let _ = recv_frame(&mut rx1);
        let _ = recv_frame(&mut rx2);

        handle_frame(
            &state,
            &app,
            &c1,
            &json!({"event": "client-typing", "channel": "private-room", "data": {"on": true}})
                .to_string(),
        )
        .unwrap();
        assert!(rx1.try_recv().is_err());
        let frame = recv_frame(&mut rx2);
        assert_eq!(frame["event"], "client-typing");
        assert_eq!(frame["data"]["on"], true);
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        let app = test_app(false);
        let state = test_state(&app);
        let (conn, _rx) = connect(&state, "1.1");
        let err = handle_frame(&state, &app, &conn, "not json").unwrap_err();
        assert!(matches!(err, BrokerError::ProtocolMalformed(_)));
        assert!(err.is_fatal());
    }
}
