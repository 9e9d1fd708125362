//! Pusher wire protocol — inbound frame parsing and outbound frame builders.
//!
//! Frames are JSON objects with an `event` name and a `data` payload.
//! Outbound system frames carry `data` as a JSON-encoded *string*, matching
//! the Pusher protocol; broadcast payloads pass through untouched.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::{BrokerError, Result};

/// Activity timeout advertised in the connection-established frame (seconds).
pub const ACTIVITY_TIMEOUT_SECS: u64 = 120;

/// Prefix marking client-originated events.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// `pusher:subscribe`
    Subscribe {
        /// Target channel name.
        channel: String,
        /// `"{key}:{hex}"` signature, required for private/presence.
        auth: Option<String>,
        /// Presence member payload, exact client bytes.
        channel_data: Option<String>,
    },
    /// `pusher:unsubscribe`
    Unsubscribe {
        /// Target channel name.
        channel: String,
    },
    /// `pusher:ping` keepalive.
    Ping,
    /// `pusher:pong` reply to a server ping.
    Pong,
    /// `client-*` event published by the connection.
    ClientEvent {
        /// Full event name including the `client-` prefix.
        event: String,
        /// Target channel name.
        channel: String,
        /// Arbitrary payload, forwarded as-is.
        data: Value,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct SubscribeData {
    channel: String,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    channel_data: Option<String>,
}

#[derive(Deserialize)]
struct UnsubscribeData {
    channel: String,
}

/// Parse an inbound text frame.
pub fn parse_frame(text: &str) -> Result<ClientFrame> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| BrokerError::ProtocolMalformed(e.to_string()))?;

    match raw.event.as_str() {
        "pusher:subscribe" => {
            let data: SubscribeData = serde_json::from_value(raw.data)
                .map_err(|e| BrokerError::ProtocolMalformed(format!("subscribe data: {e}")))?;
            Ok(ClientFrame::Subscribe {
                channel: data.channel,
                auth: data.auth,
                channel_data: data.channel_data,
            })
        }
        "pusher:unsubscribe" => {
            let data: UnsubscribeData = serde_json::from_value(raw.data)
                .map_err(|e| BrokerError::ProtocolMalformed(format!("unsubscribe data: {e}")))?;
            Ok(ClientFrame::Unsubscribe {
                channel: data.channel,
            })
        }
        "pusher:ping" => Ok(ClientFrame::Ping),
        "pusher:pong" => Ok(ClientFrame::Pong),
        event if event.starts_with(CLIENT_EVENT_PREFIX) => {
            let channel = raw.channel.ok_or_else(|| {
                BrokerError::ProtocolMalformed("client event without channel".into())
            })?;
            Ok(ClientFrame::ClientEvent {
                event: event.to_owned(),
                channel,
                data: raw.data,
            })
        }
        other => Err(BrokerError::ProtocolMalformed(format!(
            "unknown event {other:?}"
        ))),
    }
}

// ── Outbound frame builders ─────────────────────────────────────────

fn data_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".into())
}

/// `pusher:connection_established` carrying the socket identifier.
pub fn connection_established(socket_id: &str) -> Value {
    json!({
        "event": "pusher:connection_established",
        "data": data_string(&json!({
            "socket_id": socket_id,
            "activity_timeout": ACTIVITY_TIMEOUT_SECS,
        })),
    })
}

/// `pusher:pong` keepalive reply.
pub fn pong() -> Value {
    json!({ "event": "pusher:pong", "data": "{}" })
}

/// `pusher:error` with an optional numeric code.
pub fn error_frame(code: Option<u16>, message: &str) -> Value {
    json!({
        "event": "pusher:error",
        "data": { "code": code, "message": message },
    })
}

/// `pusher_internal:subscription_succeeded` for public/private channels.
pub fn subscription_succeeded(channel: &str) -> Value {
    json!({
        "event": "pusher_internal:subscription_succeeded",
        "channel": channel,
        "data": "{}",
    })
}

/// `pusher_internal:subscription_succeeded` with the presence snapshot.
///
/// The snapshot lists members present *before* this subscriber joined.
pub fn presence_subscription_succeeded(
    channel: &str,
    ids: &[String],
    hash: &serde_json::Map<String, Value>,
) -> Value {
    json!({
        "event": "pusher_internal:subscription_succeeded",
        "channel": channel,
        "data": data_string(&json!({
            "presence": {
                "ids": ids,
                "hash": hash,
                "count": ids.len(),
            },
        })),
    })
}

/// `pusher_internal:member_added` broadcast to existing subscribers.
pub fn member_added(channel: &str, user_id: &str, user_info: &Value) -> Value {
    json!({
        "event": "pusher_internal:member_added",
        "channel": channel,
        "data": data_string(&json!({ "user_id": user_id, "user_info": user_info })),
    })
}

/// `pusher_internal:member_removed`.
pub fn member_removed(channel: &str, user_id: &str) -> Value {
    json!({
        "event": "pusher_internal:member_removed",
        "channel": channel,
        "data": data_string(&json!({ "user_id": user_id })),
    })
}

/// A named event broadcast on a channel (client event or REST trigger).
pub fn channel_event(channel: &str, event: &str, data: &Value) -> Value {
    json!({ "event": event, "channel": channel, "data": data })
}
