//! Registry — the single shared mutable structure: apps → channels →
//! connections, with presence ledgers.
//!
//! Lookups by app id/key are lock-free through the `DashMap`; every
//! mutation of an app's topology (subscribe, unsubscribe, disconnect,
//! broadcast enumeration) is serialized under that app's mutex, so
//! unrelated apps proceed concurrently and read snapshots are always
//! consistent.
//!
//! Delivery uses each connection's bounded queue via `try_send`. A full
//! queue never blocks the publisher; the overflowing connection is
//! reported back to the caller and dropped (treated as a disconnect with
//! the full unsubscribe cascade) — dropping arbitrary mid-stream frames
//! would silently break per-channel order for that client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::App;
use crate::channel::{Channel, ChannelKind};
use crate::connection::ClientConnection;
use crate::errors::{BrokerError, Result};
use crate::protocol;

// ── Webhook event kinds ─────────────────────────────────────────────

/// A channel gained its first subscriber.
pub const WEBHOOK_CHANNEL_OCCUPIED: &str = "channel_occupied";
/// A channel lost its last subscriber and was removed.
pub const WEBHOOK_CHANNEL_VACATED: &str = "channel_vacated";
/// First connection of a presence member joined.
pub const WEBHOOK_MEMBER_ADDED: &str = "member_added";
/// Last connection of a presence member left.
pub const WEBHOOK_MEMBER_REMOVED: &str = "member_removed";

/// An occupancy/membership transition for webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Owning app id.
    pub app_id: String,
    /// One of the `WEBHOOK_*` kinds.
    pub name: &'static str,
    /// Channel the transition happened on.
    pub channel: String,
    /// Member id for `member_added`/`member_removed`.
    pub user_id: Option<String>,
}

/// Outcome of a mutating registry operation.
#[derive(Debug, Default)]
pub struct OpOutcome {
    /// Occupancy transitions to hand to the webhook dispatcher.
    pub webhooks: Vec<WebhookEvent>,
    /// Connections whose outbound queue overflowed during delivery;
    /// the caller must evict them (drop-connection overflow policy).
    pub overflowed: Vec<Arc<ClientConnection>>,
    /// Subscribers the frame was enqueued to (publish only).
    pub delivered: usize,
}

/// Presence `channel_data` payload supplied by the subscribing client.
#[derive(Debug, Deserialize)]
struct PresencePayload {
    user_id: String,
    #[serde(default)]
    user_info: Value,
}

/// Aggregate view of one channel for the REST surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    /// Channel kind.
    pub kind: ChannelKind,
    /// Number of subscribed sockets.
    pub subscription_count: usize,
    /// Distinct presence members; `None` for non-presence channels.
    pub user_count: Option<usize>,
}

#[derive(Default)]
struct AppTopology {
    channels: HashMap<String, Channel>,
    connections: HashMap<String, Arc<ClientConnection>>,
}

struct AppEntry {
    app: App,
    state: Mutex<AppTopology>,
}

/// Top-level owner of all apps, channels, and connections.
pub struct Registry {
    apps: DashMap<String, Arc<AppEntry>>,
    by_key: DashMap<String, String>,
    total_connections: AtomicUsize,
}

impl Registry {
    /// Build a registry over the configured apps.
    pub fn new(apps: Vec<App>) -> Self {
        let registry = Self {
            apps: DashMap::new(),
            by_key: DashMap::new(),
            total_connections: AtomicUsize::new(0),
        };
        for app in apps {
            let _ = registry.by_key.insert(app.key.clone(), app.id.clone());
            let _ = registry.apps.insert(
                app.id.clone(),
                Arc::new(AppEntry {
                    app,
                    state: Mutex::new(AppTopology::default()),
                }),
            );
        }
        registry
    }

    // ── App lookup ──────────────────────────────────────────────────

    /// App by public key (WebSocket handshake path).
    pub fn app_by_key(&self, key: &str) -> Result<App> {
        let id = self
            .by_key
            .get(key)
            .ok_or_else(|| BrokerError::AppNotFound(key.to_owned()))?;
        self.app_by_id(&id)
    }

    /// App by id (REST path).
    pub fn app_by_id(&self, app_id: &str) -> Result<App> {
        self.apps
            .get(app_id)
            .map(|e| e.app.clone())
            .ok_or_else(|| BrokerError::AppNotFound(app_id.to_owned()))
    }

    fn entry(&self, app_id: &str) -> Result<Arc<AppEntry>> {
        self.apps
            .get(app_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| BrokerError::AppNotFound(app_id.to_owned()))
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Register a freshly-established connection.
    pub fn add_connection(&self, conn: Arc<ClientConnection>) -> Result<()> {
        self.add_connection_capped(conn, usize::MAX)
    }

    /// Register a connection unless the server-wide cap is reached.
    ///
    /// The slot is reserved atomically before the connection is stored,
    /// so racing handshakes can never overshoot `max`.
    pub fn add_connection_capped(&self, conn: Arc<ClientConnection>, max: usize) -> Result<()> {
        let entry = self.entry(&conn.app_id)?;
        if self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(BrokerError::OverCapacity);
        }
        let mut state = entry.state.lock();
        if state
            .connections
            .insert(conn.socket_id.clone(), conn)
            .is_some()
        {
            // Replaced a connection with the same socket id; the slot was
            // already counted.
            let _ = self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Total live connections across all apps.
    pub fn connection_count(&self) -> usize {
        self.total_connections.load(Ordering::SeqCst)
    }

    /// Total active channels across all apps.
    pub fn channel_count(&self) -> usize {
        self.apps
            .iter()
            .map(|e| e.state.lock().channels.len())
            .sum()
    }

    // ── Subscribe ───────────────────────────────────────────────────

    /// Subscribe a connection to a channel.
    ///
    /// Auth must already be verified by the caller for private/presence
    /// channels; this function only mutates topology. The subscriber
    /// receives `subscription_succeeded` (with the prior-members snapshot
    /// on presence channels) before any other subscriber sees
    /// `member_added`, all under the app lock.
    pub fn subscribe(
        &self,
        app_id: &str,
        socket_id: &str,
        channel_name: &str,
        channel_data: Option<&str>,
    ) -> Result<OpOutcome> {
        let entry = self.entry(app_id)?;
        let mut state = entry.state.lock();
        let mut outcome = OpOutcome::default();

        let conn = state
            .connections
            .get(socket_id)
            .cloned()
            .ok_or_else(|| BrokerError::ConnectionNotFound(socket_id.to_owned()))?;

        // Presence payload must parse before any mutation.
        let kind = ChannelKind::of(channel_name);
        let presence_payload = if kind == ChannelKind::Presence {
            let raw = channel_data.ok_or_else(|| {
                BrokerError::ProtocolMalformed("presence subscribe without channel_data".into())
            })?;
            let payload: PresencePayload = serde_json::from_str(raw).map_err(|e| {
                BrokerError::ProtocolMalformed(format!("invalid channel_data: {e}"))
            })?;
            Some(payload)
        } else {
            None
        };

        let was_absent = !state.channels.contains_key(channel_name);
        let channel = state
            .channels
            .entry(channel_name.to_owned())
            .or_insert_with(|| Channel::new(channel_name));

        if !channel.subscribe(socket_id) {
            // Duplicate subscribe: re-acknowledge, no transitions.
            let frame = succeeded_frame(channel, socket_id);
            if !conn.send_json(&frame) {
                outcome.overflowed.push(conn);
            }
            return Ok(outcome);
        }
        let _ = conn.add_channel(channel_name);

        if was_absent {
            outcome.webhooks.push(WebhookEvent {
                app_id: app_id.to_owned(),
                name: WEBHOOK_CHANNEL_OCCUPIED,
                channel: channel_name.to_owned(),
                user_id: None,
            });
        }

        let mut member_added_frame = None;
        if let Some(payload) = presence_payload {
            // Snapshot before the join so the subscriber never sees itself.
            let frame = succeeded_frame(channel, socket_id);
            if !conn.send_json(&frame) {
                outcome.overflowed.push(conn.clone());
            }

            let ledger = channel
                .presence
                .as_mut()
                .unwrap_or_else(|| unreachable!("presence channel without ledger"));
            if ledger.join(&payload.user_id, socket_id, payload.user_info.clone()) {
                member_added_frame = Some(protocol::member_added(
                    channel_name,
                    &payload.user_id,
                    &payload.user_info,
                ));
                outcome.webhooks.push(WebhookEvent {
                    app_id: app_id.to_owned(),
                    name: WEBHOOK_MEMBER_ADDED,
                    channel: channel_name.to_owned(),
                    user_id: Some(payload.user_id),
                });
            }
        } else {
            let frame = succeeded_frame(channel, socket_id);
            if !conn.send_json(&frame) {
                outcome.overflowed.push(conn.clone());
            }
        }

        if let Some(frame) = member_added_frame {
            deliver(&state, channel_name, &frame, Some(socket_id), &mut outcome);
        }

        debug!(app_id, socket_id, channel = channel_name, "subscribed");
        Ok(outcome)
    }

    // ── Unsubscribe / disconnect ────────────────────────────────────

    /// Unsubscribe a connection from a channel.
    ///
    /// Disconnect uses the same removal path, so occupancy and presence
    /// transitions are evaluated identically for both.
    pub fn unsubscribe(
        &self,
        app_id: &str,
        socket_id: &str,
        channel_name: &str,
    ) -> Result<OpOutcome> {
        let entry = self.entry(app_id)?;
        let mut state = entry.state.lock();
        let mut outcome = OpOutcome::default();
        if let Some(conn) = state.connections.get(socket_id).cloned() {
            let _ = conn.remove_channel(channel_name);
        }
        remove_from_channel(&mut state, app_id, socket_id, channel_name, &mut outcome);
        Ok(outcome)
    }

    /// Run the full disconnect cascade for a connection.
    ///
    /// Idempotent: the connection's single-use closed flag guarantees the
    /// cascade runs exactly once even when a transport error and an
    /// explicit close race.
    pub fn disconnect(&self, conn: &Arc<ClientConnection>) -> OpOutcome {
        let mut outcome = OpOutcome::default();
        if !conn.close_once() {
            return outcome;
        }
        conn.force_close();

        let Ok(entry) = self.entry(&conn.app_id) else {
            return outcome;
        };
        let mut state = entry.state.lock();
        if state.connections.remove(&conn.socket_id).is_some() {
            let _ = self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
        for channel_name in conn.channel_names() {
            remove_from_channel(
                &mut state,
                &conn.app_id,
                &conn.socket_id,
                &channel_name,
                &mut outcome,
            );
        }
        debug!(
            app_id = %conn.app_id,
            socket_id = %conn.socket_id,
            "disconnect cascade complete"
        );
        outcome
    }

    /// Evict connections whose outbound queue overflowed.
    ///
    /// Runs the disconnect cascade for each and returns the accumulated
    /// transitions. Must be called after the lock-holding operation that
    /// reported them has returned.
    pub fn evict(&self, overflowed: Vec<Arc<ClientConnection>>) -> Vec<WebhookEvent> {
        let mut webhooks = Vec::new();
        // A cascade can overflow further connections (member_removed fans
        // out to the other subscribers), so drain a worklist until no
        // eviction produces another.
        let mut queue = overflowed;
        while let Some(conn) = queue.pop() {
            warn!(
                app_id = %conn.app_id,
                socket_id = %conn.socket_id,
                drops = conn.drop_count(),
                "evicting slow consumer"
            );
            counter!("ws_slow_consumer_evictions_total").increment(1);
            let mut outcome = self.disconnect(&conn);
            webhooks.append(&mut outcome.webhooks);
            queue.append(&mut outcome.overflowed);
        }
        webhooks
    }

    // ── Publish ─────────────────────────────────────────────────────

    /// Broadcast an event to a channel's current subscribers.
    ///
    /// Publishing to a channel that does not exist is a no-op, not an
    /// error. `exclude` skips the originating socket (client events, REST
    /// `socket_id` parameter).
    pub fn publish(
        &self,
        app_id: &str,
        channel_name: &str,
        event: &str,
        data: &Value,
        exclude: Option<&str>,
    ) -> Result<OpOutcome> {
        let entry = self.entry(app_id)?;
        let state = entry.state.lock();
        let mut outcome = OpOutcome::default();
        if !state.channels.contains_key(channel_name) {
            return Ok(outcome);
        }
        let frame = protocol::channel_event(channel_name, event, data);
        deliver(&state, channel_name, &frame, exclude, &mut outcome);
        counter!("broadcast_events_total").increment(1);
        Ok(outcome)
    }

    // ── Queries (REST surface) ──────────────────────────────────────

    /// Whether the channel currently exists (has subscribers).
    pub fn channel_exists(&self, app_id: &str, channel_name: &str) -> Result<bool> {
        let entry = self.entry(app_id)?;
        let state = entry.state.lock();
        Ok(state.channels.contains_key(channel_name))
    }

    /// Whether the socket is subscribed to the channel.
    pub fn is_subscribed(&self, app_id: &str, socket_id: &str, channel_name: &str) -> bool {
        self.entry(app_id).is_ok_and(|entry| {
            let state = entry.state.lock();
            state
                .channels
                .get(channel_name)
                .is_some_and(|c| c.has_subscriber(socket_id))
        })
    }

    /// Summary for one channel, `None` when it does not exist.
    pub fn channel_summary(
        &self,
        app_id: &str,
        channel_name: &str,
    ) -> Result<Option<ChannelSummary>> {
        let entry = self.entry(app_id)?;
        let state = entry.state.lock();
        Ok(state.channels.get(channel_name).map(summarize))
    }

    /// Summaries of all active channels, optionally filtered by prefix.
    pub fn channels_summary(
        &self,
        app_id: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, ChannelSummary)>> {
        let entry = self.entry(app_id)?;
        let state = entry.state.lock();
        let mut out: Vec<_> = state
            .channels
            .iter()
            .filter(|(name, _)| prefix.is_none_or(|p| name.starts_with(p)))
            .map(|(name, ch)| (name.clone(), summarize(ch)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Presence member ids, `None` when the channel does not exist.
    ///
    /// Returns an error for non-presence channels.
    pub fn presence_user_ids(
        &self,
        app_id: &str,
        channel_name: &str,
    ) -> Result<Option<Vec<String>>> {
        if ChannelKind::of(channel_name) != ChannelKind::Presence {
            return Err(BrokerError::ProtocolMalformed(format!(
                "{channel_name} is not a presence channel"
            )));
        }
        let entry = self.entry(app_id)?;
        let state = entry.state.lock();
        Ok(state
            .channels
            .get(channel_name)
            .and_then(|c| c.presence.as_ref())
            .map(crate::presence::PresenceLedger::member_ids))
    }
}

fn summarize(channel: &Channel) -> ChannelSummary {
    ChannelSummary {
        kind: channel.kind,
        subscription_count: channel.subscription_count(),
        user_count: channel.presence.as_ref().map(|p| p.member_count()),
    }
}

/// Build the subscription-succeeded frame for a subscriber.
///
/// For presence channels the snapshot must exclude the subscriber itself,
/// so this is called before the ledger join.
fn succeeded_frame(channel: &Channel, _socket_id: &str) -> Value {
    match &channel.presence {
        Some(ledger) => protocol::presence_subscription_succeeded(
            &channel.name,
            &ledger.member_ids(),
            &ledger.member_hash(),
        ),
        None => protocol::subscription_succeeded(&channel.name),
    }
}

/// Enqueue a frame to every subscriber of `channel_name` except `exclude`.
fn deliver(
    state: &AppTopology,
    channel_name: &str,
    frame: &Value,
    exclude: Option<&str>,
    outcome: &mut OpOutcome,
) {
    let Some(channel) = state.channels.get(channel_name) else {
        return;
    };
    let json = match serde_json::to_string(frame) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!(channel = channel_name, error = %e, "failed to serialize frame");
            return;
        }
    };
    for socket_id in channel.subscriber_ids() {
        if exclude == Some(socket_id.as_str()) {
            continue;
        }
        let Some(conn) = state.connections.get(socket_id) else {
            continue;
        };
        if conn.send(Arc::clone(&json)) {
            outcome.delivered += 1;
        } else {
            counter!("broadcast_drops_total").increment(1);
            outcome.overflowed.push(Arc::clone(conn));
        }
    }
}

/// Shared removal path for unsubscribe and disconnect.
///
/// Removing a socket that is not subscribed is a defensive no-op.
fn remove_from_channel(
    state: &mut AppTopology,
    app_id: &str,
    socket_id: &str,
    channel_name: &str,
    outcome: &mut OpOutcome,
) {
    let Some(channel) = state.channels.get_mut(channel_name) else {
        return;
    };
    if !channel.unsubscribe(socket_id) {
        debug!(socket_id, channel = channel_name, "removal of non-subscriber ignored");
        return;
    }

    let mut member_removed_frame = None;
    if let Some(ledger) = channel.presence.as_mut() {
        if let Some(user_id) = ledger.leave(socket_id) {
            member_removed_frame = Some(protocol::member_removed(channel_name, &user_id));
            outcome.webhooks.push(WebhookEvent {
                app_id: app_id.to_owned(),
                name: WEBHOOK_MEMBER_REMOVED,
                channel: channel_name.to_owned(),
                user_id: Some(user_id),
            });
        }
    }
    let vacated = channel.is_vacant();

    if let Some(frame) = member_removed_frame {
        deliver(state, channel_name, &frame, Some(socket_id), outcome);
    }

    if vacated {
        let _ = state.channels.remove(channel_name);
        outcome.webhooks.push(WebhookEvent {
            app_id: app_id.to_owned(),
            name: WEBHOOK_CHANNEL_VACATED,
            channel: channel_name.to_owned(),
            user_id: None,
        });
    }
}
