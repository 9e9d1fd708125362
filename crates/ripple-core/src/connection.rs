//! Per-socket client connection state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Generate an opaque socket identifier in the `"{n}.{n}"` wire form.
pub fn generate_socket_id() -> String {
    let mut rng = rand::rng();
    format!("{}.{}", rng.random::<u32>(), rng.random::<u32>())
}

/// One client's socket session.
///
/// The registry holds these behind `Arc`; the WebSocket write task owns
/// the receiving half of `tx`. All cross-task communication goes through
/// the bounded queue, never through shared mutable fields.
#[derive(Debug)]
pub struct ClientConnection {
    /// Socket identifier, unique per connection.
    pub socket_id: String,
    /// Owning app id.
    pub app_id: String,
    /// Send half of the bounded outbound frame queue.
    tx: mpsc::Sender<Arc<String>>,
    /// Channel names this connection is subscribed to.
    channels: Mutex<HashSet<String>>,
    /// Single-use flag guarding the disconnect cascade.
    closed: AtomicBool,
    /// Cancelled to force the session tasks down (slow consumer, shutdown).
    cancel: CancellationToken,
    /// Frames dropped because the queue was full.
    dropped_frames: AtomicU64,
    /// Close code and reason for the transport close frame, set by the
    /// read loop before a fatal teardown.
    close_reason: Mutex<Option<(u16, String)>>,
    /// When the connection was established.
    pub connected_at: Instant,
}

impl ClientConnection {
    /// Create a connection with the given outbound queue.
    pub fn new(socket_id: String, app_id: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            socket_id,
            app_id,
            tx,
            channels: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            connected_at: Instant::now(),
        }
    }

    /// Enqueue a frame without blocking.
    ///
    /// Returns `false` when the queue is full or the write task is gone;
    /// the caller decides whether that demotes to a disconnect.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize a JSON value and enqueue it.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total frames dropped on this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Record a subscribed channel. Returns `false` if already present.
    pub fn add_channel(&self, channel: &str) -> bool {
        self.channels.lock().insert(channel.to_owned())
    }

    /// Forget a subscribed channel. Returns `false` if it was not present.
    pub fn remove_channel(&self, channel: &str) -> bool {
        self.channels.lock().remove(channel)
    }

    /// Whether this connection is subscribed to `channel`.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.lock().contains(channel)
    }

    /// Snapshot of subscribed channel names.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }

    /// Claim the right to run the disconnect cascade.
    ///
    /// Returns `true` exactly once, no matter how many paths (transport
    /// error, explicit close, slow-consumer eviction) race to close.
    pub fn close_once(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Whether the disconnect cascade has been claimed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the connection must be torn down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record the code and reason the transport close frame should carry.
    ///
    /// The first reason wins; later callers racing the teardown do not
    /// overwrite it.
    pub fn set_close_reason(&self, code: u16, reason: impl Into<String>) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            *slot = Some((code, reason.into()));
        }
    }

    /// Take the recorded close code and reason, if any.
    pub fn take_close_reason(&self) -> Option<(u16, String)> {
        self.close_reason.lock().take()
    }

    /// Force the session tasks to exit.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }
}
