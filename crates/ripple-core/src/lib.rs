//! # ripple-core
//!
//! Transport-independent broker core for the Ripple pub/sub server:
//!
//! - App tenancy model and the shared `Registry`
//! - Channel / presence state machines with occupancy transitions
//! - Subscription auth (HMAC-SHA256) used by all signature schemes
//! - Pusher wire-frame parsing and construction
//!
//! The HTTP/WebSocket transport, REST surface, and webhook delivery live
//! in `ripple-server`.

#![deny(unsafe_code)]

pub mod app;
pub mod auth;
pub mod channel;
pub mod connection;
pub mod errors;
pub mod presence;
pub mod protocol;
pub mod registry;

pub use app::App;
pub use channel::{Channel, ChannelKind};
pub use connection::ClientConnection;
pub use errors::{BrokerError, Result};
pub use registry::{Registry, WebhookEvent};
