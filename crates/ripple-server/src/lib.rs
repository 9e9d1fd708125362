//! Transport and control surfaces for the ripple broker.
//!
//! Wires the core registry to the outside world: the `/app/{key}`
//! WebSocket endpoint, the signed `/apps/{app_id}/...` REST surface,
//! webhook delivery, and the operational `/health` and `/metrics`
//! endpoints.

pub mod api;
pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod webhooks;
pub mod websocket;

pub use config::{load_settings, Settings};
pub use server::{build_router, AppState, RippleServer};
pub use shutdown::ShutdownCoordinator;
