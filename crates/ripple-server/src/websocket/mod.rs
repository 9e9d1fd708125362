//! WebSocket surface: handshake admission, session lifecycle, and the
//! inbound frame router.

pub(crate) mod router;
mod session;

pub use session::ws_handler;
