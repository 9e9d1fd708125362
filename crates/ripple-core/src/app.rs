//! App — an isolated tenant with its own credentials and channel namespace.

use serde::{Deserialize, Serialize};

/// An application (tenant) sharing the broker process.
///
/// Loaded once from the settings file at startup and immutable after
/// that; all mutable per-app state lives in the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct App {
    /// Stable identifier used in REST paths (`/apps/{id}/...`).
    pub id: String,
    /// Public key used in the WebSocket path (`/app/{key}`) and auth strings.
    pub key: String,
    /// Shared secret for subscription, REST, and webhook signatures.
    pub secret: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Reject plaintext connections when set.
    #[serde(default)]
    pub only_ssl: bool,
    /// Disabled apps reject every request.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether clients may publish `client-*` events.
    #[serde(default)]
    pub client_events: bool,
    /// Whether occupancy webhooks are delivered.
    #[serde(default)]
    pub webhooks_enabled: bool,
    /// Destination for webhook POSTs. Ignored unless `webhooks_enabled`.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl App {
    /// Whether webhooks should actually be sent for this app.
    pub fn wants_webhooks(&self) -> bool {
        self.webhooks_enabled && self.webhook_url.is_some()
    }
}
