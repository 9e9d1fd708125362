//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections rejected at the handshake (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Slow consumers evicted (counter).
pub const WS_SLOW_CONSUMER_EVICTIONS_TOTAL: &str = "ws_slow_consumer_evictions_total";
/// Channel events broadcast (counter).
pub const BROADCAST_EVENTS_TOTAL: &str = "broadcast_events_total";
/// Frames dropped on full outbound queues (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";
/// Webhook batches enqueued (counter).
pub const WEBHOOKS_ENQUEUED_TOTAL: &str = "webhooks_enqueued_total";
/// Webhook delivery attempts (counter, labels: outcome).
pub const WEBHOOK_ATTEMPTS_TOTAL: &str = "webhook_attempts_total";
/// Webhook batches dropped after exhausting retries (counter).
pub const WEBHOOKS_DROPPED_TOTAL: &str = "webhooks_dropped_total";
/// REST trigger requests (counter).
pub const API_EVENTS_TOTAL: &str = "api_events_total";
