//! Server assembly: shared state, route table, and the serve loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use ripple_core::Registry;

use crate::api;
use crate::config::Settings;
use crate::health;
use crate::shutdown::ShutdownCoordinator;
use crate::webhooks::{RetryPolicy, WebhookDispatcher};
use crate::websocket;

/// Shared state behind every handler.
pub struct AppState {
    /// Apps, channels, and connections.
    pub registry: Registry,
    /// Handle to the webhook worker.
    pub webhooks: WebhookDispatcher,
    /// Immutable runtime configuration.
    pub settings: Settings,
    /// Fires when the server is shutting down.
    pub shutdown: CancellationToken,
    /// Server start instant, for uptime reporting.
    pub start_time: Instant,
    /// Prometheus render handle; `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The assembled broker: state, webhook worker, shutdown coordination.
pub struct RippleServer {
    state: Arc<AppState>,
    coordinator: ShutdownCoordinator,
}

impl RippleServer {
    /// Assemble a server from settings.
    ///
    /// Pass the Prometheus handle from `metrics::install_recorder` when
    /// the process-global recorder is wanted; `None` leaves `/metrics`
    /// empty (tests).
    pub fn new(settings: Settings, metrics: Option<PrometheusHandle>) -> Self {
        let coordinator = ShutdownCoordinator::new();
        let registry = Registry::new(settings.apps.clone());
        let policy = RetryPolicy {
            attempts: settings.webhook_attempts,
            base_backoff: Duration::from_millis(settings.webhook_backoff_ms),
        };
        let (webhooks, webhook_worker) = WebhookDispatcher::spawn(policy, coordinator.token());
        coordinator.track(webhook_worker);
        let state = Arc::new(AppState {
            registry,
            webhooks,
            settings,
            shutdown: coordinator.token(),
            start_time: Instant::now(),
            metrics,
        });
        Self { state, coordinator }
    }

    /// Shared state handle.
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Token that, when cancelled, drives the server to a graceful stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.token()
    }

    /// The route table over this server's state.
    pub fn router(&self) -> Router {
        build_router(self.state())
    }

    /// Bind the configured address (port `0` auto-assigns).
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!("{}:{}", self.state.settings.host, self.state.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(listener)
    }

    /// Serve until the shutdown token fires, then drain the workers.
    pub async fn run(self, listener: TcpListener) -> std::io::Result<()> {
        let token = self.coordinator.token();
        let router = build_router(Arc::clone(&self.state));
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        self.coordinator.drain(None).await;
        info!("server stopped");
        Ok(())
    }
}

/// Build the route table: WebSocket endpoint, signed REST surface, and
/// the operational endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/app/{key}", get(websocket::ws_handler))
        .route("/apps/{app_id}/events", post(api::trigger_event))
        .route("/apps/{app_id}/channels", get(api::list_channels))
        .route("/apps/{app_id}/channels/{channel_name}", get(api::channel_info))
        .route(
            "/apps/{app_id}/channels/{channel_name}/users",
            get(api::channel_users),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<health::HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.channel_count(),
    ))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_server() -> RippleServer {
        RippleServer::new(Settings::default(), None)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let server = test_server();
        let response = server
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_without_recorder() {
        let server = test_server();
        let response = server
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let server = test_server();
        let response = server
            .router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rest_requires_known_app() {
        let server = test_server();
        let response = server
            .router()
            .oneshot(
                Request::get("/apps/9999/channels")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_token() {
        let server = test_server();
        let token = server.shutdown_token();
        let listener = server.bind().await.unwrap();
        let handle = tokio::spawn(server.run(listener));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
