//! Signed REST control surface.
//!
//! Every route is scoped to an app id and authenticated with the
//! Pusher-style query signature (see [`signature`]). Handlers translate
//! registry state into the wire shapes server SDKs expect.

pub mod signature;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use ripple_core::channel::ChannelKind;
use ripple_core::App;

use crate::metrics::API_EVENTS_TOTAL;
use crate::server::AppState;

/// Most channels a single trigger request may target.
const MAX_TRIGGER_CHANNELS: usize = 100;
/// Longest accepted event name.
const MAX_EVENT_NAME_LEN: usize = 200;

/// REST-surface error, rendered as `{"error": ...}` with the status.
#[derive(Debug)]
pub enum ApiError {
    /// Signature or credential failure.
    Unauthorized(String),
    /// App exists but is disabled.
    Forbidden(String),
    /// Unknown app id.
    NotFound(String),
    /// Invalid parameter or body.
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Resolve the app and verify the request signature.
fn authorize(
    state: &AppState,
    app_id: &str,
    method: &Method,
    uri: &Uri,
    params: &BTreeMap<String, String>,
) -> Result<App, ApiError> {
    let app = state
        .registry
        .app_by_id(app_id)
        .map_err(|_| ApiError::NotFound(format!("app {app_id} not found")))?;
    if !app.enabled {
        return Err(ApiError::Forbidden(format!("app {app_id} is disabled")));
    }
    signature::verify_request(&app, method.as_str(), uri.path(), params).map_err(|e| {
        debug!(app_id, error = %e, "rejecting unsigned request");
        ApiError::Unauthorized(e.to_string())
    })?;
    Ok(app)
}

/// Requested `info=` attributes, comma separated.
fn info_attributes(params: &BTreeMap<String, String>) -> Vec<&str> {
    params
        .get("info")
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// `POST /apps/{app_id}/events` request body.
#[derive(Debug, Deserialize)]
pub struct TriggerEvent {
    name: String,
    data: Value,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    socket_id: Option<String>,
}

/// `POST /apps/{app_id}/events` — trigger an event on one or more channels.
///
/// Publishing to a channel with no subscribers is a silent success; the
/// response is `{}` either way, matching server SDK expectations.
pub async fn trigger_event(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<BTreeMap<String, String>>,
    Json(body): Json<TriggerEvent>,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;

    let channels = match (&body.channels[..], &body.channel) {
        ([], Some(single)) => vec![single.clone()],
        ([], None) => {
            return Err(ApiError::BadRequest("no channel specified".into()));
        }
        (many, _) => many.to_vec(),
    };
    if channels.len() > MAX_TRIGGER_CHANNELS {
        return Err(ApiError::BadRequest(format!(
            "cannot trigger on more than {MAX_TRIGGER_CHANNELS} channels"
        )));
    }
    if body.name.is_empty() || body.name.len() > MAX_EVENT_NAME_LEN {
        return Err(ApiError::BadRequest("invalid event name".into()));
    }

    counter!(API_EVENTS_TOTAL).increment(1);
    for channel in &channels {
        let outcome = state
            .registry
            .publish(&app.id, channel, &body.name, &body.data, body.socket_id.as_deref())
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        crate::websocket::router::settle(&state, &app, outcome);
    }
    debug!(app_id = %app.id, event = %body.name, channels = channels.len(), "event triggered");
    Ok(Json(json!({})))
}

/// `GET /apps/{app_id}/channels` — list occupied channels.
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;

    let prefix = params.get("filter_by_prefix").map(String::as_str);
    let attributes = info_attributes(&params);
    if attributes.contains(&"user_count")
        && !prefix.is_some_and(|p| p.starts_with("presence-"))
    {
        return Err(ApiError::BadRequest(
            "user_count may only be requested for presence channels".into(),
        ));
    }
    if let Some(unknown) = attributes
        .iter()
        .find(|a| !matches!(**a, "user_count"))
    {
        return Err(ApiError::BadRequest(format!(
            "info attribute {unknown} is not supported on this endpoint"
        )));
    }

    let mut channels = Map::new();
    for (name, summary) in state
        .registry
        .channels_summary(&app.id, prefix)
        .map_err(|e| ApiError::NotFound(e.to_string()))?
    {
        let mut info = Map::new();
        if attributes.contains(&"user_count") {
            let _ = info.insert("user_count".into(), json!(summary.user_count.unwrap_or(0)));
        }
        let _ = channels.insert(name, Value::Object(info));
    }
    Ok(Json(json!({ "channels": channels })))
}

/// `GET /apps/{app_id}/channels/{channel_name}` — one channel's state.
pub async fn channel_info(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel_name)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;

    let attributes = info_attributes(&params);
    if attributes.contains(&"user_count")
        && ChannelKind::of(&channel_name) != ChannelKind::Presence
    {
        return Err(ApiError::BadRequest(
            "user_count is only defined for presence channels".into(),
        ));
    }
    if let Some(unknown) = attributes
        .iter()
        .find(|a| !matches!(**a, "user_count" | "subscription_count"))
    {
        return Err(ApiError::BadRequest(format!(
            "info attribute {unknown} is not supported"
        )));
    }

    let summary = state
        .registry
        .channel_summary(&app.id, &channel_name)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    let mut body = Map::new();
    let _ = body.insert("occupied".into(), json!(summary.is_some()));
    if attributes.contains(&"subscription_count") {
        let count = summary.as_ref().map_or(0, |s| s.subscription_count);
        let _ = body.insert("subscription_count".into(), json!(count));
    }
    if attributes.contains(&"user_count") {
        let count = summary.as_ref().and_then(|s| s.user_count).unwrap_or(0);
        let _ = body.insert("user_count".into(), json!(count));
    }
    Ok(Json(Value::Object(body)))
}

/// `GET /apps/{app_id}/channels/{channel_name}/users` — presence members.
pub async fn channel_users(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel_name)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;

    let ids = state
        .registry
        .presence_user_ids(&app.id, &channel_name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
        .unwrap_or_default();
    let users: Vec<Value> = ids.into_iter().map(|id| json!({ "id": id })).collect();
    Ok(Json(json!({ "users": users })))
}
