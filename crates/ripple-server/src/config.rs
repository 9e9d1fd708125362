//! Settings loading — JSON file with `${VAR}` expansion and env overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, parse it (after expanding `${VAR}`
//!    references against the process environment)
//! 3. Apply `RIPPLE_*` environment variable overrides (highest priority)
//!
//! Apps are declared in the file only; there is no env form for them.
//! A missing file yields defaults (no apps); a malformed file is a
//! startup-fatal error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use ripple_core::App;

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse the settings JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g. duplicate app id).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Broker configuration, loaded once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections across all apps.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity (frames).
    pub outbound_queue: usize,
    /// Treat every connection as secure (TLS terminated upstream).
    pub behind_tls_proxy: bool,
    /// Webhook delivery attempts before giving up.
    pub webhook_attempts: u32,
    /// Base backoff between webhook retries, in milliseconds.
    pub webhook_backoff_ms: u64,
    /// Configured tenants.
    pub apps: Vec<App>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            outbound_queue: 1024,
            behind_tls_proxy: false,
            webhook_attempts: 3,
            webhook_backoff_ms: 500,
            apps: Vec::new(),
        }
    }
}

/// Load settings from `path` with env expansion and overrides.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env(&content);
        serde_json::from_str(&expanded)?
    } else {
        debug!(?path, "settings file not found, using defaults");
        Settings::default()
    };
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Expand `${VAR}` references against the process environment.
///
/// Unset variables expand to the empty string, so secrets can be
/// injected at deploy time without landing in the file.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Apply `RIPPLE_*` env overrides. Invalid values are silently ignored
/// (fall back to file/default).
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("RIPPLE_HOST") {
        settings.host = v;
    }
    if let Some(v) = read_env_u16("RIPPLE_PORT") {
        settings.port = v;
    }
    if let Some(v) = read_env_usize("RIPPLE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.max_connections = v;
    }
    if let Some(v) = read_env_bool("RIPPLE_BEHIND_TLS_PROXY") {
        settings.behind_tls_proxy = v;
    }
}

fn validate(settings: &Settings) -> Result<()> {
    let mut ids = std::collections::HashSet::new();
    let mut keys = std::collections::HashSet::new();
    for app in &settings.apps {
        if !ids.insert(&app.id) {
            return Err(SettingsError::InvalidValue(format!(
                "duplicate app id {}",
                app.id
            )));
        }
        if !keys.insert(&app.key) {
            return Err(SettingsError::InvalidValue(format!(
                "duplicate app key {}",
                app.key
            )));
        }
        if app.secret.is_empty() {
            return Err(SettingsError::InvalidValue(format!(
                "app {} has an empty secret",
                app.id
            )));
        }
    }
    Ok(())
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok()?.parse().ok()
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let v: usize = std::env::var(name).ok()?.parse().ok()?;
    (min..=max).contains(&v).then_some(v)
}

fn read_env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
