//! Pusher-style REST request signing.
//!
//! Requests carry `auth_key`, `auth_timestamp`, `auth_version`, and
//! `auth_signature` query parameters. The signature is a hex HMAC-SHA256
//! keyed by the app secret over
//! `"{METHOD}\n{path}\n{sorted query without auth_signature}"` with the
//! query serialized as `key=value` pairs joined by `&` in lexical key
//! order. `body_md5`, when present, is covered by the signature like any
//! other parameter.

use std::collections::BTreeMap;

use ripple_core::{auth, App, BrokerError};

/// Maximum allowed clock skew on `auth_timestamp`, in seconds.
pub const TIMESTAMP_SKEW_SECS: i64 = 600;

/// Why a signed request was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    /// A required `auth_*` parameter was absent or malformed.
    MissingParameter(&'static str),
    /// `auth_key` does not match the app's key.
    KeyMismatch,
    /// `auth_timestamp` is outside the allowed skew window.
    StaleTimestamp,
    /// The signature did not verify.
    Invalid,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingParameter(name) => write!(f, "missing or malformed {name}"),
            Self::KeyMismatch => write!(f, "auth_key does not match"),
            Self::StaleTimestamp => write!(f, "auth_timestamp outside allowed window"),
            Self::Invalid => write!(f, "invalid auth_signature"),
        }
    }
}

/// Verify a signed REST request against the app's credentials.
pub fn verify_request(
    app: &App,
    method: &str,
    path: &str,
    params: &BTreeMap<String, String>,
) -> Result<(), SignatureError> {
    verify_request_at(app, method, path, params, chrono::Utc::now().timestamp())
}

/// [`verify_request`] with an explicit clock, for deterministic tests.
pub fn verify_request_at(
    app: &App,
    method: &str,
    path: &str,
    params: &BTreeMap<String, String>,
    now: i64,
) -> Result<(), SignatureError> {
    let key = params
        .get("auth_key")
        .ok_or(SignatureError::MissingParameter("auth_key"))?;
    if key != &app.key {
        return Err(SignatureError::KeyMismatch);
    }

    let timestamp: i64 = params
        .get("auth_timestamp")
        .and_then(|t| t.parse().ok())
        .ok_or(SignatureError::MissingParameter("auth_timestamp"))?;
    if (now - timestamp).abs() > TIMESTAMP_SKEW_SECS {
        return Err(SignatureError::StaleTimestamp);
    }

    let _version = params
        .get("auth_version")
        .ok_or(SignatureError::MissingParameter("auth_version"))?;
    let signature = params
        .get("auth_signature")
        .ok_or(SignatureError::MissingParameter("auth_signature"))?;

    let canonical = canonical_string(method, path, params);
    auth::verify_bytes(&app.secret, canonical.as_bytes(), signature).map_err(|e| match e {
        BrokerError::AuthMalformed { .. } => SignatureError::MissingParameter("auth_signature"),
        _ => SignatureError::Invalid,
    })
}

/// Build the string-to-sign for a request.
pub fn canonical_string(method: &str, path: &str, params: &BTreeMap<String, String>) -> String {
    let query: Vec<String> = params
        .iter()
        .filter(|(k, _)| k.as_str() != "auth_signature")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!("{}\n{}\n{}", method.to_uppercase(), path, query.join("&"))
}

/// Sign a request the way a client library would (used by tests).
pub fn sign_request(
    secret: &str,
    method: &str,
    path: &str,
    params: &BTreeMap<String, String>,
) -> String {
    auth::sign_bytes(secret, canonical_string(method, path, params).as_bytes())
}
