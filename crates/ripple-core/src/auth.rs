//! HMAC-SHA256 signatures for subscriptions, webhooks, and REST requests.
//!
//! Subscription auth strings are `"{app_key}:{hex_signature}"` where the
//! signature is an HMAC keyed by the app secret over
//! `socket_id:channel_name` with `:channel_data` appended when the client
//! supplied a presence payload (exact payload bytes, no re-serialization).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{BrokerError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex signature for a subscription request.
pub fn sign_subscription(
    secret: &str,
    socket_id: &str,
    channel: &str,
    channel_data: Option<&str>,
) -> String {
    let mut to_sign = format!("{socket_id}:{channel}");
    if let Some(data) = channel_data {
        to_sign.push(':');
        to_sign.push_str(data);
    }
    sign_bytes(secret, to_sign.as_bytes())
}

/// Hex HMAC-SHA256 over arbitrary bytes (webhook bodies, REST strings).
pub fn sign_bytes(secret: &str, data: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a client-supplied subscription auth string.
///
/// `supplied` must be `"{key}:{hex}"`. Comparison is constant-time via
/// [`Mac::verify_slice`]. Pure function, safe to call concurrently.
pub fn verify_subscription(
    secret: &str,
    supplied: Option<&str>,
    socket_id: &str,
    channel: &str,
    channel_data: Option<&str>,
) -> Result<()> {
    let supplied = supplied.ok_or_else(|| BrokerError::AuthMalformed {
        reason: "missing auth field".into(),
    })?;
    let (_key, sig_hex) = supplied
        .split_once(':')
        .ok_or_else(|| BrokerError::AuthMalformed {
            reason: "auth is not in key:signature form".into(),
        })?;
    let sig = hex::decode(sig_hex).map_err(|_| BrokerError::AuthMalformed {
        reason: "signature is not valid hex".into(),
    })?;

    let mut to_sign = format!("{socket_id}:{channel}");
    if let Some(data) = channel_data {
        to_sign.push(':');
        to_sign.push_str(data);
    }
    let mut mac = new_mac(secret);
    mac.update(to_sign.as_bytes());
    mac.verify_slice(&sig).map_err(|_| BrokerError::AuthInvalid {
        channel: channel.to_owned(),
    })
}

/// Verify a bare hex signature over arbitrary bytes (REST auth).
pub fn verify_bytes(secret: &str, data: &[u8], sig_hex: &str) -> Result<()> {
    let sig = hex::decode(sig_hex).map_err(|_| BrokerError::AuthMalformed {
        reason: "signature is not valid hex".into(),
    })?;
    let mut mac = new_mac(secret);
    mac.update(data);
    mac.verify_slice(&sig).map_err(|_| BrokerError::AuthInvalid {
        channel: String::new(),
    })
}

fn new_mac(secret: &str) -> HmacSha256 {
    // HMAC-SHA256 accepts keys of any length, so this cannot fail.
    HmacSha256::new_from_slice(secret.as_bytes()).unwrap_or_else(|_| unreachable!())
}
