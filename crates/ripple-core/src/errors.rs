//! Broker error taxonomy and Pusher-compatible close/error codes.

use thiserror::Error;

// ── Close code constants (sent in `pusher:error` / close frames) ────

/// Plaintext connection to an SSL-only app.
pub const CODE_SSL_REQUIRED: u16 = 4000;
/// No app registered under the requested key.
pub const CODE_APP_NOT_FOUND: u16 = 4001;
/// App exists but is disabled.
pub const CODE_APP_DISABLED: u16 = 4003;
/// Server connection limit reached.
pub const CODE_OVER_CAPACITY: u16 = 4100;
/// Generic recoverable error, client may reconnect.
pub const CODE_RECONNECT: u16 = 4200;
/// Subscription auth signature rejected.
pub const CODE_NOT_AUTHORIZED: u16 = 4009;

/// Errors produced by broker operations.
///
/// Per-connection errors are reported to that client only (error frame
/// or close); none of them are fatal to the broker process.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Subscription signature did not match the expected HMAC.
    #[error("auth signature mismatch for channel {channel}")]
    AuthInvalid {
        /// Channel the subscribe targeted.
        channel: String,
    },

    /// Auth field missing or not in `key:hex` form.
    #[error("malformed auth signature: {reason}")]
    AuthMalformed {
        /// What was wrong with the supplied value.
        reason: String,
    },

    /// No app registered under the given key or id.
    #[error("app not found: {0}")]
    AppNotFound(String),

    /// App is disabled in the configuration.
    #[error("app disabled: {0}")]
    AppDisabled(String),

    /// App requires SSL but the connection arrived over plaintext.
    #[error("app {0} only accepts SSL connections")]
    SslRequired(String),

    /// Client-originated events are not enabled for this app.
    #[error("client events are not enabled for this app")]
    ClientEventsDisabled,

    /// Client event sent to a channel the connection is not subscribed
    /// to, or to a public channel.
    #[error("client events require a subscribed private or presence channel")]
    ClientEventRejected,

    /// Frame could not be parsed as a protocol message.
    #[error("malformed frame: {0}")]
    ProtocolMalformed(String),

    /// Server connection limit reached.
    #[error("over capacity")]
    OverCapacity,

    /// Registry was asked about a connection it does not hold.
    #[error("unknown connection: {0}")]
    ConnectionNotFound(String),
}

impl BrokerError {
    /// Numeric code carried in the `pusher:error` frame, when one applies.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::AuthInvalid { .. } | Self::AuthMalformed { .. } => Some(CODE_NOT_AUTHORIZED),
            Self::AppNotFound(_) => Some(CODE_APP_NOT_FOUND),
            Self::AppDisabled(_) => Some(CODE_APP_DISABLED),
            Self::SslRequired(_) => Some(CODE_SSL_REQUIRED),
            Self::OverCapacity => Some(CODE_OVER_CAPACITY),
            Self::ProtocolMalformed(_) => Some(CODE_RECONNECT),
            Self::ClientEventsDisabled
            | Self::ClientEventRejected
            | Self::ConnectionNotFound(_) => None,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AppNotFound(_)
                | Self::AppDisabled(_)
                | Self::SslRequired(_)
                | Self::OverCapacity
                | Self::ProtocolMalformed(_)
        )
    }
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_invalid_display() {
        let err = BrokerError::AuthInvalid {
            channel: "private-x".into(),
        };
        assert!(err.to_string().contains("private-x"));
        assert_eq!(err.code(), Some(CODE_NOT_AUTHORIZED));
    }

    #[test]
    fn app_errors_carry_pusher_codes() {
        assert_eq!(
            BrokerError::AppNotFound("k".into()).code(),
            Some(CODE_APP_NOT_FOUND)
        );
        assert_eq!(
            BrokerError::AppDisabled("a1".into()).code(),
            Some(CODE_APP_DISABLED)
        );
        assert_eq!(
            BrokerError::SslRequired("a1".into()).code(),
            Some(CODE_SSL_REQUIRED)
        );
        assert_eq!(BrokerError::OverCapacity.code(), Some(CODE_OVER_CAPACITY));
    }

    #[test]
    fn client_event_rejection_has_no_code() {
        assert_eq!(BrokerError::ClientEventsDisabled.code(), None);
        assert_eq!(BrokerError::ClientEventRejected.code(), None);
    }

    #[test]
    fn fatal_classification() {
        assert!(BrokerError::AppNotFound("k".into()).is_fatal());
        assert!(BrokerError::ProtocolMalformed("bad".into()).is_fatal());
        assert!(!BrokerError::ClientEventsDisabled.is_fatal());
        assert!(!BrokerError::AuthInvalid { channel: "private-a".into() }.is_fatal());
    }

    #[test]
    fn auth_failure_keeps_connection_open() {
        // Auth failures abort the subscribe but the socket stays up.
        let err = BrokerError::AuthMalformed {
            reason: "missing auth field".into(),
        };
        assert!(!err.is_fatal());
    }
}
