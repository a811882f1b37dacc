//! Broker connection and trust errors.

use std::time::Duration;

use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use super::network::Medium;
use super::trust::CertDigest;

/// Failure taxonomy used for retry policy and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, reset, failed probe. Retried through backoff.
    Transient,
    /// Identity or pin mismatch. Publish refused, re-verified on the next attempt.
    Trust,
    /// Local storage failure.
    Durability,
    /// Nothing to connect to or unusable settings. Not retried automatically.
    Configuration,
}

/// Broker identity and certificate trust failures.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("no identity announcement on '{topic}' within {timeout:?}")]
    IdentityTimeout { topic: String, timeout: Duration },

    #[error("broker identity mismatch: expected '{expected}', announced '{announced}'")]
    IdentityMismatch { expected: String, announced: String },

    #[error("leaf certificate digest mismatch (pinned {expected}, presented {})", .presented.map(|d| d.to_string()).unwrap_or_else(|| "none".to_string()))]
    PinMismatch {
        expected: CertDigest,
        presented: Option<CertDigest>,
    },

    #[error("invalid certificate digest: {0}")]
    InvalidDigest(String),

    #[error("tls setup failed: {0}")]
    Tls(String),
}

/// Errors returned by the connection manager and broker transports.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker target '{0}' is not configured")]
    UnknownTarget(String),

    #[error("broker target '{0}' is disabled")]
    Disabled(String),

    #[error("broker target '{0}' has no endpoints")]
    NoEndpoints(String),

    #[error("not on a trusted network (attached via {0})")]
    UntrustedNetwork(Medium),

    #[error("backing off, next attempt in {0:?}")]
    BackingOff(Duration),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session closed")]
    SessionClosed,

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Trust(#[from] TrustError),
}

impl ConnectionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownTarget(_)
            | Self::Disabled(_)
            | Self::NoEndpoints(_)
            | Self::InvalidEndpoint(_) => ErrorClass::Configuration,
            Self::Trust(TrustError::Tls(_) | TrustError::InvalidDigest(_)) => {
                ErrorClass::Configuration
            }
            Self::Trust(_) => ErrorClass::Trust,
            Self::UntrustedNetwork(_)
            | Self::BackingOff(_)
            | Self::ConnectTimeout(_)
            | Self::PublishTimeout(_)
            | Self::Refused(_)
            | Self::Transport(_)
            | Self::SessionClosed => ErrorClass::Transient,
        }
    }

    /// Whether a failed connect should park the link in `Failed`.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.class(), ErrorClass::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ConnectionError::ConnectTimeout(Duration::from_secs(1)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ConnectionError::NoEndpoints("primary".into()).class(),
            ErrorClass::Configuration
        );
        let mismatch = ConnectionError::from(TrustError::IdentityMismatch {
            expected: "hub-a".into(),
            announced: "hub-b".into(),
        });
        assert_eq!(mismatch.class(), ErrorClass::Trust);
        assert!(mismatch.is_fatal());
        assert!(!ConnectionError::SessionClosed.is_fatal());
    }

    #[test]
    fn test_pin_mismatch_message() {
        let err = TrustError::PinMismatch {
            expected: CertDigest::from_bytes([0xab; 32]),
            presented: None,
        };
        let message = err.to_string();
        assert!(message.contains("abababab"));
        assert!(message.ends_with("presented none)"));
    }
}
