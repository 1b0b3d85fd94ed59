//! Error types for the market data layer.
//!
//! Engines wrap these in `anyhow::Error`; callers that need to branch on the
//! kind use `err.downcast_ref::<Error>()`.

use thiserror::Error;

/// Typed failures surfaced by the market data client and lookups.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Non-success response from the data provider
    #[error("Upstream API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Transport failure (connect, timeout, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Referenced entity absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid credentials or settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if the error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Upstream status code, if the error came from a response
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Upstream {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!Error::Upstream {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!Error::NotFound("sector 9".into()).is_retryable());
        assert!(!Error::Configuration("no token".into()).is_retryable());
    }

    #[test]
    fn test_status_code() {
        let err = Error::Upstream {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(Error::Network("x".into()).status_code(), None);
        assert_eq!(err.to_string(), "Upstream API error (429): slow down");
    }

    #[test]
    fn test_json_failure_is_decode() {
        let err: Error = serde_json::from_str::<Vec<i32>>("{").unwrap_err().into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = Error::NotFound("stock XYZ".into()).into();
        let err = err.context("lookup failed");
        assert!(err
            .downcast_ref::<Error>()
            .map(Error::is_not_found)
            .unwrap_or(false));
    }
}
