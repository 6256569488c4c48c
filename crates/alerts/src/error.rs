//! Delivery error types.

use std::time::Duration;
use thiserror::Error;

/// Errors from chat, mail and market-data requests.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network failure or timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote asked us to slow down
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The API refused the request (bad token, unknown chat, ...)
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Mail error: {message}")]
    Mail { message: String, transient: bool },

    /// Local request budget exhausted
    #[error("Request limit reached: {0}")]
    LimitReached(&'static str),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Channel not configured: {0}")]
    NotConfigured(&'static str),
}

impl DeliveryError {
    /// Check if this error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Transport(_) | DeliveryError::RateLimited(_) => true,
            DeliveryError::Mail { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Suggested delay before retry.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            DeliveryError::Transport(_) => Some(Duration::from_secs(5)),
            DeliveryError::RateLimited(_) => Some(Duration::from_secs(30)),
            DeliveryError::Mail {
                transient: true, ..
            } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

impl From<teloxide::RequestError> for DeliveryError {
    fn from(err: teloxide::RequestError) -> Self {
        use teloxide::RequestError;
        match &err {
            RequestError::Api(_) | RequestError::MigrateToChatId(_) => {
                DeliveryError::Rejected(err.to_string())
            }
            RequestError::RetryAfter(_) => DeliveryError::RateLimited(err.to_string()),
            RequestError::InvalidJson { .. } => DeliveryError::InvalidResponse(err.to_string()),
            _ => DeliveryError::Transport(err.to_string()),
        }
    }
}

impl From<lettre::transport::smtp::Error> for DeliveryError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        DeliveryError::Mail {
            transient: !err.is_permanent(),
            message: err.to_string(),
        }
    }
}

impl From<lettre::address::AddressError> for DeliveryError {
    fn from(err: lettre::address::AddressError) -> Self {
        DeliveryError::Mail {
            message: format!("invalid address: {err}"),
            transient: false,
        }
    }
}

impl From<lettre::error::Error> for DeliveryError {
    fn from(err: lettre::error::Error) -> Self {
        DeliveryError::Mail {
            message: err.to_string(),
            transient: false,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DeliveryError::InvalidResponse(err.to_string())
        } else if err.status().map_or(false, |s| s.as_u16() == 429) {
            DeliveryError::RateLimited(err.to_string())
        } else {
            DeliveryError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DeliveryError::Transport("timeout".into()).is_transient());
        assert!(DeliveryError::RateLimited("429".into()).is_transient());
        assert!(!DeliveryError::Rejected("chat not found".into()).is_transient());
        assert!(!DeliveryError::LimitReached("daily").is_transient());
        assert!(DeliveryError::Mail {
            message: "421".into(),
            transient: true
        }
        .is_transient());
    }

    #[test]
    fn test_suggested_retry_delay() {
        assert_eq!(
            DeliveryError::RateLimited("slow down".into()).suggested_retry_delay(),
            Some(Duration::from_secs(30))
        );
        assert!(DeliveryError::Rejected("bad token".into())
            .suggested_retry_delay()
            .is_none());
    }
}
