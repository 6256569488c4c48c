//! Error types for RPC and subscription transport.
//!
//! `solana_client` errors are folded into [`RpcError`] so retry decisions
//! only look at one type.

use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::pubsub_client::PubsubClientError;
use solana_client::rpc_request::RpcError as SolanaRpcError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to a Solana RPC node.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("No RPC endpoint configured")]
    NoEndpoint,

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<ClientError> for RpcError {
    fn from(err: ClientError) -> Self {
        match err.kind() {
            ClientErrorKind::Io(e) => RpcError::ConnectionFailed(e.to_string()),
            ClientErrorKind::Reqwest(e) => {
                if e.is_timeout() {
                    RpcError::Timeout(e.to_string())
                } else if let Some(status) = e.status() {
                    RpcError::from_status(status.as_u16())
                } else {
                    RpcError::ConnectionFailed(e.to_string())
                }
            }
            ClientErrorKind::RpcError(SolanaRpcError::RpcResponseError { code, message, .. }) => {
                RpcError::Rpc {
                    code: *code,
                    message: message.clone(),
                }
            }
            ClientErrorKind::RpcError(SolanaRpcError::RpcRequestError(message)) => {
                RpcError::ConnectionFailed(message.clone())
            }
            ClientErrorKind::RpcError(SolanaRpcError::ParseError(message)) => {
                RpcError::ParseError(message.clone())
            }
            ClientErrorKind::SerdeJson(e) => RpcError::ParseError(e.to_string()),
            _ => RpcError::Rpc {
                code: 0,
                message: err.to_string(),
            },
        }
    }
}

impl From<PubsubClientError> for RpcError {
    fn from(err: PubsubClientError) -> Self {
        match err {
            PubsubClientError::ConnectionClosed(reason) => RpcError::Disconnected(reason),
            PubsubClientError::SubscribeFailed { .. } => {
                RpcError::SubscriptionFailed(err.to_string())
            }
            other => RpcError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::ParseError(err.to_string())
    }
}

impl From<url::ParseError> for RpcError {
    fn from(err: url::ParseError) -> Self {
        RpcError::ConnectionFailed(err.to_string())
    }
}

impl RpcError {
    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16) -> Self {
        if status == 429 {
            RpcError::RateLimitExceeded
        } else {
            RpcError::HttpStatus(status)
        }
    }

    /// Returns true if this error is transient and likely to succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::ConnectionFailed(_)
            | RpcError::Disconnected(_)
            | RpcError::Timeout(_)
            | RpcError::RateLimitExceeded => true,
            RpcError::HttpStatus(status) => *status >= 500,
            // Node is behind or temporarily overloaded
            RpcError::Rpc { code, .. } => matches!(code, -32004 | -32005 | -32007 | -32014),
            _ => false,
        }
    }

    /// Returns true if this error requires manual intervention.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RpcError::NoEndpoint)
            || matches!(self, RpcError::HttpStatus(401 | 403))
    }

    /// Returns a suggested retry delay for this error type, if applicable.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            RpcError::RateLimitExceeded => Some(Duration::from_secs(10)),
            RpcError::ConnectionFailed(_) => Some(Duration::from_secs(5)),
            RpcError::Disconnected(_) | RpcError::Timeout(_) => Some(Duration::from_secs(2)),
            RpcError::SubscriptionFailed(_) => Some(Duration::from_secs(5)),
            _ if self.is_transient() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RpcError::Timeout("read".into()).is_transient());
        assert!(RpcError::RateLimitExceeded.is_transient());
        assert!(RpcError::HttpStatus(503).is_transient());
        assert!(!RpcError::HttpStatus(404).is_transient());
        assert!(RpcError::Rpc {
            code: -32005,
            message: "Node is behind".into()
        }
        .is_transient());
        assert!(!RpcError::ParseError("bad json".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(RpcError::from_status(429), RpcError::RateLimitExceeded));
        assert!(RpcError::from_status(401).is_permanent());
        assert_eq!(
            RpcError::RateLimitExceeded.suggested_retry_delay(),
            Some(Duration::from_secs(10))
        );
        assert_eq!(RpcError::NoEndpoint.suggested_retry_delay(), None);
    }

    #[test]
    fn test_client_error_mapping() {
        let node_behind: RpcError = ClientError::from(ClientErrorKind::RpcError(
            SolanaRpcError::RpcResponseError {
                code: -32005,
                message: "Node is behind".to_string(),
                data: solana_client::rpc_request::RpcResponseErrorData::Empty,
            },
        ))
        .into();
        assert!(node_behind.is_transient());

        let bad_body: RpcError =
            ClientError::from(ClientErrorKind::RpcError(SolanaRpcError::ParseError(
                "unexpected token".to_string(),
            )))
            .into();
        assert!(matches!(bad_body, RpcError::ParseError(_)));
        assert!(!bad_body.is_transient());

        let closed: RpcError = PubsubClientError::ConnectionClosed("eof".to_string()).into();
        assert!(matches!(closed, RpcError::Disconnected(_)));
        assert!(closed.is_transient());
    }
}
