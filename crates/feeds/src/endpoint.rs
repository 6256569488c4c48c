//! RPC endpoint pool with rotation.

use crate::RpcError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{info, warn};

/// Public mainnet node used as the last fallback.
pub const PUBLIC_MAINNET_HTTP: &str = "https://api.mainnet-beta.solana.com";
pub const PUBLIC_MAINNET_WS: &str = "wss://api.mainnet-beta.solana.com";

/// HTTP and WebSocket URLs of one RPC node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcEndpoint {
    pub http_url: String,
    pub ws_url: String,
}

impl RpcEndpoint {
    pub fn new(http_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            http_url: http_url.into(),
            ws_url: ws_url.into(),
        }
    }

    /// Build an endpoint from an HTTP URL, deriving the WebSocket URL.
    pub fn from_http(http_url: &str) -> Self {
        let ws_url = if let Some(rest) = http_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            http_url.to_string()
        };
        Self::new(http_url, ws_url)
    }

    /// Parse `http|ws` or a bare HTTP URL.
    pub fn parse(entry: &str) -> Self {
        match entry.split_once('|') {
            Some((http, ws)) if !ws.trim().is_empty() => Self::new(http.trim(), ws.trim()),
            Some((http, _)) => Self::from_http(http.trim()),
            None => Self::from_http(entry.trim()),
        }
    }

    /// Endpoint URL safe for logs (path and query stripped, they often hold API keys).
    pub fn redacted(&self) -> String {
        match url::Url::parse(&self.http_url) {
            Ok(url) => format!("{}://{}", url.scheme(), url.host_str().unwrap_or("?")),
            Err(_) => "<invalid url>".to_string(),
        }
    }

    pub fn public_mainnet() -> Self {
        Self::new(PUBLIC_MAINNET_HTTP, PUBLIC_MAINNET_WS)
    }
}

/// Result of rotating the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Index now current
    pub index: usize,
    /// True when a full cycle completed and the pool fell back to the preferred endpoint
    pub wrapped: bool,
}

/// Ordered RPC endpoints plus the index of the one in use.
///
/// The subscription manager is the only writer; RPC clients read the
/// current endpoint on every call.
#[derive(Debug)]
pub struct RpcEndpointPool {
    endpoints: Vec<RpcEndpoint>,
    current: AtomicUsize,
    rotations: AtomicU32,
}

impl RpcEndpointPool {
    /// Create a pool. The first endpoint is the preferred one.
    pub fn new(endpoints: Vec<RpcEndpoint>) -> Result<Self, RpcError> {
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoint);
        }
        let mut unique: Vec<RpcEndpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(&endpoint) {
                unique.push(endpoint);
            }
        }
        Ok(Self {
            endpoints: unique,
            current: AtomicUsize::new(0),
            rotations: AtomicU32::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn current(&self) -> &RpcEndpoint {
        &self.endpoints[self.current_index()]
    }

    pub fn endpoints(&self) -> &[RpcEndpoint] {
        &self.endpoints
    }

    /// Total number of rotations since startup.
    pub fn rotation_count(&self) -> u32 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Move to the next endpoint, wrapping to the preferred one after the last.
    pub fn rotate(&self) -> Rotation {
        let len = self.endpoints.len();
        let next = (self.current_index() + 1) % len;
        self.current.store(next, Ordering::Release);
        self.rotations.fetch_add(1, Ordering::Relaxed);

        let wrapped = next == 0;
        if wrapped {
            warn!(
                endpoint = %self.endpoints[0].redacted(),
                "All RPC endpoints tried, falling back to preferred endpoint"
            );
        } else {
            info!(
                endpoint = %self.endpoints[next].redacted(),
                index = next,
                "Switching to next RPC endpoint"
            );
        }
        Rotation {
            index: next,
            wrapped,
        }
    }

    /// Return to the preferred endpoint.
    pub fn reset_to_preferred(&self) {
        self.current.store(0, Ordering::Release);
    }
}
