//! `logsSubscribe` streams over `solana_client`'s `PubsubClient`.
//!
//! One PubSub connection carries every per-address subscription. Each
//! subscription runs on its own task that forwards notifications into a
//! shared channel tagged with a local subscription id, so the manager can
//! route them back to the watched address.

use crate::{RpcEndpoint, RpcError};
use async_trait::async_trait;
use futures_util::StreamExt;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcTransactionLogsConfig, RpcTransactionLogsFilter};
use solana_client::rpc_response::{Response, RpcLogsResponse};
use solana_sdk::commitment_config::CommitmentConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffer between subscription tasks and the reader.
pub const NOTIFICATION_BUFFER: usize = 1024;

/// A log event for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogNotification {
    /// Subscription id assigned by the stream
    pub subscription: u64,
    pub signature: String,
    /// True if the transaction failed (`err` was non-null)
    pub failed: bool,
    pub slot: u64,
}

impl LogNotification {
    pub fn from_response(subscription: u64, response: Response<RpcLogsResponse>) -> Self {
        Self {
            subscription,
            failed: response.value.err.is_some(),
            signature: response.value.signature,
            slot: response.context.slot,
        }
    }
}

/// An open log-subscription connection.
#[async_trait]
pub trait LogStream: Send {
    /// Subscribe to logs mentioning `address`. Returns the subscription id.
    async fn subscribe(&mut self, address: &str) -> Result<u64, RpcError>;

    async fn unsubscribe(&mut self, subscription: u64) -> Result<(), RpcError>;

    /// Wait for the next notification. An error means the connection is gone.
    async fn next_notification(&mut self) -> Result<LogNotification, RpcError>;
}

/// Opens [`LogStream`]s to RPC endpoints.
#[async_trait]
pub trait LogStreamConnector: Send + Sync {
    async fn connect(&self, endpoint: &RpcEndpoint) -> Result<Box<dyn LogStream>, RpcError>;
}

struct SubscriptionTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// `LogStream` over a Solana PubSub WebSocket.
pub struct PubsubLogStream {
    client: Arc<PubsubClient>,
    commitment: CommitmentConfig,
    next_id: u64,
    tasks: HashMap<u64, SubscriptionTask>,
    tx: mpsc::Sender<Result<LogNotification, RpcError>>,
    rx: mpsc::Receiver<Result<LogNotification, RpcError>>,
}

impl PubsubLogStream {
    /// Connect to a PubSub endpoint.
    pub async fn connect(ws_url: &str, commitment: CommitmentConfig) -> Result<Self, RpcError> {
        debug!(url = ws_url, "Connecting log stream");
        let client = PubsubClient::new(ws_url).await?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        Ok(Self {
            client: Arc::new(client),
            commitment,
            next_id: 1,
            tasks: HashMap::new(),
            tx,
            rx,
        })
    }
}

/// Forward notifications of one subscription until stopped or the socket closes.
async fn forward_logs(
    client: Arc<PubsubClient>,
    id: u64,
    address: String,
    commitment: CommitmentConfig,
    ready: oneshot::Sender<Result<(), RpcError>>,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::Sender<Result<LogNotification, RpcError>>,
) {
    let subscribed = client
        .logs_subscribe(
            RpcTransactionLogsFilter::Mentions(vec![address.clone()]),
            RpcTransactionLogsConfig {
                commitment: Some(commitment),
            },
        )
        .await;
    let (mut stream, unsubscribe) = match subscribed {
        Ok(subscription) => {
            let _ = ready.send(Ok(()));
            subscription
        }
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let closed = loop {
        tokio::select! {
            _ = &mut stop => break false,
            item = stream.next() => match item {
                Some(response) => {
                    let notification = LogNotification::from_response(id, response);
                    if events.send(Ok(notification)).await.is_err() {
                        break false;
                    }
                }
                None => break true,
            },
        }
    };
    drop(stream);

    if closed {
        warn!(address = %address, subscription = id, "Log subscription stream ended");
        let _ = events
            .send(Err(RpcError::Disconnected("pubsub stream ended".to_string())))
            .await;
    } else {
        unsubscribe().await;
    }
}

#[async_trait]
impl LogStream for PubsubLogStream {
    async fn subscribe(&mut self, address: &str) -> Result<u64, RpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(forward_logs(
            self.client.clone(),
            id,
            address.to_string(),
            self.commitment,
            ready_tx,
            stop_rx,
            self.tx.clone(),
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.tasks.insert(
                    id,
                    SubscriptionTask {
                        stop: stop_tx,
                        handle,
                    },
                );
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::SubscriptionFailed(format!(
                "subscription task for {address} ended"
            ))),
        }
    }

    async fn unsubscribe(&mut self, subscription: u64) -> Result<(), RpcError> {
        let task = self
            .tasks
            .remove(&subscription)
            .ok_or_else(|| RpcError::SubscriptionFailed(format!("unknown subscription {subscription}")))?;
        // The task may already have ended with the connection
        let _ = task.stop.send(());
        task.handle
            .await
            .map_err(|e| RpcError::SubscriptionFailed(e.to_string()))
    }

    async fn next_notification(&mut self) -> Result<LogNotification, RpcError> {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| Err(RpcError::ChannelClosed))
    }
}

/// Connects [`PubsubLogStream`]s.
#[derive(Debug, Clone)]
pub struct PubsubLogConnector {
    commitment: CommitmentConfig,
}

impl PubsubLogConnector {
    pub fn new(commitment: CommitmentConfig) -> Self {
        Self { commitment }
    }
}

impl Default for PubsubLogConnector {
    fn default() -> Self {
        Self::new(CommitmentConfig::confirmed())
    }
}

#[async_trait]
impl LogStreamConnector for PubsubLogConnector {
    async fn connect(&self, endpoint: &RpcEndpoint) -> Result<Box<dyn LogStream>, RpcError> {
        let stream = PubsubLogStream::connect(&endpoint.ws_url, self.commitment).await?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Default)]
struct MockState {
    connects: Vec<String>,
    subscriptions: HashMap<String, u64>,
    unsubscribed: Vec<u64>,
    next_subscription: u64,
    sender: Option<mpsc::UnboundedSender<LogNotification>>,
}

/// Channel-backed connector for tests.
///
/// Each `connect` replaces the previous stream; `emit` pushes a
/// notification into the most recent one and `disconnect` ends it.
#[derive(Debug, Clone, Default)]
pub struct MockLogConnector {
    state: Arc<Mutex<MockState>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MockLogConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to this WebSocket URL.
    pub fn fail_endpoint(&self, ws_url: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(ws_url.to_string());
        }
    }

    pub fn heal_endpoint(&self, ws_url: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(ws_url);
        }
    }

    /// WebSocket URLs connected to so far, in order.
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().map(|s| s.connects.clone()).unwrap_or_default()
    }

    /// Addresses subscribed on the current stream.
    pub fn subscribed_addresses(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.subscriptions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unsubscribed(&self) -> Vec<u64> {
        self.state.lock().map(|s| s.unsubscribed.clone()).unwrap_or_default()
    }

    /// Deliver a notification for `address` on the current stream.
    /// Returns false if the address is not subscribed.
    pub fn emit(&self, address: &str, signature: &str, failed: bool) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        let (Some(&subscription), Some(sender)) =
            (state.subscriptions.get(address), state.sender.as_ref())
        else {
            return false;
        };
        sender
            .send(LogNotification {
                subscription,
                signature: signature.to_string(),
                failed,
                slot: 0,
            })
            .is_ok()
    }

    /// Drop the current stream's sender so it reports a disconnect.
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.sender = None;
        }
    }
}

#[async_trait]
impl LogStreamConnector for MockLogConnector {
    async fn connect(&self, endpoint: &RpcEndpoint) -> Result<Box<dyn LogStream>, RpcError> {
        let refused = self
            .failing
            .lock()
            .map(|f| f.contains(&endpoint.ws_url))
            .unwrap_or(false);
        let mut state = self
            .state
            .lock()
            .map_err(|_| RpcError::ConnectionFailed("mock state poisoned".to_string()))?;
        state.connects.push(endpoint.ws_url.clone());
        if refused {
            return Err(RpcError::ConnectionFailed(format!(
                "mock refused {}",
                endpoint.ws_url
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        state.subscriptions.clear();
        Ok(Box::new(MockLogStream {
            state: self.state.clone(),
            rx,
        }))
    }
}

struct MockLogStream {
    state: Arc<Mutex<MockState>>,
    rx: mpsc::UnboundedReceiver<LogNotification>,
}

#[async_trait]
impl LogStream for MockLogStream {
    async fn subscribe(&mut self, address: &str) -> Result<u64, RpcError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RpcError::SubscriptionFailed("mock state poisoned".to_string()))?;
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(address.to_string(), id);
        Ok(id)
    }

    async fn unsubscribe(&mut self, subscription: u64) -> Result<(), RpcError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RpcError::SubscriptionFailed("mock state poisoned".to_string()))?;
        state.unsubscribed.push(subscription);
        Ok(())
    }

    async fn next_notification(&mut self) -> Result<LogNotification, RpcError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| RpcError::Disconnected("mock stream closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn response(err: serde_json::Value) -> Response<RpcLogsResponse> {
        serde_json::from_value(json!({
            "context": {"slot": 5208469},
            "value": {
                "signature": "5h6xBEauJ3PK6SWCZ1PGjBvj8vDdWG3KpwATGy1ARAXFSDwt8GFXM7W5Ncn16wmqokgpiKRLuS83KUxyZyv2sUYv",
                "err": err,
                "logs": ["Program log: Instruction: Swap"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_notification_from_response() {
        let notification = LogNotification::from_response(7, response(serde_json::Value::Null));
        assert_eq!(notification.subscription, 7);
        assert_eq!(notification.slot, 5208469);
        assert!(!notification.failed);
        assert!(notification.signature.starts_with("5h6x"));
    }

    #[test]
    fn test_failed_notification() {
        let notification =
            LogNotification::from_response(1, response(json!({"InstructionError": [0, {"Custom": 6001}]})));
        assert!(notification.failed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = PubsubLogConnector::default();
        let endpoint = RpcEndpoint::new("http://127.0.0.1:1", "ws://127.0.0.1:1");
        assert!(connector.connect(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_connector_roundtrip() {
        let connector = MockLogConnector::new();
        let endpoint = RpcEndpoint::public_mainnet();
        let mut stream = connector.connect(&endpoint).await.unwrap();

        let id = stream.subscribe("Wallet1").await.unwrap();
        assert!(connector.emit("Wallet1", "sig-1", false));
        assert!(!connector.emit("Wallet2", "sig-2", false));

        let notification = stream.next_notification().await.unwrap();
        assert_eq!(notification.subscription, id);
        assert_eq!(notification.signature, "sig-1");

        connector.disconnect();
        assert!(stream.next_notification().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_connector_refuses() {
        let connector = MockLogConnector::new();
        let endpoint = RpcEndpoint::public_mainnet();
        connector.fail_endpoint(&endpoint.ws_url);

        assert!(connector.connect(&endpoint).await.is_err());
        assert_eq!(connector.connects(), vec![endpoint.ws_url.clone()]);
    }
}
