//! Per-address log subscriptions with batching, liveness probing and
//! endpoint rotation.
//!
//! ## Architecture
//!
//! - One `logsSubscribe` per watched address, issued in batches with a
//!   pause between batches
//! - Notifications are routed by subscription id to a bounded
//!   `mpsc` channel per address
//! - Each address has one consumer task that runs the [`LogHandler`]
//!   sequentially, so addresses never block each other
//! - A periodic `getVersion` check detects dead connections; the manager
//!   then rotates the [`RpcEndpointPool`], reconnects and resubscribes

use crate::{ChainRpc, LogNotification, LogStream, LogStreamConnector, RpcEndpointPool, RpcError};
use async_trait::async_trait;
use kolwatch_core::{RetryPolicy, RetryState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default buffer size for each per-address event channel.
pub const SUBSCRIPTION_CHANNEL_BUFFER: usize = 256;

/// A log event for a watched address, ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Watched address whose subscription fired
    pub address: String,
    pub signature: String,
    pub slot: u64,
}

/// Error type returned by log handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of log events. Errors and panics are caught by the manager.
#[async_trait]
pub trait LogHandler: Send + Sync + 'static {
    async fn handle(&self, event: LogEvent) -> Result<(), HandlerError>;
}

/// Errors that stop the subscription manager from starting.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("No addresses to subscribe")]
    NoAddresses,
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

/// Configuration for batch subscription processing.
///
/// ## Example
///
/// ```rust
/// use kolwatch_feeds::BatchSubscriptionConfig;
///
/// // Default: 5 addresses per batch, 1 second apart
/// let config = BatchSubscriptionConfig::default();
/// assert_eq!(config.batch_count(12), 3);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BatchSubscriptionConfig {
    /// Maximum subscriptions per batch
    pub batch_size: usize,
    /// Delay between batches in milliseconds
    pub batch_delay_ms: u64,
}

impl BatchSubscriptionConfig {
    pub const fn new(batch_size: usize, batch_delay_ms: u64) -> Self {
        Self {
            batch_size,
            batch_delay_ms,
        }
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Number of batches needed for `count` addresses.
    pub fn batch_count(&self, count: usize) -> usize {
        if count == 0 {
            0
        } else {
            count.div_ceil(self.batch_size.max(1))
        }
    }

    /// Total pause time spent between batches.
    pub fn estimated_duration(&self, count: usize) -> Duration {
        let batches = self.batch_count(count);
        if batches <= 1 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.batch_delay_ms * (batches as u64 - 1))
        }
    }
}

impl Default for BatchSubscriptionConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay_ms: 1000,
        }
    }
}

/// Result of a batch subscription operation.
#[derive(Debug, Clone, Default)]
pub struct BatchSubscriptionResult {
    pub total_requested: usize,
    pub subscribed: usize,
    pub batches_processed: usize,
    /// Addresses that failed to subscribe
    pub failed: Vec<String>,
}

impl BatchSubscriptionResult {
    pub fn is_complete(&self) -> bool {
        self.subscribed == self.total_requested && self.failed.is_empty()
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_requested == 0 {
            100.0
        } else {
            (self.subscribed as f64 / self.total_requested as f64) * 100.0
        }
    }
}

/// Connection lifecycle events, for status notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// First successful connection and subscription
    Connected { endpoint: String, subscribed: usize },
    /// Reconnected after a failure
    Reconnected { endpoint: String, subscribed: usize },
    /// Connection declared dead
    ConnectionLost { endpoint: String, reason: String },
    /// Switched to another endpoint
    Rotated { endpoint: String, wrapped: bool },
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub batch: BatchSubscriptionConfig,
    /// Interval of the `getVersion` liveness check
    pub liveness_interval: Duration,
    /// Backoff between reconnect attempts
    pub reconnect: RetryPolicy,
    /// Capacity of each per-address event channel
    pub channel_capacity: usize,
    /// Upper bound on best-effort unsubscribe during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            batch: BatchSubscriptionConfig::default(),
            liveness_interval: Duration::from_secs(60),
            reconnect: RetryPolicy::exponential(
                10,
                Duration::from_secs(15),
                Duration::from_secs(300),
            ),
            channel_capacity: SUBSCRIPTION_CHANNEL_BUFFER,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters for the subscription loop.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    pub received: AtomicU64,
    pub skipped_failed: AtomicU64,
    pub dispatched: AtomicU64,
    pub dropped: AtomicU64,
    pub handler_errors: AtomicU64,
    pub handler_panics: AtomicU64,
    pub reconnects: AtomicU64,
}

impl SubscriptionStats {
    pub fn snapshot(&self) -> SubscriptionStatsSnapshot {
        SubscriptionStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped_failed: self.skipped_failed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SubscriptionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionStatsSnapshot {
    pub received: u64,
    pub skipped_failed: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
    pub reconnects: u64,
}

enum PumpExit {
    Shutdown,
    Dead(String),
}

/// Owns the per-address subscriptions and keeps them alive across reconnects.
pub struct SubscriptionManager {
    addresses: Vec<String>,
    pool: Arc<RpcEndpointPool>,
    rpc: Arc<dyn ChainRpc>,
    connector: Arc<dyn LogStreamConnector>,
    config: MonitorConfig,
    /// Subscription id -> address for the current connection
    active: HashMap<u64, String>,
    dispatchers: HashMap<String, mpsc::Sender<LogEvent>>,
    events: Option<mpsc::Sender<MonitorEvent>>,
    stats: Arc<SubscriptionStats>,
}

impl SubscriptionManager {
    pub fn new(
        addresses: Vec<String>,
        pool: Arc<RpcEndpointPool>,
        rpc: Arc<dyn ChainRpc>,
        connector: Arc<dyn LogStreamConnector>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            addresses,
            pool,
            rpc,
            connector,
            config,
            active: HashMap::new(),
            dispatchers: HashMap::new(),
            events: None,
            stats: Arc::new(SubscriptionStats::default()),
        }
    }

    /// Forward lifecycle events to `tx`.
    pub fn with_event_sender(mut self, tx: mpsc::Sender<MonitorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<SubscriptionStats> {
        self.stats.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active.len()
    }

    /// Subscribe every address, `batch_size` at a time with a pause between batches.
    pub async fn subscribe_all(&mut self, stream: &mut dyn LogStream) -> BatchSubscriptionResult {
        let batch = self.config.batch;
        let total = self.addresses.len();
        let batch_count = batch.batch_count(total);
        let mut result = BatchSubscriptionResult {
            total_requested: total,
            ..Default::default()
        };

        for chunk in self.addresses.chunks(batch.batch_size.max(1)) {
            for address in chunk {
                match stream.subscribe(address).await {
                    Ok(id) => {
                        debug!(address = %address, subscription = id, "Subscribed to logs");
                        self.active.insert(id, address.clone());
                        result.subscribed += 1;
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "Subscription failed");
                        result.failed.push(address.clone());
                    }
                }
            }
            result.batches_processed += 1;

            // Delay before next batch (except for last batch)
            if result.batches_processed < batch_count {
                debug!(
                    batch = result.batches_processed,
                    total_batches = batch_count,
                    "Waiting before next subscription batch"
                );
                tokio::time::sleep(batch.batch_delay()).await;
            }
        }

        info!(
            subscribed = result.subscribed,
            total = total,
            batches = result.batches_processed,
            "Log subscriptions issued"
        );
        result
    }

    /// Best-effort unsubscribe of every active subscription, bounded by the shutdown timeout.
    pub async fn unsubscribe_all(&mut self, stream: &mut dyn LogStream) {
        let ids: Vec<u64> = self.active.keys().copied().collect();
        let released = tokio::time::timeout(self.config.shutdown_timeout, async {
            let mut released = 0usize;
            for id in ids {
                match stream.unsubscribe(id).await {
                    Ok(()) => released += 1,
                    Err(e) => warn!(subscription = id, error = %e, "Unsubscribe failed"),
                }
            }
            released
        })
        .await;

        match released {
            Ok(count) => info!(released = count, "Log subscriptions released"),
            Err(_) => warn!("Timed out releasing log subscriptions"),
        }
        self.active.clear();
    }

    /// Route a notification to its address's consumer.
    pub fn dispatch(&self, notification: LogNotification) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let Some(address) = self.active.get(&notification.subscription) else {
            debug!(
                subscription = notification.subscription,
                "Notification for unknown subscription"
            );
            return;
        };

        if notification.failed {
            self.stats.skipped_failed.fetch_add(1, Ordering::Relaxed);
            debug!(signature = %notification.signature, "Skipping failed transaction");
            return;
        }

        let Some(sender) = self.dispatchers.get(address) else {
            return;
        };

        let event = LogEvent {
            address: address.clone(),
            signature: notification.signature,
            slot: notification.slot,
        };
        match sender.try_send(event) {
            Ok(()) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    address = %event.address,
                    signature = %event.signature,
                    "Event queue full, dropping log event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(address = %address, "Event consumer stopped");
            }
        }
    }

    /// Start one consumer task per address.
    fn spawn_consumers(&mut self, handler: Arc<dyn LogHandler>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.addresses.len());
        for address in &self.addresses {
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
            self.dispatchers.insert(address.clone(), tx);
            handles.push(tokio::spawn(consume(
                address.clone(),
                rx,
                handler.clone(),
                self.stats.clone(),
            )));
        }
        handles
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(ref tx) = self.events {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "Monitor event not delivered");
            }
        }
    }

    fn rotate(&self) {
        let rotation = self.pool.rotate();
        self.emit(MonitorEvent::Rotated {
            endpoint: self.pool.current().redacted(),
            wrapped: rotation.wrapped,
        });
    }

    /// Connect to the current endpoint and confirm it answers the liveness check.
    async fn connect(&self) -> Result<Box<dyn LogStream>, RpcError> {
        let endpoint = self.pool.current().clone();
        info!(endpoint = %endpoint.redacted(), "Connecting to RPC endpoint");
        let stream = self.connector.connect(&endpoint).await?;
        let version = tokio::time::timeout(self.liveness_timeout(), self.rpc.get_version())
            .await
            .map_err(|_| RpcError::Timeout("getVersion check".to_string()))??;
        info!(
            endpoint = %endpoint.redacted(),
            version = %version.solana_core,
            "RPC endpoint healthy"
        );
        Ok(stream)
    }

    /// Upper bound on one liveness check, so a slow node cannot stall notification reads.
    fn liveness_timeout(&self) -> Duration {
        (self.config.liveness_interval / 2).max(Duration::from_millis(1))
    }

    /// Process notifications until shutdown or until the connection is declared dead.
    async fn pump(
        &mut self,
        stream: &mut dyn LogStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        liveness.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return PumpExit::Shutdown;
                    }
                }
                _ = liveness.tick() => {
                    match tokio::time::timeout(self.liveness_timeout(), self.rpc.get_version()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => return PumpExit::Dead(format!("liveness check failed: {e}")),
                        Err(_) => return PumpExit::Dead("liveness check timed out".to_string()),
                    }
                }
                notification = stream.next_notification() => match notification {
                    Ok(notification) => self.dispatch(notification),
                    Err(e) => return PumpExit::Dead(e.to_string()),
                },
            }
        }
    }

    /// Wait for `delay` unless shutdown is requested first. Returns true on shutdown.
    async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Connection failures never end the loop: the manager rotates to the
    /// next endpoint, backs off and tries again.
    pub async fn run(
        mut self,
        handler: Arc<dyn LogHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SubscriptionStatsSnapshot, SubscriptionError> {
        if self.addresses.is_empty() {
            return Err(SubscriptionError::NoAddresses);
        }

        let consumers = self.spawn_consumers(handler);
        let mut reconnect = RetryState::new();
        let mut connected_once = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut stream = match self.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    reconnect.record_failure();
                    let delay = reconnect.next_delay(&self.config.reconnect);
                    warn!(
                        endpoint = %self.pool.current().redacted(),
                        attempt = reconnect.attempt_count(),
                        error = %e,
                        "Connection attempt failed, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    self.rotate();
                    if reconnect.is_exhausted(&self.config.reconnect) {
                        error!(
                            attempts = reconnect.attempt_count(),
                            total_failures = reconnect.total_failures(),
                            "Reconnect budget exhausted, restarting backoff"
                        );
                        reconnect.record_success();
                    }
                    if Self::pause(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let result = self.subscribe_all(stream.as_mut()).await;
            if result.subscribed == 0 {
                reconnect.record_failure();
                warn!(failed = result.failed.len(), "No subscription succeeded, switching endpoint");
                self.rotate();
                if Self::pause(reconnect.next_delay(&self.config.reconnect), &mut shutdown).await {
                    break;
                }
                continue;
            }

            reconnect.record_success();
            let endpoint = self.pool.current().redacted();
            if connected_once {
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(endpoint = %endpoint, subscribed = result.subscribed, "Resubscribed after reconnect");
                self.emit(MonitorEvent::Reconnected {
                    endpoint,
                    subscribed: result.subscribed,
                });
            } else {
                self.emit(MonitorEvent::Connected {
                    endpoint,
                    subscribed: result.subscribed,
                });
            }
            connected_once = true;

            match self.pump(stream.as_mut(), &mut shutdown).await {
                PumpExit::Shutdown => {
                    info!("Shutdown requested, releasing subscriptions");
                    self.unsubscribe_all(stream.as_mut()).await;
                    break;
                }
                PumpExit::Dead(reason) => {
                    let endpoint = self.pool.current().redacted();
                    warn!(endpoint = %endpoint, reason = %reason, "Connection lost");
                    self.emit(MonitorEvent::ConnectionLost { endpoint, reason });
                    self.active.clear();
                    reconnect.record_failure();
                    self.rotate();
                    if Self::pause(reconnect.next_delay(&self.config.reconnect), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // Closing the channels lets consumers drain and exit
        self.dispatchers.clear();
        for handle in consumers {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("Event consumer did not finish in time, aborting");
                abort.abort();
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            received = snapshot.received,
            dispatched = snapshot.dispatched,
            reconnects = snapshot.reconnects,
            "Subscription manager stopped"
        );
        Ok(snapshot)
    }
}

/// Run the handler for each event of one address, in order.
async fn consume(
    address: String,
    mut rx: mpsc::Receiver<LogEvent>,
    handler: Arc<dyn LogHandler>,
    stats: Arc<SubscriptionStats>,
) {
    while let Some(event) = rx.recv().await {
        let signature = event.signature.clone();
        let handler = handler.clone();
        // A separate task isolates handler panics from this loop
        match tokio::spawn(async move { handler.handle(event).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(address = %address, signature = %signature, error = %e, "Log handler failed");
            }
            Err(e) => {
                stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!(address = %address, signature = %signature, error = %e, "Log handler panicked");
            }
        }
    }
    debug!(address = %address, "Event consumer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockChainRpc, MockLogConnector, RpcEndpoint};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<LogEvent>>,
    }

    impl RecordingHandler {
        fn signatures(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.signature.clone())
                .collect()
        }
    }

    #[async_trait]
    impl LogHandler for RecordingHandler {
        async fn handle(&self, event: LogEvent) -> Result<(), HandlerError> {
            if event.signature == "panic" {
                panic!("handler blew up");
            }
            if event.signature == "error" {
                return Err("handler error".into());
            }
            if event.signature == "slow" {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Wallet{i}")).collect()
    }

    fn test_pool(n: usize) -> Arc<RpcEndpointPool> {
        Arc::new(
            RpcEndpointPool::new(
                (0..n)
                    .map(|i| RpcEndpoint::from_http(&format!("https://node{i}.example.com")))
                    .collect(),
            )
            .unwrap(),
        )
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            batch: BatchSubscriptionConfig::new(2, 0),
            liveness_interval: Duration::from_millis(20),
            reconnect: RetryPolicy::fixed(10, Duration::from_millis(5)),
            channel_capacity: 16,
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    struct Harness {
        connector: MockLogConnector,
        rpc: Arc<MockChainRpc>,
        pool: Arc<RpcEndpointPool>,
        handler: Arc<RecordingHandler>,
        stats: Arc<SubscriptionStats>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<Result<SubscriptionStatsSnapshot, SubscriptionError>>,
    }

    fn start(address_count: usize, endpoint_count: usize, connector: MockLogConnector) -> Harness {
        start_with(address_count, endpoint_count, connector, test_config())
    }

    fn start_with(
        address_count: usize,
        endpoint_count: usize,
        connector: MockLogConnector,
        config: MonitorConfig,
    ) -> Harness {
        let rpc = Arc::new(MockChainRpc::new());
        let pool = test_pool(endpoint_count);
        let handler = Arc::new(RecordingHandler::default());
        let manager = SubscriptionManager::new(
            addresses(address_count),
            pool.clone(),
            rpc.clone(),
            Arc::new(connector.clone()),
            config,
        );
        let stats = manager.stats();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(handler.clone(), rx));
        Harness {
            connector,
            rpc,
            pool,
            handler,
            stats,
            shutdown,
            task,
        }
    }

    #[test]
    fn test_batch_config_counts() {
        let config = BatchSubscriptionConfig::new(5, 1000);
        assert_eq!(config.batch_count(0), 0);
        assert_eq!(config.batch_count(5), 1);
        assert_eq!(config.batch_count(11), 3);
        assert_eq!(config.estimated_duration(11), Duration::from_secs(2));
        assert_eq!(config.estimated_duration(3), Duration::ZERO);
    }

    #[test]
    fn test_batch_result_rates() {
        let result = BatchSubscriptionResult {
            total_requested: 4,
            subscribed: 3,
            batches_processed: 2,
            failed: vec!["Wallet3".to_string()],
        };
        assert!(!result.is_complete());
        assert_eq!(result.success_rate(), 75.0);
        assert_eq!(BatchSubscriptionResult::default().success_rate(), 100.0);
    }

    #[tokio::test]
    async fn test_subscribe_all_in_batches() {
        let connector = MockLogConnector::new();
        let mut manager = SubscriptionManager::new(
            addresses(5),
            test_pool(1),
            Arc::new(MockChainRpc::new()),
            Arc::new(connector.clone()),
            test_config(),
        );
        let mut stream = connector
            .connect(&RpcEndpoint::public_mainnet())
            .await
            .unwrap();

        let result = manager.subscribe_all(stream.as_mut()).await;

        assert!(result.is_complete());
        assert_eq!(result.subscribed, 5);
        assert_eq!(result.batches_processed, 3);
        assert_eq!(manager.active_subscriptions(), 5);
        assert_eq!(connector.subscribed_addresses().len(), 5);
    }

    #[tokio::test]
    async fn test_no_addresses_is_an_error() {
        let manager = SubscriptionManager::new(
            vec![],
            test_pool(1),
            Arc::new(MockChainRpc::new()),
            Arc::new(MockLogConnector::new()),
            test_config(),
        );
        let (_tx, rx) = watch::channel(false);
        let result = manager
            .run(Arc::new(RecordingHandler::default()), rx)
            .await;
        assert!(matches!(result, Err(SubscriptionError::NoAddresses)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_reach_handler_and_failed_are_skipped() {
        let h = start(3, 1, MockLogConnector::new());
        wait_until(|| h.connector.subscribed_addresses().len() == 3).await;

        assert!(h.connector.emit("Wallet0", "sig-ok", false));
        assert!(h.connector.emit("Wallet1", "sig-failed", true));
        assert!(h.connector.emit("Wallet2", "sig-ok-2", false));

        wait_until(|| h.handler.signatures().len() == 2).await;
        let mut seen = h.handler.signatures();
        seen.sort();
        assert_eq!(seen, vec!["sig-ok".to_string(), "sig-ok-2".to_string()]);
        assert_eq!(h.stats.skipped_failed.load(Ordering::Relaxed), 1);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handler_errors_and_panics_do_not_stop_loop() {
        let h = start(1, 1, MockLogConnector::new());
        wait_until(|| h.connector.subscribed_addresses().len() == 1).await;

        h.connector.emit("Wallet0", "panic", false);
        h.connector.emit("Wallet0", "error", false);
        h.connector.emit("Wallet0", "after", false);

        wait_until(|| h.handler.signatures() == vec!["after".to_string()]).await;
        assert_eq!(h.stats.handler_panics.load(Ordering::Relaxed), 1);
        assert_eq!(h.stats.handler_errors.load(Ordering::Relaxed), 1);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_failure_rotates_to_next_endpoint() {
        let connector = MockLogConnector::new();
        connector.fail_endpoint("wss://node0.example.com");
        let h = start(2, 3, connector);

        wait_until(|| h.connector.subscribed_addresses().len() == 2).await;
        assert_eq!(h.pool.current_index(), 1);
        assert_eq!(
            h.connector.connects(),
            vec![
                "wss://node0.example.com".to_string(),
                "wss://node1.example.com".to_string()
            ]
        );

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_liveness_failure_rotates_and_resubscribes() {
        let h = start(2, 2, MockLogConnector::new());
        wait_until(|| h.connector.subscribed_addresses().len() == 2).await;

        h.rpc.version_fails.store(true, Ordering::SeqCst);
        wait_until(|| h.connector.connects().len() >= 2).await;
        h.rpc.version_fails.store(false, Ordering::SeqCst);

        wait_until(|| h.stats.reconnects.load(Ordering::Relaxed) >= 1).await;
        let connects = h.connector.connects();
        assert_eq!(connects[0], "wss://node0.example.com");
        assert_eq!(connects[1], "wss://node1.example.com");
        assert_eq!(h.connector.subscribed_addresses().len(), 2);

        // Events flow on the new connection
        assert!(h.connector.emit("Wallet1", "after-rotation", false));
        wait_until(|| h.handler.signatures() == vec!["after-rotation".to_string()]).await;

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_triggers_resubscribe() {
        let h = start(1, 1, MockLogConnector::new());
        wait_until(|| h.connector.subscribed_addresses().len() == 1).await;

        h.connector.disconnect();
        wait_until(|| h.stats.reconnects.load(Ordering::Relaxed) == 1).await;
        assert_eq!(h.connector.connects().len(), 2);
        assert_eq!(h.pool.current_index(), 0);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_releases_subscriptions() {
        let h = start(3, 1, MockLogConnector::new());
        wait_until(|| h.connector.subscribed_addresses().len() == 3).await;

        h.shutdown.send(true).unwrap();
        let snapshot = h.task.await.unwrap().unwrap();

        let mut released = h.connector.unsubscribed();
        released.sort();
        assert_eq!(released, vec![1, 2, 3]);
        assert_eq!(snapshot.reconnects, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hanging_liveness_check_is_bounded() {
        let h = start(1, 2, MockLogConnector::new());
        wait_until(|| h.connector.subscribed_addresses().len() == 1).await;

        h.rpc.version_hangs.store(true, Ordering::SeqCst);
        wait_until(|| h.connector.connects().len() >= 2).await;
        h.rpc.version_hangs.store(false, Ordering::SeqCst);

        wait_until(|| h.stats.reconnects.load(Ordering::Relaxed) >= 1).await;
        assert!(h.connector.emit("Wallet0", "after-hang", false));
        wait_until(|| h.handler.signatures() == vec!["after-hang".to_string()]).await;

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_consumer_aborted_on_shutdown() {
        let config = MonitorConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let h = start_with(1, 1, MockLogConnector::new(), config);
        wait_until(|| h.connector.subscribed_addresses().len() == 1).await;

        assert!(h.connector.emit("Wallet0", "slow", false));
        assert!(h.connector.emit("Wallet0", "queued", false));
        wait_until(|| h.stats.dispatched.load(Ordering::Relaxed) == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();

        // The slow handler finishes on its own task, the queued event is never handled
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.handler.signatures(), vec!["slow".to_string()]);
    }
}
