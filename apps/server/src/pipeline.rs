//! Per-signature trade pipeline: fetch, resolve, analyze, classify, deliver.

use async_trait::async_trait;
use kolwatch_alerts::{DeliveryReport, NotificationRouter};
use kolwatch_core::{AddressBook, RetryPolicy, TradeEvent};
use kolwatch_engine::{
    AccountResolver, BalanceDeltaAnalyzer, Classification, RejectReason, SwapClassifier,
    LOOKUP_TABLE_META_SIZE,
};
use kolwatch_feeds::{ChainRpc, HandlerError, LogEvent, LogHandler, ObservedTransaction, RpcError};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Signatures remembered for deduplication.
pub const RECENT_SIGNATURE_CAPACITY: usize = 4096;

/// Bounded FIFO set of recently seen signatures.
#[derive(Debug)]
pub struct RecentSignatures {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentSignatures {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `signature`. Returns false if it was already present.
    pub fn insert(&mut self, signature: &str) -> bool {
        if self.seen.contains(signature) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(signature.to_string());
        self.seen.insert(signature.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

/// What happened to one signature.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Already processed via another watched address
    Duplicate,
    /// The node never returned the transaction
    NotFound,
    Rejected(RejectReason),
    /// Classified as a trade but not delivered (dry run)
    DryRun(TradeEvent),
    Delivered(DeliveryReport),
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Duplicate => f.write_str("duplicate"),
            PipelineOutcome::NotFound => f.write_str("not found"),
            PipelineOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            PipelineOutcome::DryRun(event) => {
                write!(f, "dry run: {} {}", event.signer_name, event.operation)
            }
            PipelineOutcome::Delivered(report) => write!(
                f,
                "delivered (chat: {}, mail: {})",
                report.chat_delivered(),
                report.mail_delivered()
            ),
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events: AtomicU64,
    pub duplicates: AtomicU64,
    pub not_found: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub trades: AtomicU64,
    pub rejected: AtomicU64,
    pub delivered: AtomicU64,
    pub delivery_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStatsSnapshot {
    pub events: u64,
    pub duplicates: u64,
    pub not_found: u64,
    pub fetch_errors: u64,
    pub trades: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            trades: self.trades.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
        }
    }
}

enum FetchError {
    /// Not visible on the node yet
    Pending,
    Rpc(RpcError),
}

/// Consumes log events of watched addresses and turns trades into alerts.
pub struct TradePipeline {
    rpc: Arc<dyn ChainRpc>,
    resolver: AccountResolver,
    classifier: SwapClassifier,
    router: Arc<NotificationRouter>,
    recent: Mutex<RecentSignatures>,
    /// Retry budget while a fresh transaction is not yet served by the node
    fetch_retry: RetryPolicy,
    dry_run: bool,
    stats: PipelineStats,
}

impl TradePipeline {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        address_book: Arc<AddressBook>,
        router: Arc<NotificationRouter>,
    ) -> Self {
        Self {
            resolver: AccountResolver::new(rpc.clone()).with_table_header(LOOKUP_TABLE_META_SIZE),
            classifier: SwapClassifier::new(address_book),
            rpc,
            router,
            recent: Mutex::new(RecentSignatures::new(RECENT_SIGNATURE_CAPACITY)),
            fetch_retry: RetryPolicy::fixed(3, Duration::from_secs(2)),
            dry_run: false,
            stats: PipelineStats::default(),
        }
    }

    /// Classify and log trades without delivering them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    pub fn classifier(&self) -> &SwapClassifier {
        &self.classifier
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one signature through the whole pipeline.
    pub async fn process(&self, signature: &str) -> Result<PipelineOutcome, RpcError> {
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        let fresh = self
            .recent
            .lock()
            .map(|mut recent| recent.insert(signature))
            .unwrap_or(true);
        if !fresh {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(signature, "Signature already processed");
            return Ok(PipelineOutcome::Duplicate);
        }

        let Some(tx) = self.fetch(signature).await? else {
            self.stats.not_found.fetch_add(1, Ordering::Relaxed);
            warn!(signature, "Transaction not found");
            return Ok(PipelineOutcome::NotFound);
        };

        let event = match self.classify(&tx).await {
            Classification::Trade(event) => event,
            Classification::Rejected(reason) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(PipelineOutcome::Rejected(reason));
            }
        };
        self.stats.trades.fetch_add(1, Ordering::Relaxed);
        info!(
            signature,
            trader = %event.signer_name,
            operation = %event.operation,
            token = %event.target_asset,
            amount = %event.target_change,
            venue = %event.venue,
            "Trade detected"
        );

        if self.dry_run {
            return Ok(PipelineOutcome::DryRun(event));
        }

        let report = self.router.deliver(&event).await;
        if report.any_delivered() {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.delivery_failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(PipelineOutcome::Delivered(report))
    }

    /// Fetch and classify one transaction without dedup or delivery.
    pub async fn check(&self, signature: &str) -> Result<Option<Classification>, RpcError> {
        match self.fetch(signature).await? {
            Some(tx) => Ok(Some(self.classify(&tx).await)),
            None => Ok(None),
        }
    }

    async fn classify(&self, tx: &ObservedTransaction) -> Classification {
        if let Some(reason) = self.classifier.screen(tx) {
            return Classification::Rejected(reason);
        }
        let accounts = self.resolver.resolve_transaction(tx).await;
        let deltas = BalanceDeltaAnalyzer::from_transaction(tx);
        self.classifier.classify(tx, &accounts, &deltas)
    }

    async fn fetch(&self, signature: &str) -> Result<Option<ObservedTransaction>, RpcError> {
        let outcome = self
            .fetch_retry
            .run(
                |_| async move {
                    match self.rpc.get_transaction(signature).await {
                        Ok(Some(tx)) => Ok(tx),
                        Ok(None) => Err(FetchError::Pending),
                        Err(e) => Err(FetchError::Rpc(e)),
                    }
                },
                |e| matches!(e, FetchError::Pending),
            )
            .await;

        match outcome.result {
            Ok(tx) => Ok(Some(tx)),
            Err(FetchError::Pending) => Ok(None),
            Err(FetchError::Rpc(e)) => {
                self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl LogHandler for TradePipeline {
    async fn handle(&self, event: LogEvent) -> Result<(), HandlerError> {
        debug!(address = %event.address, signature = %event.signature, slot = event.slot, "Log event");
        let outcome = self.process(&event.signature).await?;
        debug!(signature = %event.signature, outcome = %outcome, "Signature processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolwatch_alerts::{MockChatSender, MockMailSender, RouterConfig};
    use kolwatch_core::{Operation, Venue, WatchedAddress};
    use kolwatch_feeds::{AddressTableLookup, CompiledInstruction, MockChainRpc, TokenBalance};
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;

    const SIGNER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const STRANGER: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";
    const JUPITER: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
    const MEME: &str = "MemeMint1111111111111111111111111111111111";

    fn swap(signature: &str, signer: &str) -> ObservedTransaction {
        ObservedTransaction {
            signature: signature.to_string(),
            block_time: Some(1_700_000_000),
            fee: 5000,
            static_keys: vec![signer.to_string(), JUPITER.to_string()],
            instructions: vec![CompiledInstruction {
                program_id_index: 1,
                accounts: vec![0],
                data: String::new(),
            }],
            pre_lamports: vec![2_000_000_000, 1],
            post_lamports: vec![1_500_000_000, 1],
            post_token_balances: vec![TokenBalance {
                account_index: 2,
                mint: MEME.to_string(),
                owner: Some(signer.to_string()),
                amount: Some(Decimal::from(1000)),
            }],
            ..Default::default()
        }
    }

    struct Fixture {
        pipeline: TradePipeline,
        chat: Arc<MockChatSender>,
        mail: Arc<MockMailSender>,
    }

    fn fixture(rpc: MockChainRpc) -> Fixture {
        let book = Arc::new(AddressBook::new(vec![
            WatchedAddress::new("Ansem", SIGNER).unwrap()
        ]));
        let chat = Arc::new(MockChatSender::new(9));
        let mail = Arc::new(MockMailSender::new("alerts@example.com"));
        let router = NotificationRouter::new(RouterConfig {
            chat_ids: vec!["-100123".to_string()],
            mail_to: vec!["ops@example.com".to_string()],
            chat_retry: RetryPolicy::immediate(3),
        })
        .with_chat(chat.clone())
        .with_mail_sender(mail.clone());

        let pipeline = TradePipeline::new(Arc::new(rpc), book, Arc::new(router))
            .with_fetch_retry(RetryPolicy::immediate(2));
        Fixture {
            pipeline,
            chat,
            mail,
        }
    }

    #[test]
    fn test_recent_signatures_bounded() {
        let mut recent = RecentSignatures::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        assert_eq!(recent.len(), 2);
        // "a" was evicted
        assert!(recent.insert("a"));
    }

    #[tokio::test]
    async fn test_swap_delivered_once() {
        let f = fixture(MockChainRpc::new().with_transaction(swap("sig1", SIGNER)));

        let outcome = f.pipeline.process("sig1").await.unwrap();
        let PipelineOutcome::Delivered(report) = outcome else {
            panic!("expected delivery, got {:?}", outcome);
        };
        assert!(report.chat_delivered());
        assert!(report.mail_delivered());
        assert_eq!(f.chat.attempts_for("-100123"), 1);
        assert_eq!(f.mail.sent().len(), 1);
        assert!(f.mail.sent()[0].subject.ends_with("Ansem Buy"));

        // Same signature seen through another watched address
        let again = f.pipeline.process("sig1").await.unwrap();
        assert!(matches!(again, PipelineOutcome::Duplicate));
        assert_eq!(f.mail.sent().len(), 1);

        let stats = f.pipeline.stats();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(PipelineOutcome::Duplicate.to_string(), "duplicate");
        assert_eq!(
            PipelineOutcome::Rejected(RejectReason::UnwatchedSigner).to_string(),
            "rejected: signer not watched"
        );
    }

    #[tokio::test]
    async fn test_unwatched_signer_rejected() {
        let f = fixture(MockChainRpc::new().with_transaction(swap("sig2", STRANGER)));

        let outcome = f.pipeline.process("sig2").await.unwrap();

        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::UnwatchedSigner)
        ));
        assert!(f.chat.calls().is_empty());
        assert!(f.mail.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unwatched_signer_skips_lookup_tables() {
        let mut tx = swap("sig6", STRANGER);
        tx.address_table_lookups = vec![AddressTableLookup {
            table_key: JUPITER.to_string(),
            writable_indexes: vec![0],
            readonly_indexes: vec![1],
        }];
        let rpc = Arc::new(MockChainRpc::new().with_transaction(tx));
        let pipeline = TradePipeline::new(
            rpc.clone(),
            Arc::new(AddressBook::new(vec![
                WatchedAddress::new("Ansem", SIGNER).unwrap()
            ])),
            Arc::new(NotificationRouter::new(RouterConfig::default())),
        );

        let outcome = pipeline.process("sig6").await.unwrap();

        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::UnwatchedSigner)
        ));
        assert_eq!(rpc.account_calls(), 0);
        assert_eq!(pipeline.classifier().rejected_count(), 1);
        assert!(pipeline
            .classifier()
            .rule_stats()
            .iter()
            .all(|rule| rule.evaluated == 0));
    }

    #[tokio::test]
    async fn test_missing_transaction_retried_then_not_found() {
        let rpc = Arc::new(MockChainRpc::new());
        let pipeline = TradePipeline::new(
            rpc.clone(),
            Arc::new(AddressBook::default()),
            Arc::new(NotificationRouter::new(RouterConfig::default())),
        )
        .with_fetch_retry(RetryPolicy::immediate(3));

        let outcome = pipeline.process("unknown").await.unwrap();

        assert!(matches!(outcome, PipelineOutcome::NotFound));
        assert_eq!(rpc.fetched_signatures().len(), 3);
        assert_eq!(pipeline.stats().not_found, 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_delivery() {
        let f = fixture(MockChainRpc::new().with_transaction(swap("sig3", SIGNER)));
        let pipeline = f.pipeline.with_dry_run(true);

        let outcome = pipeline.process("sig3").await.unwrap();

        let PipelineOutcome::DryRun(event) = outcome else {
            panic!("expected dry run, got {:?}", outcome);
        };
        assert_eq!(event.operation, Operation::Buy);
        assert_eq!(event.venue, Venue::known("Jupiter"));
        assert_eq!(event.sol_change, Decimal::new(-5, 1));
        assert!(f.chat.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sol_spent_on_token_via_router_alerts_buy() {
        let f = fixture(MockChainRpc::new().with_transaction(swap("sig7", SIGNER)));

        let classification = f.pipeline.check("sig7").await.unwrap().unwrap();
        let event = classification.trade().unwrap();

        assert_eq!(event.sol_change, Decimal::new(-5, 1));
        assert_eq!(event.target_asset, MEME);
        assert_eq!(event.target_change, Decimal::from(1000));
        assert_eq!(event.venue, Venue::known("Jupiter"));
        assert_eq!(event.operation, Operation::Buy);
    }

    #[tokio::test]
    async fn test_check_ignores_dedup() {
        let f = fixture(MockChainRpc::new().with_transaction(swap("sig4", SIGNER)));

        f.pipeline.process("sig4").await.unwrap();
        let classification = f.pipeline.check("sig4").await.unwrap().unwrap();

        assert!(classification.trade().is_some());
        assert!(f.pipeline.check("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handler_forwards_events() {
        let f = fixture(MockChainRpc::new().with_transaction(swap("sig5", SIGNER)));

        f.pipeline
            .handle(LogEvent {
                address: SIGNER.to_string(),
                signature: "sig5".to_string(),
                slot: 1,
            })
            .await
            .unwrap();

        assert_eq!(f.mail.sent().len(), 1);
    }
}
