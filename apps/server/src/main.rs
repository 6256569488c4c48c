//! KOL Monitor - Headless Server
//!
//! Watches KOL wallets on Solana and alerts on their trades.

mod config;
mod pipeline;
mod status_notifier;

use clap::Parser;
use config::{AppConfig, ConfigError};
use pipeline::TradePipeline;
use status_notifier::{start_status_notifier, StatusEvent, StatusNotifierConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use kolwatch_alerts::{
    ChatSender, DeliveryError, DexScreenerClient, MarketLookup, NotificationRouter, RouterConfig,
    SmtpMailSender, TelegramChatSender,
};
use kolwatch_core::RetryPolicy;
use kolwatch_engine::{Classification, SwapClassifier};
use kolwatch_feeds::{
    BatchSubscriptionConfig, ChainRpc, MonitorConfig, PubsubLogConnector, RpcEndpointPool, RpcError,
    SolanaRpcClient, SolanaRpcConfig, SubscriptionError, SubscriptionManager, SubscriptionStats,
};

/// KOL Monitor CLI
#[derive(Parser, Debug)]
#[command(name = "kolwatch")]
#[command(about = "Solana KOL wallet trade alerts", long_about = None)]
struct Args {
    /// Log level: trace, debug, info, warn, error (RUST_LOG overrides)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Subscriptions issued per batch
    #[arg(long, default_value_t = 5)]
    batch_size: usize,

    /// Pause between subscription batches in milliseconds
    #[arg(long, default_value_t = 1000)]
    batch_delay_ms: u64,

    /// Interval of the RPC liveness check in seconds
    #[arg(long, default_value_t = 60)]
    liveness_interval_secs: u64,

    /// Delay between chat delivery attempts in milliseconds
    #[arg(long, default_value_t = 5000)]
    retry_delay_ms: u64,

    /// Interval of the stats log line in seconds
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,

    /// Classify and log trades without delivering alerts
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Classify a single transaction, print the outcome and exit
    #[arg(long)]
    check_signature: Option<String>,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

fn parse_level(level: &str) -> Level {
    match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(level).as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn validate_args(args: &Args) -> Result<(), ConfigError> {
    if args.batch_size == 0 {
        return Err(ConfigError::Invalid {
            key: "--batch-size",
            reason: "must be at least 1".to_string(),
        });
    }
    if args.liveness_interval_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "--liveness-interval-secs",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn build_router(
    config: &AppConfig,
    chat: Option<Arc<TelegramChatSender>>,
    retry_delay: Duration,
) -> Result<NotificationRouter, DeliveryError> {
    let router_config = RouterConfig {
        chat_ids: config
            .telegram
            .as_ref()
            .map(|t| t.chat_ids.clone())
            .unwrap_or_default(),
        mail_to: config
            .mail
            .as_ref()
            .map(|m| m.recipients.clone())
            .unwrap_or_default(),
        chat_retry: RetryPolicy::fixed(3, retry_delay),
    };

    let mut router = NotificationRouter::new(router_config)
        .with_market_data(MarketLookup::new(Arc::new(DexScreenerClient::new())));
    if let Some(chat) = chat {
        router = router.with_chat(chat);
    }
    if let Some(mail) = &config.mail {
        for account in &mail.accounts {
            let sender = SmtpMailSender::new(&mail.smtp_host, &account.user, &account.password)?;
            router = router.with_mail_sender(Arc::new(sender));
        }
    }
    Ok(router)
}

async fn check_signature(
    pipeline: &TradePipeline,
    router: &NotificationRouter,
    signature: &str,
) -> Result<(), AppError> {
    match pipeline.check(signature).await? {
        Some(Classification::Trade(event)) => {
            info!(signature, operation = %event.operation, venue = %event.venue, "Transaction is a trade");
            let message = router.render(&event).await;
            println!("{}", message.text);
        }
        Some(Classification::Rejected(reason)) => {
            info!(signature, reason = %reason, "Transaction is not an alertable trade");
        }
        None => warn!(signature, "Transaction not found"),
    }
    Ok(())
}

fn log_stats(pipeline: &TradePipeline, subscriptions: &SubscriptionStats) {
    let p = pipeline.stats();
    let s = subscriptions.snapshot();
    info!(
        received = s.received,
        skipped_failed = s.skipped_failed,
        dropped = s.dropped,
        reconnects = s.reconnects,
        trades = p.trades,
        rejected = p.rejected,
        duplicates = p.duplicates,
        delivered = p.delivered,
        delivery_failed = p.delivery_failed,
        "📊 Stats"
    );
    log_rule_stats(pipeline.classifier());
}

fn log_rule_stats(classifier: &SwapClassifier) {
    for rule in classifier.rule_stats() {
        info!(
            rule = rule.rule,
            evaluated = rule.evaluated,
            matched = rule.matched,
            "Detection rule"
        );
    }
}

async fn run_stats_reporter(
    pipeline: Arc<TradePipeline>,
    subscriptions: Arc<SubscriptionStats>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&pipeline, &subscriptions),
            _ = shutdown.changed() => break,
        }
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    validate_args(&args)?;
    let config = AppConfig::from_env()?;

    info!("🚀 KOL Monitor starting...");
    info!("  Watched wallets: {}", config.address_book.len());
    info!("  RPC endpoints: {}", config.rpc_endpoints.len());
    info!("  Chat delivery: {}", config.has_chat());
    info!("  Mail delivery: {}", config.has_mail());
    info!("  Dry Run: {}", args.dry_run);

    let pool = Arc::new(
        RpcEndpointPool::new(config.rpc_endpoints.clone()).map_err(|_| ConfigError::NoRpcEndpoint)?,
    );
    let rpc: Arc<dyn ChainRpc> = Arc::new(SolanaRpcClient::new(pool.clone(), SolanaRpcConfig::default()));

    let chat = match &config.telegram {
        Some(telegram) => {
            let sender = Arc::new(TelegramChatSender::new(&telegram.bot_token)?);
            match sender.verify().await {
                Ok(username) => info!(bot = %username, "Telegram bot verified"),
                Err(e) => warn!(error = %e, "Telegram bot check failed, continuing"),
            }
            Some(sender)
        }
        None => None,
    };

    let router = Arc::new(build_router(
        &config,
        chat.clone(),
        Duration::from_millis(args.retry_delay_ms),
    )?);
    let address_book = Arc::new(config.address_book.clone());
    let pipeline = Arc::new(
        TradePipeline::new(rpc.clone(), address_book.clone(), router.clone())
            .with_dry_run(args.dry_run),
    );

    if let Some(signature) = &args.check_signature {
        return check_signature(&pipeline, &router, signature).await;
    }

    let status_chat = config
        .telegram
        .as_ref()
        .and_then(|t| t.status_chat_id.clone());
    let status = match (status_chat, &chat) {
        (Some(chat_id), Some(chat)) => {
            info!("Status notifier enabled");
            let sender: Arc<dyn ChatSender> = chat.clone();
            Some(start_status_notifier(StatusNotifierConfig::new(chat_id), sender))
        }
        _ => {
            info!("Status notifier disabled (TELEGRAM_STATUS_CHAT_ID not set)");
            None
        }
    };

    let monitor_config = MonitorConfig {
        batch: BatchSubscriptionConfig::new(args.batch_size, args.batch_delay_ms),
        liveness_interval: Duration::from_secs(args.liveness_interval_secs),
        ..Default::default()
    };
    let shutdown_timeout = monitor_config.shutdown_timeout;
    let addresses: Vec<String> = address_book.iter().map(|a| a.public_key.clone()).collect();
    for watched in address_book.iter() {
        info!("    - {} ({})", watched.display_name, watched.public_key);
    }

    let mut manager = SubscriptionManager::new(
        addresses,
        pool,
        rpc,
        Arc::new(PubsubLogConnector::default()),
        monitor_config,
    );
    if let Some(status) = &status {
        let (event_tx, event_rx) = mpsc::channel(32);
        manager = manager.with_event_sender(event_tx);
        status.forward(event_rx);
        status
            .send(StatusEvent::Started {
                addresses: address_book.len(),
            })
            .await;
    }
    let subscription_stats = manager.stats();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut monitor_handle = tokio::spawn(manager.run(pipeline.clone(), shutdown_rx.clone()));
    let stats_handle = tokio::spawn(run_stats_reporter(
        pipeline.clone(),
        subscription_stats.clone(),
        Duration::from_secs(args.stats_interval_secs.max(1)),
        shutdown_rx,
    ));

    // Handle shutdown
    info!("Press Ctrl+C to stop...");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            warn!("Shutdown signal received");
        }
        result = &mut monitor_handle => {
            // The monitor only returns on its own for unrecoverable errors
            match result {
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(_)) => warn!("Monitor exited"),
                Err(e) => error!(error = %e, "Monitor task failed"),
            }
        }
    }

    if let Some(status) = &status {
        status.send(StatusEvent::Stopping).await;
    }
    let _ = shutdown_tx.send(true);

    // Wait for tasks with timeout, then abort
    let grace = shutdown_timeout + Duration::from_secs(2);
    if !monitor_handle.is_finished() {
        match tokio::time::timeout(grace, &mut monitor_handle).await {
            Ok(Ok(Ok(snapshot))) => info!(
                received = snapshot.received,
                dispatched = snapshot.dispatched,
                "Monitor stopped"
            ),
            Ok(Ok(Err(e))) => warn!(error = %e, "Monitor stopped with error"),
            Ok(Err(e)) => error!(error = %e, "Monitor task failed"),
            Err(_) => {
                warn!("Monitor did not stop in time, aborting");
                monitor_handle.abort();
            }
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), stats_handle).await;

    // Final stats
    let summary = pipeline.stats();
    info!("📈 Final Stats:");
    info!("  Log events: {}", summary.events);
    info!("  Trades: {}", summary.trades);
    info!("  Rejected: {}", summary.rejected);
    info!("  Alerts delivered: {}", summary.delivered);
    info!("  Delivery failures: {}", summary.delivery_failed);
    log_rule_stats(pipeline.classifier());

    info!("👋 KOL Monitor stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level);

    if let Err(e) = run(args).await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["kolwatch"]);
        assert_eq!(args.batch_size, 5);
        assert_eq!(args.batch_delay_ms, 1000);
        assert_eq!(args.liveness_interval_secs, 60);
        assert!(!args.dry_run);
        assert!(args.check_signature.is_none());
        assert!(validate_args(&args).is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let args = Args::parse_from(["kolwatch", "--batch-size", "0"]);
        assert!(matches!(
            validate_args(&args),
            Err(ConfigError::Invalid { key: "--batch-size", .. })
        ));
    }

    #[test]
    fn test_check_signature_flag() {
        let args = Args::parse_from(["kolwatch", "--check-signature", "5abc", "--dry-run"]);
        assert_eq!(args.check_signature.as_deref(), Some("5abc"));
        assert!(args.dry_run);
    }
}
