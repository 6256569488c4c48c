//! Token market data for alert enrichment.
//!
//! Lookups go through a [`RequestRateLimiter`] and a small TTL cache so a burst
//! of trades on one token costs a single upstream request.

use crate::DeliveryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEXSCREENER_API_URL: &str = "https://api.dexscreener.com/latest/dex/tokens";

pub const MARKET_CACHE_CAPACITY: usize = 256;
pub const MARKET_CACHE_TTL: Duration = Duration::from_secs(60);

/// Market snapshot of one token.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    pub symbol: String,
    pub price_usd: f64,
    /// Percent change over the last 24 hours
    pub price_change_24h: f64,
    pub market_cap: f64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch market data for `mint`. `Ok(None)` when the token has no market.
    async fn fetch(&self, mint: &str) -> Result<Option<MarketData>, DeliveryError>;
}

// DexScreener response types

#[derive(Debug, Deserialize)]
struct TokenPairsResponse {
    pairs: Option<Vec<DexPair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexPair {
    base_token: DexToken,
    price_usd: Option<String>,
    price_change: Option<DexPriceChange>,
    market_cap: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DexToken {
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DexPriceChange {
    h24: Option<f64>,
}

impl TokenPairsResponse {
    /// First listed pair wins; missing numbers read as zero.
    fn into_market_data(self) -> Option<MarketData> {
        let pair = self.pairs?.into_iter().next()?;
        Some(MarketData {
            symbol: pair
                .base_token
                .symbol
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            price_usd: pair
                .price_usd
                .and_then(|p| p.parse::<f64>().ok())
                .unwrap_or(0.0),
            price_change_24h: pair.price_change.and_then(|c| c.h24).unwrap_or(0.0),
            market_cap: pair.market_cap.unwrap_or(0.0),
            updated_at: Utc::now(),
        })
    }
}

/// DexScreener token endpoint client.
pub struct DexScreenerClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RequestRateLimiter,
}

impl DexScreenerClient {
    pub fn new() -> Self {
        Self::with_base_url(DEXSCREENER_API_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter: RequestRateLimiter::default(),
        }
    }

    pub fn limiter(&self) -> &RequestRateLimiter {
        &self.limiter
    }
}

impl Default for DexScreenerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataSource for DexScreenerClient {
    async fn fetch(&self, mint: &str) -> Result<Option<MarketData>, DeliveryError> {
        self.limiter.acquire().await?;

        let url = format!("{}/{}", self.base_url, mint);
        debug!(mint, "Fetching market data");
        let response: TokenPairsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.into_market_data())
    }
}

/// Request budget: minimum spacing plus per-minute and per-day caps.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimits {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_second: 5,
            per_minute: 300,
            per_day: 10_000,
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    fn roll(&mut self, now: Instant, length: Duration) {
        if now.saturating_duration_since(self.started) >= length {
            self.started = now;
            self.count = 0;
        }
    }
}

#[derive(Debug)]
struct RateState {
    next_slot: Option<Instant>,
    minute: RateWindow,
    day: RateWindow,
}

/// Outbound request counters.
///
/// Requests are spaced evenly to honor the per-second limit. Going over the
/// minute or day cap is an error rather than a wait.
#[derive(Debug)]
pub struct RequestRateLimiter {
    limits: RateLimits,
    state: Mutex<RateState>,
}

impl RequestRateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let now = Instant::now();
        Self {
            limits,
            state: Mutex::new(RateState {
                next_slot: None,
                minute: RateWindow::new(now),
                day: RateWindow::new(now),
            }),
        }
    }

    /// Reserve a request slot at `now`. Returns how long to wait before sending.
    pub fn try_acquire_at(&self, now: Instant) -> Result<Duration, DeliveryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        state.minute.roll(now, Duration::from_secs(60));
        state.day.roll(now, Duration::from_secs(86_400));

        if state.day.count >= self.limits.per_day {
            return Err(DeliveryError::LimitReached("daily request limit"));
        }
        if state.minute.count >= self.limits.per_minute {
            return Err(DeliveryError::LimitReached("per-minute request limit"));
        }

        let spacing = Duration::from_secs(1) / self.limits.per_second.max(1);
        let slot = match state.next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        state.next_slot = Some(slot + spacing);
        state.minute.count += 1;
        state.day.count += 1;

        Ok(slot - now)
    }

    /// Reserve a slot and sleep until it comes up.
    pub async fn acquire(&self) -> Result<(), DeliveryError> {
        let wait = self.try_acquire_at(Instant::now())?;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Requests counted in the current (minute, day) windows.
    pub fn counts(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.minute.count, state.day.count)
    }
}

impl Default for RequestRateLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}

/// Bounded TTL cache in front of a [`MarketDataSource`].
///
/// Only successful lookups are cached. Failures are logged and read as
/// "no market data".
pub struct MarketLookup {
    source: Arc<dyn MarketDataSource>,
    cache: DashMap<String, (Instant, MarketData)>,
    capacity: usize,
    ttl: Duration,
}

impl MarketLookup {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self::with_limits(source, MARKET_CACHE_CAPACITY, MARKET_CACHE_TTL)
    }

    pub fn with_limits(source: Arc<dyn MarketDataSource>, capacity: usize, ttl: Duration) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub async fn lookup(&self, mint: &str) -> Option<MarketData> {
        if let Some(entry) = self.cache.get(mint) {
            let (stored, data) = entry.value();
            if stored.elapsed() < self.ttl {
                return Some(data.clone());
            }
        }

        match self.source.fetch(mint).await {
            Ok(Some(data)) => {
                self.insert(mint, data.clone());
                Some(data)
            }
            Ok(None) => {
                debug!(mint, "No market listed for token");
                None
            }
            Err(e) => {
                warn!(mint, error = %e, "Market data lookup failed");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn insert(&self, mint: &str, data: MarketData) {
        if self.cache.len() >= self.capacity && !self.cache.contains_key(mint) {
            self.cache.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        }
        if self.cache.len() >= self.capacity && !self.cache.contains_key(mint) {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(mint.to_string(), (Instant::now(), data));
    }
}

/// In-memory `MarketDataSource`.
#[derive(Debug, Default)]
pub struct MockMarketData {
    data: HashMap<String, MarketData>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, mint: &str, data: MarketData) -> Self {
        self.data.insert(mint.to_string(), data);
        self
    }

    /// Every fetch fails with a transport error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for MockMarketData {
    async fn fetch(&self, mint: &str) -> Result<Option<MarketData>, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DeliveryError::Transport("connection refused".to_string()));
        }
        Ok(self.data.get(mint).cloned())
    }
}
