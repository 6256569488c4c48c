//! Reusable retry policy shared by RPC and delivery calls.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// How long to wait between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum DelayStrategy {
    /// Same delay after every failed attempt.
    Fixed(Duration),
    /// Doubling delay capped at `max`, with optional 0-25% jitter.
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },
}

/// Bounded retry policy parameterized by attempt budget and delay strategy.
///
/// ## Example
///
/// ```rust
/// use kolwatch_core::RetryPolicy;
/// use std::time::Duration;
///
/// // Chat delivery: 3 attempts, 5 seconds apart
/// let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
/// assert_eq!(policy.max_attempts(), 3);
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: DelayStrategy,
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Number of attempts made (at least 1)
    pub attempts: u32,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, delay: DelayStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, DelayStrategy::Fixed(delay))
    }

    /// Exponential backoff with jitter enabled.
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self::new(
            max_attempts,
            DelayStrategy::Exponential {
                initial,
                max,
                jitter: true,
            },
        )
    }

    /// No delay between attempts (useful for testing).
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Disable jitter on an exponential policy.
    pub fn without_jitter(mut self) -> Self {
        if let DelayStrategy::Exponential { ref mut jitter, .. } = self.delay {
            *jitter = false;
        }
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_strategy(&self) -> &DelayStrategy {
        &self.delay
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.delay {
            DelayStrategy::Fixed(delay) => *delay,
            DelayStrategy::Exponential {
                initial,
                max,
                jitter,
            } => {
                // Cap the power to prevent overflow (2^8 = 256x is plenty)
                let power = attempt.saturating_sub(1).min(8);
                let base = initial.saturating_mul(1 << power).min(*max);
                if *jitter {
                    let factor = rand::thread_rng().gen::<f64>() * 0.25;
                    base + base.mul_f64(factor)
                } else {
                    base
                }
            }
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, the error is not retryable, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number so callers can rotate
    /// endpoints between attempts.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, is_retryable: R) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if self.should_retry(attempt) && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 5 seconds apart.
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

/// Attempt counter for long-running reconnect loops.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempt_count: u32,
    total_failures: u64,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Delay before the next attempt.
    pub fn next_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.delay_for(self.attempt_count.max(1))
    }

    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        !policy.should_retry(self.attempt_count)
    }
}
