//! Rate limiting for preventing processor overload
//!
//! Token bucket: the bucket refills continuously at `rate` tokens per second
//! up to `capacity`, and every request spends `cost_per_request` tokens. A
//! request that finds the bucket short waits exactly long enough for the
//! deficit to refill, then tries once more.

use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Slack for float rounding when comparing refilled tokens to the cost
const TOKEN_EPSILON: f64 = 1e-9;

/// Configuration for the token bucket
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Refill rate in tokens per second
    pub rate: f64,
    /// Maximum number of tokens the bucket holds (and its initial fill)
    pub capacity: f64,
    /// Tokens spent by each request
    pub cost_per_request: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            capacity: 10.0,
            cost_per_request: 1.0,
        }
    }
}

impl RateLimiterConfig {
    /// Allow `requests_per_second` with a burst of the same size
    pub fn per_second(requests_per_second: u32) -> Self {
        let rate = f64::from(requests_per_second);
        Self {
            rate,
            capacity: rate,
            cost_per_request: 1.0,
        }
    }

    /// Replace invalid fields with defaults and clamp the cost to the capacity
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let rate = if self.rate.is_finite() && self.rate > 0.0 {
            self.rate
        } else {
            defaults.rate
        };
        let capacity = if self.capacity.is_finite() && self.capacity >= 1.0 {
            self.capacity
        } else {
            defaults.capacity
        };
        let cost_per_request = if self.cost_per_request.is_finite() && self.cost_per_request >= 1.0
        {
            self.cost_per_request
        } else {
            defaults.cost_per_request
        };
        Self {
            rate,
            capacity,
            cost_per_request: cost_per_request.min(capacity),
        }
    }
}

/// Point-in-time view of a rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
    /// Cumulative time callers spent waiting for tokens
    pub total_wait: Duration,
    /// Tokens in the bucket when the snapshot was taken
    pub current_tokens: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    total_requests: u64,
    allowed_requests: u64,
    rejected_requests: u64,
    total_wait: Duration,
}

impl TokenBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            total_requests: 0,
            allowed_requests: 0,
            rejected_requests: 0,
            total_wait: Duration::ZERO,
        }
    }

    fn refill(&mut self, config: &RateLimiterConfig) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.rate).min(config.capacity);
        self.last_refill = now;
    }

    /// Spend the request cost if available, otherwise report how long the
    /// deficit takes to refill
    fn try_consume(&mut self, config: &RateLimiterConfig) -> std::result::Result<(), Duration> {
        self.refill(config);
        if self.tokens + TOKEN_EPSILON >= config.cost_per_request {
            self.tokens = (self.tokens - config.cost_per_request).max(0.0);
            self.allowed_requests += 1;
            Ok(())
        } else {
            // Very slow rates can need longer than a Duration holds
            let deficit = config.cost_per_request - self.tokens;
            Err(Duration::try_from_secs_f64(deficit / config.rate).unwrap_or(Duration::MAX))
        }
    }
}

/// Token bucket rate limiter decorator
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{RateLimiter, RateLimiterConfig};
/// use bulwark_core_processor::{CancellationToken, FnProcessor, Message, Processor, ProcessorError};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ProcessorError> {
///     let backend = Arc::new(FnProcessor::new("backend", |m: Message| async move {
///         Ok::<_, ProcessorError>(m)
///     }));
///     // Allow 100 requests per second
///     let limiter = RateLimiter::new(backend, RateLimiterConfig::per_second(100));
///
///     limiter.process(Message::user("hi"), &CancellationToken::new()).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<dyn Processor>,
    config: Arc<RateLimiterConfig>,
    bucket: Arc<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Create a new rate limiter around `inner`; the bucket starts full
    pub fn new(inner: Arc<dyn Processor>, config: RateLimiterConfig) -> Self {
        let config = config.normalized();
        Self {
            inner,
            bucket: Arc::new(Mutex::new(TokenBucket::full(config.capacity))),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn bucket(&self) -> std::sync::MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tokens currently available, after refilling for elapsed time
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket();
        bucket.refill(&self.config);
        bucket.tokens
    }

    /// Spend one request's worth of tokens without waiting
    ///
    /// Returns `RateLimitExceeded` if the bucket is short.
    pub fn try_acquire(&self) -> Result<()> {
        let mut bucket = self.bucket();
        bucket.total_requests += 1;
        match bucket.try_consume(&self.config) {
            Ok(()) => Ok(()),
            Err(_) => {
                bucket.rejected_requests += 1;
                Err(ProcessorError::RateLimitExceeded {
                    needed: self.config.cost_per_request,
                    available: bucket.tokens,
                })
            }
        }
    }

    /// Wait until the request cost can be paid, then pay it
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let wait = {
            let mut bucket = self.bucket();
            bucket.total_requests += 1;
            match bucket.try_consume(&self.config) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            }
        };

        debug!(
            processor = self.inner.name(),
            wait_ms = wait.as_millis() as u64,
            "Waiting for rate limiter tokens"
        );

        let started = Instant::now();
        let slept = cancel
            .run_until_cancelled(tokio::time::sleep(wait))
            .await
            .is_some();

        let mut bucket = self.bucket();
        bucket.total_wait += started.elapsed();
        if !slept {
            return Err(ProcessorError::Cancelled);
        }

        match bucket.try_consume(&self.config) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Another caller took the refilled tokens first
                bucket.rejected_requests += 1;
                warn!(
                    processor = self.inner.name(),
                    needed = self.config.cost_per_request,
                    available = bucket.tokens,
                    "Rate limit exceeded"
                );
                Err(ProcessorError::RateLimitExceeded {
                    needed: self.config.cost_per_request,
                    available: bucket.tokens,
                })
            }
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut bucket = self.bucket();
        bucket.refill(&self.config);
        RateLimiterMetrics {
            total_requests: bucket.total_requests,
            allowed_requests: bucket.allowed_requests,
            rejected_requests: bucket.rejected_requests,
            total_wait: bucket.total_wait,
            current_tokens: bucket.tokens,
        }
    }
}

#[async_trait]
impl Processor for RateLimiter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.inner.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        self.acquire(cancel).await?;
        self.inner.process(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core_processor::testing::ScriptedProcessor;
    use tokio_test::{assert_err, assert_ok};

    fn limiter(rate: f64, capacity: f64, cost: f64) -> (Arc<ScriptedProcessor>, RateLimiter) {
        let backend = Arc::new(ScriptedProcessor::echo("backend"));
        let limiter = RateLimiter::new(
            backend.clone(),
            RateLimiterConfig {
                rate,
                capacity,
                cost_per_request: cost,
            },
        );
        (backend, limiter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let (backend, limiter) = limiter(10.0, 10.0, 1.0);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..10 {
            limiter.process(Message::user("x"), &cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.process(Message::user("x"), &cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(110), "waited {:?}", waited);

        assert_eq!(backend.calls(), 11);
        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 11);
        assert_eq!(metrics.allowed_requests, 11);
        assert_eq!(metrics.rejected_requests, 0);
        assert!(metrics.total_wait >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_stay_within_bounds() {
        let (_backend, limiter) = limiter(5.0, 3.0, 1.0);

        assert!(limiter.available_tokens() <= 3.0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(limiter.available_tokens(), 3.0);

        for _ in 0..3 {
            assert_ok!(limiter.try_acquire());
            let tokens = limiter.available_tokens();
            assert!((0.0..=3.0).contains(&tokens));
        }
        assert_err!(limiter.try_acquire());
        assert!(limiter.available_tokens() >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_reports_deficit() {
        let (_backend, limiter) = limiter(1.0, 2.0, 2.0);
        limiter.try_acquire().unwrap();

        match limiter.try_acquire() {
            Err(ProcessorError::RateLimitExceeded { needed, available }) => {
                assert_eq!(needed, 2.0);
                assert!(available < 2.0);
            }
            other => panic!("Expected RateLimitExceeded, got {:?}", other),
        }
        assert_eq!(limiter.metrics().rejected_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_consumes_nothing() {
        let (backend, limiter) = limiter(1.0, 1.0, 1.0);
        let cancel = CancellationToken::new();
        limiter.process(Message::user("x"), &cancel).await.unwrap();

        let waiting = CancellationToken::new();
        let trigger = waiting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = limiter.process(Message::user("y"), &waiting).await;
        assert_eq!(result, Err(ProcessorError::Cancelled));
        assert_eq!(backend.calls(), 1);

        // Only the refill since the cancelled wait started is in the bucket
        let tokens = limiter.available_tokens();
        assert!(tokens > 0.0 && tokens < 0.2, "tokens {}", tokens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_waits_without_overflow() {
        let (backend, limiter) = limiter(1e-20, 1.0, 1.0);
        let cancel = CancellationToken::new();
        limiter.process(Message::user("x"), &cancel).await.unwrap();

        assert_err!(limiter.try_acquire());

        let waiting = CancellationToken::new();
        let trigger = waiting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = limiter.process(Message::user("y"), &waiting).await;
        assert_eq!(result, Err(ProcessorError::Cancelled));
        assert_eq!(backend.calls(), 1);
        assert_eq!(limiter.metrics().allowed_requests, 1);
    }

    #[test]
    fn test_config_normalization() {
        let config = RateLimiterConfig {
            rate: -1.0,
            capacity: 0.0,
            cost_per_request: 0.0,
        }
        .normalized();
        assert_eq!(config.rate, 10.0);
        assert_eq!(config.capacity, 10.0);
        assert_eq!(config.cost_per_request, 1.0);

        let config = RateLimiterConfig {
            rate: 1.0,
            capacity: 4.0,
            cost_per_request: 9.0,
        }
        .normalized();
        assert_eq!(config.cost_per_request, 4.0);
    }

    #[test]
    fn test_per_second() {
        let config = RateLimiterConfig::per_second(100);
        assert_eq!(config.rate, 100.0);
        assert_eq!(config.capacity, 100.0);
    }
}
