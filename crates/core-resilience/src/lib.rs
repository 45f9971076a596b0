//! Bulwark Core Resilience: composable decorators over the processor contract
//!
//! # Overview
//!
//! Every type in this crate wraps an inner [`Processor`] and is itself a
//! [`Processor`], so decorators stack in any order:
//!
//! - **Circuit Breaker**: fails fast once the inner processor keeps failing
//! - **Rate Limiter**: token bucket in front of the inner processor
//! - **Response Cache**: LRU with per-entry TTL keyed on the request
//! - **Batching Queue**: groups bursts of requests and dispatches them together
//! - **Retry**: exponential backoff on retryable errors
//! - **Timeout**: bounds how long a caller waits on the inner processor
//!
//! Decorators report the inner processor's name and capabilities unchanged.
//! All of them honour the caller's [`CancellationToken`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Caller                          │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Batching Queue                    │  ← Amortize bursts
//! │  (size or deadline, per-caller slots)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Prevent overload
//! │  (Token bucket, waits or rejects)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Response Cache                    │  ← Skip repeated work
//! │  (LRU + TTL, errors never stored)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Timeout → Retry                   │  ← Bound latency, absorb blips
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Inner Processor
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use bulwark_core_processor::{CancellationToken, FnProcessor, Message, Processor, ProcessorError};
//! use bulwark_core_resilience::{CircuitBreaker, CircuitBreakerConfig, Retry, RetryConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ProcessorError> {
//! let backend = Arc::new(FnProcessor::new("backend", |m: Message| async move {
//!     Ok::<_, ProcessorError>(Message::assistant(m.content))
//! }));
//!
//! let retry = Arc::new(Retry::new(backend, RetryConfig::default()));
//! let breaker = CircuitBreaker::new(
//!     retry,
//!     CircuitBreakerConfig {
//!         failure_threshold: 5,
//!         recovery_timeout: Duration::from_secs(60),
//!         ..Default::default()
//!     },
//! );
//!
//! let reply = breaker
//!     .process(Message::user("hello"), &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batching;
pub mod cache;
pub mod circuit_breaker;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError};

// Re-export main types for convenience
pub use batching::{BatchConfig, BatchMetrics, BatchOutcome, BatchQueue};
pub use cache::{default_key, CacheConfig, CacheMetrics, KeyFn, ResponseCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use metrics::DurationStats;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterMetrics};
pub use retry::{Retry, RetryConfig, RetryMetrics, RetryPredicate};
pub use timeout::{Timeout, TimeoutConfig, TimeoutMetrics};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use bulwark_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::batching::{BatchConfig, BatchQueue};
    pub use super::cache::{CacheConfig, ResponseCache};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::rate_limiter::{RateLimiter, RateLimiterConfig};
    pub use super::retry::{Retry, RetryConfig};
    pub use super::timeout::{Timeout, TimeoutConfig};
    pub use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError};
}
