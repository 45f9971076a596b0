//! Retry with exponential backoff
//!
//! Each failed attempt is followed by a cancellable sleep. The delay starts
//! at `initial_backoff` and is multiplied by `multiplier` after every retry,
//! capped at `max_backoff`.

use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether a failure deserves another attempt
pub type RetryPredicate = Arc<dyn Fn(&ProcessorError) -> bool + Send + Sync>;

/// Configuration for retry behavior
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier (exponential backoff)
    pub multiplier: f64,
    /// `None` treats every failure as retryable
    pub retryable: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            retryable: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("retryable", &self.retryable.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RetryConfig {
    /// Only retry failures for which `predicate` returns true
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProcessorError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    /// Replace invalid fields with defaults
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let initial_backoff = if self.initial_backoff.is_zero() {
            defaults.initial_backoff
        } else {
            self.initial_backoff
        };
        let max_backoff = if self.max_backoff.is_zero() {
            defaults.max_backoff
        } else {
            self.max_backoff
        };
        Self {
            max_attempts: if self.max_attempts == 0 {
                defaults.max_attempts
            } else {
                self.max_attempts
            },
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            multiplier: if self.multiplier.is_finite() && self.multiplier > 0.0 {
                self.multiplier
            } else {
                defaults.multiplier
            },
            retryable: self.retryable,
        }
    }

    /// Delay that follows `current` in the schedule
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier;
        if next >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(next)
        }
    }

    fn is_retryable(&self, error: &ProcessorError) -> bool {
        self.retryable.as_ref().is_none_or(|predicate| predicate(error))
    }
}

/// Point-in-time view of a retry decorator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    /// Calls made into the decorator
    pub calls: u64,
    /// Calls made into the inner processor
    pub attempts: u64,
    /// Attempts after the first one
    pub retries: u64,
    pub successes: u64,
    pub exhausted: u64,
    pub non_retryable: u64,
    /// Cumulative time spent sleeping between attempts
    pub total_backoff: Duration,
}

/// Retry decorator
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{Retry, RetryConfig};
/// use bulwark_core_processor::{CancellationToken, FnProcessor, Message, Processor, ProcessorError};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), ProcessorError> {
/// let flaky = Arc::new(FnProcessor::new("flaky", |m: Message| async move {
///     Ok::<_, ProcessorError>(m)
/// }));
/// let retry = Retry::new(
///     flaky,
///     RetryConfig::default().with_predicate(ProcessorError::is_transient),
/// );
/// retry.process(Message::user("hi"), &CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Retry {
    inner: Arc<dyn Processor>,
    config: Arc<RetryConfig>,
    metrics: Arc<Mutex<RetryMetrics>>,
}

impl Retry {
    pub fn new(inner: Arc<dyn Processor>, config: RetryConfig) -> Self {
        Self {
            inner,
            config: Arc::new(config.normalized()),
            metrics: Arc::new(Mutex::new(RetryMetrics::default())),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.record(|_| {})
    }

    fn record(&self, update: impl FnOnce(&mut RetryMetrics)) -> RetryMetrics {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
        metrics.clone()
    }
}

#[async_trait]
impl Processor for Retry {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.inner.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        self.record(|m| m.calls += 1);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.record(|m| {
                m.attempts += 1;
                if attempt > 1 {
                    m.retries += 1;
                }
            });

            let error = match self.inner.process(request.clone(), cancel).await {
                Ok(response) => {
                    self.record(|m| m.successes += 1);
                    return Ok(response);
                }
                Err(ProcessorError::Cancelled) => return Err(ProcessorError::Cancelled),
                Err(error) => error,
            };

            if !self.config.is_retryable(&error) {
                self.record(|m| m.non_retryable += 1);
                debug!(processor = self.inner.name(), attempt, error = %error, "Error is not retryable");
                return Err(ProcessorError::NonRetryable {
                    attempt,
                    source: Box::new(error),
                });
            }

            if attempt >= self.config.max_attempts {
                self.record(|m| m.exhausted += 1);
                warn!(processor = self.inner.name(), attempts = attempt, error = %error, "Retries exhausted");
                return Err(ProcessorError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            debug!(
                processor = self.inner.name(),
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );

            // Sleep with exponential backoff before retrying
            if cancel
                .run_until_cancelled(tokio::time::sleep(backoff))
                .await
                .is_none()
            {
                return Err(ProcessorError::Cancelled);
            }
            self.record(|m| m.total_backoff += backoff);
            backoff = self.config.next_backoff(backoff);
        }
    }
}
