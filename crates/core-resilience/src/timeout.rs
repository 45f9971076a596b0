//! Deadline enforcement
//!
//! The inner call runs on its own task. The caller returns at whichever comes
//! first: the inner result or the deadline. On deadline the inner task's
//! cancellation token is fired, but a processor that ignores cancellation
//! keeps running detached until it finishes on its own.

use crate::metrics::DurationStats;
use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// Configuration for the timeout decorator
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }.normalized()
    }

    /// Replace a zero timeout with the default
    pub fn normalized(self) -> Self {
        if self.timeout.is_zero() {
            Self::default()
        } else {
            self
        }
    }
}

/// Point-in-time view of a timeout decorator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutMetrics {
    pub successes: DurationStats,
    pub timeouts: DurationStats,
    /// Inner processor returned an error before the deadline
    pub failures: DurationStats,
}

/// Timeout decorator
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<dyn Processor>,
    config: TimeoutConfig,
    metrics: Arc<Mutex<TimeoutMetrics>>,
}

impl Timeout {
    pub fn new(inner: Arc<dyn Processor>, config: TimeoutConfig) -> Self {
        Self {
            inner,
            config: config.normalized(),
            metrics: Arc::new(Mutex::new(TimeoutMetrics::default())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn metrics(&self) -> TimeoutMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, outcome: impl FnOnce(&mut TimeoutMetrics) -> &mut DurationStats, elapsed: Duration) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        outcome(&mut metrics).record(elapsed);
    }
}

#[async_trait]
impl Processor for Timeout {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.inner.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        let deadline = self.config.timeout;
        let started = Instant::now();

        let inner = Arc::clone(&self.inner);
        let inner_cancel = cancel.child_token();
        let task_cancel = inner_cancel.clone();
        let mut task =
            tokio::spawn(async move { inner.process(request, &task_cancel).await });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
            joined = tokio::time::timeout(deadline, &mut task) => joined,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(response))) => {
                self.record(|m| &mut m.successes, elapsed);
                Ok(response)
            }
            Ok(Ok(Err(err))) => {
                if !err.is_cancelled() {
                    self.record(|m| &mut m.failures, elapsed);
                }
                Err(err)
            }
            Ok(Err(join_error)) => {
                error!(processor = self.inner.name(), error = %join_error, "Processor task failed");
                self.record(|m| &mut m.failures, elapsed);
                Err(ProcessorError::Permanent(format!(
                    "processor task failed: {}",
                    join_error
                )))
            }
            Err(_) => {
                // Signal the inner call to stop; the task itself is left detached
                inner_cancel.cancel();
                self.record(|m| &mut m.timeouts, elapsed);
                warn!(processor = self.inner.name(), timeout = ?deadline, "Deadline exceeded");
                Err(ProcessorError::Timeout(deadline))
            }
        }
    }
}
