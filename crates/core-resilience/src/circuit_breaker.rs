//! Circuit Breaker decorator for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when the
//! wrapped processor is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Processor is unhealthy, requests fail immediately
//! - HalfOpen: Testing if the processor has recovered
//!
//! Recovery is lazy: there is no background timer. The first call arriving
//! after `recovery_timeout` has elapsed moves the circuit to HalfOpen and is
//! let through as a trial.

use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing processor recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait after the last failure before trying half-open
    pub recovery_timeout: Duration,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// Deadline applied to every call let through to the inner processor
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Replace zero fields with their defaults
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: if self.failure_threshold == 0 {
                defaults.failure_threshold
            } else {
                self.failure_threshold
            },
            recovery_timeout: if self.recovery_timeout.is_zero() {
                defaults.recovery_timeout
            } else {
                self.recovery_timeout
            },
            success_threshold: if self.success_threshold == 0 {
                defaults.success_threshold
            } else {
                self.success_threshold
            },
            call_timeout: if self.call_timeout.is_zero() {
                defaults.call_timeout
            } else {
                self.call_timeout
            },
        }
    }
}

/// Point-in-time view of a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    /// Failures caused by the per-call deadline (also counted in `failed_requests`)
    pub timeouts: u64,
    /// Transition counts keyed `"from->to"`, e.g. `"closed->open"`
    pub transitions: BTreeMap<String, u64>,
    pub last_transition: Option<Instant>,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    /// Current state of the circuit
    state: CircuitState,
    /// Consecutive failure count
    consecutive_failures: u32,
    /// Consecutive success count (used in half-open state)
    consecutive_successes: u32,
    /// When the most recent failure was recorded
    last_failure: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    timeouts: u64,
    transitions: BTreeMap<String, u64>,
    last_transition: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            timeouts: 0,
            transitions: BTreeMap::new(),
            last_transition: None,
        }
    }

    fn transition(&mut self, to: CircuitState, processor: &str) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        let now = Instant::now();
        self.last_transition = Some(now);
        *self
            .transitions
            .entry(format!("{}->{}", from.as_str(), to.as_str()))
            .or_insert(0) += 1;
        info!(
            processor,
            from = from.as_str(),
            to = to.as_str(),
            failures = self.consecutive_failures,
            "Circuit breaker state transition"
        );
    }
}

/// Circuit breaker decorator for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{CircuitBreaker, CircuitBreakerConfig};
/// use bulwark_core_processor::{CancellationToken, FnProcessor, Message, Processor, ProcessorError};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ProcessorError> {
///     let backend = Arc::new(FnProcessor::new("backend", |m: Message| async move {
///         Ok::<_, ProcessorError>(Message::assistant(m.content))
///     }));
///     let breaker = CircuitBreaker::new(backend, CircuitBreakerConfig::default());
///
///     let reply = breaker
///         .process(Message::user("ping"), &CancellationToken::new())
///         .await?;
///     println!("Reply: {}", reply.content);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<dyn Processor>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker around `inner`
    pub fn new(inner: Arc<dyn Processor>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config: Arc::new(config.normalized()),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(inner: Arc<dyn Processor>) -> Self {
        Self::new(inner, CircuitBreakerConfig::default())
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Snapshot of counters and transition history
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock().await;
        CircuitBreakerMetrics {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            timeouts: state.timeouts,
            transitions: state.transitions.clone(),
            last_transition: state.last_transition,
        }
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.transition(CircuitState::Closed, self.inner.name());
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        state.last_failure = None;
    }

    /// Check circuit state and update if necessary
    async fn admit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.total_requests += 1;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let recovered = state
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    // Transition to half-open for testing
                    state.consecutive_successes = 0;
                    state.transition(CircuitState::HalfOpen, self.inner.name());
                    Ok(())
                } else {
                    state.rejected_requests += 1;
                    warn!(
                        processor = self.inner.name(),
                        failures = state.consecutive_failures,
                        "Circuit open, rejecting request"
                    );
                    Err(ProcessorError::CircuitOpen {
                        failures: state.consecutive_failures,
                    })
                }
            }
        }
    }

    /// Handle successful operation
    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        state.successful_requests += 1;

        match state.state {
            CircuitState::Closed => {
                // Reset failure count on success
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                debug!(
                    processor = self.inner.name(),
                    successes = state.consecutive_successes,
                    "Half-open trial succeeded"
                );

                // If enough successes, close the circuit
                if state.consecutive_successes >= self.config.success_threshold {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.transition(CircuitState::Closed, self.inner.name());
                }
            }
            CircuitState::Open => {
                // Admitted before the circuit opened; does not close it
            }
        }
    }

    /// Handle failed operation
    async fn on_failure(&self, timed_out: bool) {
        let mut state = self.state.lock().await;
        state.failed_requests += 1;
        if timed_out {
            state.timeouts += 1;
        }

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.last_failure = Some(Instant::now());

                // If threshold reached, open the circuit
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.transition(CircuitState::Open, self.inner.name());
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                state.last_failure = Some(Instant::now());
                state.transition(CircuitState::Open, self.inner.name());
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }
}

#[async_trait]
impl Processor for CircuitBreaker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.inner.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        self.admit().await?;

        let call_timeout = self.config.call_timeout;
        let (outcome, timed_out) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (Err(ProcessorError::Cancelled), false),
            result = tokio::time::timeout(call_timeout, self.inner.process(request, cancel)) => {
                match result {
                    Ok(result) => (result, false),
                    Err(_) => (Err(ProcessorError::Timeout(call_timeout)), true),
                }
            }
        };

        match &outcome {
            Ok(_) => self.on_success().await,
            // Caller gave up; says nothing about the processor's health
            Err(ProcessorError::Cancelled) => {}
            Err(_) => {
                if timed_out {
                    warn!(processor = self.inner.name(), timeout = ?call_timeout, "Call timed out");
                }
                self.on_failure(timed_out).await;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core_processor::testing::{ScriptedProcessor, Step};

    fn failing() -> Arc<ScriptedProcessor> {
        Arc::new(ScriptedProcessor::failing("backend"))
    }

    async fn call(breaker: &CircuitBreaker) -> Result<Message> {
        breaker
            .process(Message::user("ping"), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let backend = failing();
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend.clone(), config);

        // Simulate failures
        for _ in 0..2 {
            assert!(call(&breaker).await.is_err());
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }
        assert!(call(&breaker).await.is_err());

        // Circuit should be open
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_never_calls_inner() {
        let backend = failing();
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend.clone(), config);

        for _ in 0..2 {
            let _ = call(&breaker).await;
        }

        for _ in 0..10 {
            match call(&breaker).await {
                Err(ProcessorError::CircuitOpen { failures }) => assert_eq!(failures, 2),
                other => panic!("Expected CircuitOpen, got {:?}", other),
            }
        }
        assert_eq!(backend.calls(), 2);

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.rejected_requests, 10);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.total_requests, 12);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let backend = Arc::new(ScriptedProcessor::echo("backend").then([
            Step::Fail(ProcessorError::Transient("a".to_string())),
            Step::Fail(ProcessorError::Transient("b".to_string())),
            Step::Echo,
            Step::Fail(ProcessorError::Transient("c".to_string())),
            Step::Fail(ProcessorError::Transient("d".to_string())),
        ]));
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend, config);

        for _ in 0..5 {
            let _ = call(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.metrics().await.consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_scenario() {
        let backend = Arc::new(ScriptedProcessor::echo("backend").then([
            Step::Fail(ProcessorError::Transient("1".to_string())),
            Step::Fail(ProcessorError::Transient("2".to_string())),
            Step::Fail(ProcessorError::Transient("3".to_string())),
        ]));
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            success_threshold: 2,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend.clone(), config);

        for _ in 0..3 {
            assert!(call(&breaker).await.is_err());
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(
            call(&breaker).await,
            Err(ProcessorError::CircuitOpen { .. })
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(call(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        assert!(call(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(backend.calls(), 5);

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.transitions.get("closed->open"), Some(&1));
        assert_eq!(metrics.transitions.get("open->half_open"), Some(&1));
        assert_eq!(metrics.transitions.get("half_open->closed"), Some(&1));
        assert!(metrics.last_transition.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let backend = failing();
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend.clone(), config);

        let _ = call(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            call(&breaker).await,
            Err(ProcessorError::Transient(_))
        ));
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Failure timestamp was refreshed, so the next call is rejected again
        assert!(matches!(
            call(&breaker).await,
            Err(ProcessorError::CircuitOpen { .. })
        ));
        assert_eq!(backend.calls(), 2);

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.transitions.get("half_open->open"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let backend = Arc::new(ScriptedProcessor::echo("slow").with_delay(Duration::from_secs(5)));
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            call_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend, config);

        for _ in 0..2 {
            assert_eq!(
                call(&breaker).await,
                Err(ProcessorError::Timeout(Duration::from_millis(100)))
            );
        }

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.timeouts, 2);
        assert_eq!(metrics.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let backend = Arc::new(ScriptedProcessor::echo("slow").with_delay(Duration::from_secs(5)));
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(backend, config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = breaker.process(Message::user("x"), &cancel).await;
        assert_eq!(result, Err(ProcessorError::Cancelled));
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(failing(), config);

        // Cause failure
        let _ = call(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Reset
        breaker.reset().await;

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.transitions.get("open->closed"), Some(&1));
    }

    #[test]
    fn test_zero_config_uses_defaults() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            recovery_timeout: Duration::ZERO,
            success_threshold: 0,
            call_timeout: Duration::ZERO,
        }
        .normalized();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(60));
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.call_timeout, Duration::from_secs(30));
    }
}
