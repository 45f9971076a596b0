/*!
 * Composition of decorators into a single processor
 *
 * Layers are applied from the inside out:
 *
 * ```text
 *   batching → circuit breaker → rate limiter → cache → timeout → retry → inner
 * ```
 *
 * Retry sits closest to the inner processor so the timeout above it bounds
 * the whole retried call, and the circuit breaker sees one outcome per
 * request. Cache hits never spend rate limiter tokens.
 */

use crate::config::ResilienceConfig;
use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, Result};
use bulwark_core_resilience::{
    BatchConfig, BatchQueue, CacheConfig, CircuitBreaker, CircuitBreakerConfig, RateLimiter,
    RateLimiterConfig, ResponseCache, Retry, RetryConfig, Timeout, TimeoutConfig,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Collects decorator configurations before building a [`Stack`]
#[derive(Debug, Default)]
pub struct StackBuilder {
    circuit_breaker: Option<CircuitBreakerConfig>,
    rate_limiter: Option<RateLimiterConfig>,
    cache: Option<CacheConfig>,
    batching: Option<BatchConfig>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the decorators whose tables are present in `config`
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            circuit_breaker: config.circuit_breaker.as_ref().map(Into::into),
            rate_limiter: config.rate_limiter.as_ref().map(Into::into),
            cache: config.cache.as_ref().map(Into::into),
            batching: config.batching.as_ref().map(Into::into),
            retry: config.retry.as_ref().map(Into::into),
            timeout: config.timeout.as_ref().map(Into::into),
        }
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn batching(mut self, config: BatchConfig) -> Self {
        self.batching = Some(config);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    /// Wrap `inner` with every configured decorator
    ///
    /// Must be called inside a Tokio runtime when batching is enabled.
    pub fn build(self, inner: Arc<dyn Processor>) -> Stack {
        let mut layers = Vec::new();
        let mut current = inner;

        let retry = self.retry.map(|config| {
            let layer = Arc::new(Retry::new(Arc::clone(&current), config));
            current = layer.clone();
            layers.push("retry");
            layer
        });

        let timeout = self.timeout.map(|config| {
            let layer = Arc::new(Timeout::new(Arc::clone(&current), config));
            current = layer.clone();
            layers.push("timeout");
            layer
        });

        let cache = self.cache.map(|config| {
            let layer = Arc::new(ResponseCache::new(Arc::clone(&current), config));
            current = layer.clone();
            layers.push("cache");
            layer
        });

        let rate_limiter = self.rate_limiter.map(|config| {
            let layer = Arc::new(RateLimiter::new(Arc::clone(&current), config));
            current = layer.clone();
            layers.push("rate_limiter");
            layer
        });

        let circuit_breaker = self.circuit_breaker.map(|config| {
            let layer = Arc::new(CircuitBreaker::new(Arc::clone(&current), config));
            current = layer.clone();
            layers.push("circuit_breaker");
            layer
        });

        let batching = self.batching.map(|config| {
            let layer = Arc::new(BatchQueue::new(Arc::clone(&current), config));
            current = layer.clone();
            layers.push("batching");
            layer
        });

        debug!(processor = current.name(), layers = ?layers, "Built resilience stack");

        Stack {
            processor: current,
            layers,
            retry,
            timeout,
            cache,
            rate_limiter,
            circuit_breaker,
            batching,
        }
    }
}

/// A processor wrapped in its configured decorators
///
/// Keeps a handle on each layer so its metrics and controls stay reachable.
pub struct Stack {
    processor: Arc<dyn Processor>,
    layers: Vec<&'static str>,
    retry: Option<Arc<Retry>>,
    timeout: Option<Arc<Timeout>>,
    cache: Option<Arc<ResponseCache>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    batching: Option<Arc<BatchQueue>>,
}

impl Stack {
    /// Outermost processor of the stack
    pub fn processor(&self) -> Arc<dyn Processor> {
        Arc::clone(&self.processor)
    }

    /// Layer names from innermost to outermost
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }

    pub fn retry(&self) -> Option<&Retry> {
        self.retry.as_deref()
    }

    pub fn timeout(&self) -> Option<&Timeout> {
        self.timeout.as_deref()
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_deref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_deref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_deref()
    }

    pub fn batching(&self) -> Option<&BatchQueue> {
        self.batching.as_deref()
    }

    /// Drain the batching queue, if there is one
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.batching {
            queue.shutdown().await;
        }
    }
}

#[async_trait]
impl Processor for Stack {
    fn name(&self) -> &str {
        self.processor.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.processor.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        self.processor.process(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core_processor::testing::ScriptedProcessor;
    use bulwark_core_processor::ProcessorError;
    use std::time::Duration;

    #[test]
    fn test_empty_builder_is_passthrough() {
        let stack = StackBuilder::new().build(Arc::new(ScriptedProcessor::echo("bare")));
        assert!(stack.layers().is_empty());
        assert_eq!(stack.name(), "bare");
        assert!(stack.circuit_breaker().is_none());
    }

    #[tokio::test]
    async fn test_layer_order() {
        let stack = StackBuilder::from_config(&ResilienceConfig::all_defaults())
            .build(Arc::new(ScriptedProcessor::echo("full")));
        assert_eq!(
            stack.layers(),
            &["retry", "timeout", "cache", "rate_limiter", "circuit_breaker", "batching"]
        );
        assert_eq!(stack.capabilities(), BTreeSet::from(["scripted".to_string()]));
        stack.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_runs_inside_breaker() {
        let backend = Arc::new(ScriptedProcessor::failing("down"));
        let stack = StackBuilder::new()
            .retry(RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                ..Default::default()
            })
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            })
            .build(backend.clone());

        let cancel = CancellationToken::new();
        let first = stack.process(Message::user("x"), &cancel).await;
        assert!(matches!(first, Err(ProcessorError::RetryExhausted { attempts: 3, .. })));

        let second = stack.process(Message::user("x"), &cancel).await;
        assert!(matches!(second, Err(ProcessorError::CircuitOpen { .. })));
        assert_eq!(backend.calls(), 3);
    }
}
