//! Configuration loading and stack assembly
//!
//! Loads TOML documents from disk, builds stacks from them, and drives
//! requests through the assembled decorators.

use bulwark::resilience::CircuitState;
use bulwark::{
    CancellationToken, ConfigError, Message, Processor, ProcessorError, ResilienceConfig,
    StackBuilder,
};
use bulwark_core_processor::testing::{ScriptedProcessor, Step};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_config_from_file() {
    let file = write_config(
        r#"
        [logging]
        level = "warn"

        [rate_limiter]
        rate = 5.0
        capacity = 2.0

        [cache]
        max_size = 3
        ttl_ms = 1000
        "#,
    );

    let config = ResilienceConfig::from_file(file.path()).unwrap();
    let limiter = config.rate_limiter.as_ref().unwrap();
    assert_eq!(limiter.rate, 5.0);
    assert_eq!(limiter.cost_per_request, 1.0);
    assert_eq!(config.cache.as_ref().unwrap().ttl_ms, 1000);
    assert!(config.retry.is_none());
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    match ResilienceConfig::from_file(&path) {
        Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected I/O error, got {:?}", other),
    }
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bulwark.toml");

    let config = ResilienceConfig::all_defaults();
    config.to_file(&path).unwrap();
    assert_eq!(ResilienceConfig::from_file(&path).unwrap(), config);
}

#[test]
fn test_wrong_value_type_rejected() {
    let file = write_config("[retry]\nmax_attempts = \"three\"\n");
    assert!(matches!(
        ResilienceConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_configured_stack_caches_and_breaks() {
    let config = ResilienceConfig::from_toml_str(
        r#"
        [cache]
        max_size = 10

        [circuit_breaker]
        failure_threshold = 2
        recovery_timeout_ms = 1000
        "#,
    )
    .unwrap();

    let backend = Arc::new(ScriptedProcessor::failing("backend").then([Step::Echo]));
    let stack = StackBuilder::from_config(&config).build(backend.clone());
    assert_eq!(stack.layers(), &["cache", "circuit_breaker"]);

    let cancel = CancellationToken::new();

    // First request succeeds and is cached
    let reply = stack.process(Message::user("hello"), &cancel).await.unwrap();
    assert_eq!(reply.content, "hello");
    let reply = stack.process(Message::user("hello"), &cancel).await.unwrap();
    assert_eq!(reply.content, "hello");
    assert_eq!(backend.calls(), 1);

    // Two distinct failing requests open the circuit
    assert!(stack.process(Message::user("a"), &cancel).await.is_err());
    assert!(stack.process(Message::user("b"), &cancel).await.is_err());
    let breaker = stack.circuit_breaker().unwrap();
    assert_eq!(breaker.state().await, CircuitState::Open);

    // The cache sits below the breaker, so even cached keys are rejected now
    let rejected = stack.process(Message::user("hello"), &cancel).await;
    assert!(matches!(rejected, Err(ProcessorError::CircuitOpen { failures: 2 })));
    assert_eq!(backend.calls(), 3);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let recovered = stack.process(Message::user("hello"), &cancel).await;
    assert!(recovered.is_ok());
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    assert_eq!(stack.cache().unwrap().metrics().hits, 2);
}

#[tokio::test(start_paused = true)]
async fn test_batching_stack_drains_on_shutdown() {
    let config = ResilienceConfig::from_toml_str(
        r#"
        [batching]
        max_batch_size = 4
        max_wait_ms = 20

        [retry]
        max_attempts = 2
        initial_backoff_ms = 5
        "#,
    )
    .unwrap();

    let backend = Arc::new(ScriptedProcessor::echo("backend"));
    let stack = Arc::new(StackBuilder::from_config(&config).build(backend.clone()));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let stack = Arc::clone(&stack);
            tokio::spawn(async move {
                stack
                    .process(Message::user(i.to_string()), &CancellationToken::new())
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    stack.shutdown().await;

    let batching = stack.batching().unwrap();
    assert_eq!(batching.metrics().requests_succeeded, 6);
    assert_eq!(stack.retry().unwrap().metrics().attempts, 6);

    let late = stack
        .process(Message::user("late"), &CancellationToken::new())
        .await;
    assert_eq!(late, Err(ProcessorError::QueueClosed));
}
