/*!
 * Bulwark - composable resilience for async request processors
 *
 * Wrap any `Processor` with:
 * - Circuit breaking with lazy half-open recovery
 * - Token-bucket rate limiting that waits or rejects
 * - An LRU response cache with per-entry TTL
 * - Request batching with a bounded queue and draining shutdown
 * - Retry with exponential backoff
 * - Deadline enforcement
 *
 * Every decorator is itself a `Processor`, so they nest in any order.
 * `StackBuilder` assembles them in the recommended order from a TOML
 * `ResilienceConfig`.
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod stack;

// Re-export commonly used types
pub use bulwark_core_processor::{
    CancellationToken, FnProcessor, Message, Processor, ProcessorError,
};
pub use bulwark_core_resilience as resilience;
pub use config::{LogFormat, LogLevel, LoggingConfig, ResilienceConfig};
pub use error::{ConfigError, Result};
pub use stack::{Stack, StackBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
