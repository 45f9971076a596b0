//! Failure taxonomy shared by every processor and decorator
//!
//! A single error type flows through the [`Processor`](crate::Processor)
//! contract so decorators can be stacked in any order. Callers layering
//! several decorators tell failures apart purely by variant:
//!
//! - rejected before the inner processor ran: [`ProcessorError::CircuitOpen`],
//!   [`ProcessorError::RateLimitExceeded`], [`ProcessorError::QueueClosed`]
//! - the inner processor ran and failed: [`ProcessorError::Timeout`],
//!   [`ProcessorError::RetryExhausted`], [`ProcessorError::NonRetryable`],
//!   and the pass-through [`ProcessorError::Transient`] / [`ProcessorError::Permanent`]
//! - the caller gave up: [`ProcessorError::Cancelled`]

use std::time::Duration;
use thiserror::Error;

/// Errors that can be returned by a processor or any decorator around it
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessorError {
    /// The caller's cancellation token fired while the call was suspended
    #[error("Request cancelled")]
    Cancelled,

    /// Failure reported by a processor that may succeed on a later attempt
    #[error("Transient error: {0}")]
    Transient(String),

    /// Failure reported by a processor that will not go away on its own
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Circuit breaker is open; the inner processor was not invoked
    #[error("Circuit breaker is open after {failures} consecutive failures")]
    CircuitOpen { failures: u32 },

    /// Token bucket could not cover the request cost, even after waiting
    #[error("Rate limit exceeded: needed {needed:.2} tokens, {available:.2} available")]
    RateLimitExceeded { needed: f64, available: f64 },

    /// Deadline exceeded while the inner processor was running
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Every allowed attempt failed
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ProcessorError>,
    },

    /// The retry predicate refused another attempt
    #[error("Non-retryable error on attempt {attempt}: {source}")]
    NonRetryable {
        attempt: u32,
        #[source]
        source: Box<ProcessorError>,
    },

    /// The batching queue has shut down and no longer accepts requests
    #[error("Batching queue is closed")]
    QueueClosed,
}

impl ProcessorError {
    /// Rejected without the inner processor ever running
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProcessorError::CircuitOpen { .. }
                | ProcessorError::RateLimitExceeded { .. }
                | ProcessorError::QueueClosed
        )
    }

    /// Deadline exceeded (possibly wrapped by a retry layer)
    pub fn is_timeout(&self) -> bool {
        match self {
            ProcessorError::Timeout(_) => true,
            ProcessorError::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessorError::Cancelled)
    }

    /// Check if this error is transient and worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessorError::Transient(_)
                | ProcessorError::RateLimitExceeded { .. }
                | ProcessorError::Timeout(_)
        )
    }

    /// Innermost cause, looking through retry wrappers
    pub fn root_cause(&self) -> &ProcessorError {
        match self {
            ProcessorError::RetryExhausted { last, .. } => last.root_cause(),
            ProcessorError::NonRetryable { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
