//! Bulwark Core Processor: the request/response contract
//!
//! This crate defines the [`Processor`] trait: accept a [`Message`], return a
//! [`Message`] or a [`ProcessorError`]. Every resilience decorator in
//! `bulwark-core-resilience` both consumes and implements this trait, so
//! decorators compose by plain wrapping.
//!
//! # Example
//!
//! ```rust,no_run
//! use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError};
//!
//! async fn ask<P: Processor + ?Sized>(processor: &P) -> Result<String, ProcessorError> {
//!     let cancel = CancellationToken::new();
//!     let reply = processor.process(Message::user("ping"), &cancel).await?;
//!     Ok(reply.content)
//! }
//! ```
//!
//! # Design Philosophy
//!
//! The trait is deliberately small:
//! - A single async `process` call plus `name()` and `capabilities()` queries
//! - Cancellation is an explicit [`CancellationToken`] parameter, never ambient
//! - Object safe, so stacks are built from `Arc<dyn Processor>`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::ProcessorError;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, ProcessorError>;

/// A request or response flowing through a processor
///
/// Metadata is kept in a `BTreeMap` so iteration order (and therefore any
/// hash derived from it) is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message (e.g. "user", "assistant", "system")
    pub role: String,

    /// Message body
    pub content: String,

    /// Free-form key/value annotations
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create a message with the "user" role
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create a message with the "assistant" role
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The uniform processor contract
///
/// Implementations must be `Send + Sync + 'static` so they can be shared
/// across tasks behind an `Arc`.
///
/// # Cancellation
///
/// `process` receives the caller's [`CancellationToken`]. Implementations
/// that suspend should race their work against `cancel.cancelled()` and
/// return [`ProcessorError::Cancelled`] when it fires.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Human-readable name used in logs and metrics
    fn name(&self) -> &str;

    /// Capabilities advertised by this processor
    fn capabilities(&self) -> BTreeSet<String>;

    /// Handle a single request
    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message>;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        (**self).capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        (**self).process(request, cancel).await
    }
}

/// Adapter turning an async closure into a [`Processor`]
///
/// # Example
///
/// ```
/// use bulwark_core_processor::{FnProcessor, Message};
///
/// let echo = FnProcessor::new("echo", |request: Message| async move {
///     Ok::<_, bulwark_core_processor::ProcessorError>(Message::assistant(request.content))
/// });
/// ```
pub struct FnProcessor<F> {
    name: String,
    capabilities: BTreeSet<String>,
    handler: F,
}

impl<F, Fut> FnProcessor<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            handler,
        }
    }

    /// Advertise an additional capability
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        cancel
            .run_until_cancelled((self.handler)(request))
            .await
            .unwrap_or(Err(ProcessorError::Cancelled))
    }
}
