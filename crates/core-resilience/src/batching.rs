//! Batching queue: amortize scheduling across bursts of requests
//!
//! Callers enqueue their request and wait on a private single-use result
//! slot. A background collector takes the first queued item, keeps
//! accumulating until either `max_batch_size` items are in hand or
//! `max_wait_time` has passed since the first one, then dispatches the batch.
//!
//! Dispatch invokes the inner processor once per request, concurrently.
//! Payloads are never merged into a single call; each caller gets its own
//! result delivered independently.
//!
//! ```text
//!   callers ──► mpsc (max_queue_size) ──► collector ──► batch ──► inner × N
//!      ▲                                                              │
//!      └──────────────────── oneshot result slots ◄───────────────────┘
//! ```
//!
//! # Shutdown
//!
//! [`BatchQueue::shutdown`] stops the collector from starting new
//! iterations, closes the queue to new submissions, drains and processes
//! whatever is still queued, and waits for in-flight batches to finish.

use async_trait::async_trait;
use bulwark_core_processor::{CancellationToken, Message, Processor, ProcessorError, Result};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Configuration for the batching queue
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Largest number of requests dispatched together
    pub max_batch_size: usize,
    /// Longest time the collector waits after the first item of a batch
    pub max_wait_time: Duration,
    /// Capacity of the submission queue; submitters wait when it is full
    pub max_queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait_time: Duration::from_millis(100),
            max_queue_size: 1000,
        }
    }
}

impl BatchConfig {
    /// Replace zero fields with their defaults
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_batch_size: if self.max_batch_size == 0 {
                defaults.max_batch_size
            } else {
                self.max_batch_size
            },
            max_wait_time: if self.max_wait_time.is_zero() {
                defaults.max_wait_time
            } else {
                self.max_wait_time
            },
            max_queue_size: if self.max_queue_size == 0 {
                defaults.max_queue_size
            } else {
                self.max_queue_size
            },
        }
    }
}

/// How a dispatched batch turned out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every request succeeded
    Successful,
    /// Every request failed
    Failed,
    /// Some succeeded, some failed
    Partial,
}

impl BatchOutcome {
    fn classify(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => BatchOutcome::Successful,
            (0, _) => BatchOutcome::Failed,
            _ => BatchOutcome::Partial,
        }
    }
}

/// Point-in-time view of a batching queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchMetrics {
    /// Requests accepted into the queue
    pub submitted: u64,
    /// Batches dispatched
    pub batches: u64,
    pub successful_batches: u64,
    pub failed_batches: u64,
    pub partial_batches: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub largest_batch: usize,
    /// Total time requests spent queued before dispatch
    pub total_queue_wait: Duration,
    /// Requests accepted but not yet dispatched when the snapshot was taken
    pub queue_depth: usize,
}

impl BatchMetrics {
    pub fn average_batch_size(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            (self.requests_succeeded + self.requests_failed) as f64 / self.batches as f64
        }
    }
}

/// A queued request and the slot its result goes to
struct BatchRequest {
    request: Message,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<Message>>,
    enqueued_at: Instant,
}

/// State shared between callers and the collector
struct Shared {
    inner: Arc<dyn Processor>,
    config: BatchConfig,
    metrics: Mutex<BatchMetrics>,
    /// Requests accepted but not yet dispatched
    pending: AtomicUsize,
}

impl Shared {
    fn metrics(&self) -> std::sync::MutexGuard<'_, BatchMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run every request in the batch concurrently and deliver each result
    async fn dispatch(&self, batch: Vec<BatchRequest>) -> BatchOutcome {
        let size = batch.len();
        self.pending.fetch_sub(size, Ordering::AcqRel);
        let dispatched_at = Instant::now();
        let queue_wait: Duration = batch
            .iter()
            .map(|item| dispatched_at.saturating_duration_since(item.enqueued_at))
            .sum();

        debug!(processor = self.inner.name(), size, "Dispatching batch");

        let calls = batch.into_iter().map(|item| async move {
            let result = self.inner.process(item.request, &item.cancel).await;
            let ok = result.is_ok();
            // Receiver may be gone if the caller cancelled; the result is dropped
            let _ = item.reply.send(result);
            ok
        });
        let results = join_all(calls).await;

        let succeeded = results.iter().filter(|ok| **ok).count();
        let failed = size - succeeded;
        let outcome = BatchOutcome::classify(succeeded, failed);

        let mut metrics = self.metrics();
        metrics.batches += 1;
        metrics.requests_succeeded += succeeded as u64;
        metrics.requests_failed += failed as u64;
        metrics.largest_batch = metrics.largest_batch.max(size);
        metrics.total_queue_wait += queue_wait;
        match outcome {
            BatchOutcome::Successful => metrics.successful_batches += 1,
            BatchOutcome::Failed => metrics.failed_batches += 1,
            BatchOutcome::Partial => metrics.partial_batches += 1,
        }

        outcome
    }
}

/// Batching decorator
///
/// Must be constructed inside a Tokio runtime: the collector is spawned on
/// creation.
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{BatchConfig, BatchQueue};
/// use bulwark_core_processor::{CancellationToken, FnProcessor, Message, Processor, ProcessorError};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ProcessorError> {
///     let backend = Arc::new(FnProcessor::new("backend", |m: Message| async move {
///         Ok::<_, ProcessorError>(m)
///     }));
///     let queue = BatchQueue::new(backend, BatchConfig::default());
///
///     let reply = queue.process(Message::user("hi"), &CancellationToken::new()).await?;
///     queue.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct BatchQueue {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<BatchRequest>>>,
    shutdown: CancellationToken,
    collector: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchQueue {
    pub fn new(inner: Arc<dyn Processor>, config: BatchConfig) -> Self {
        let config = config.normalized();
        let (sender, receiver) = mpsc::channel(config.max_queue_size);
        let shared = Arc::new(Shared {
            inner,
            config,
            metrics: Mutex::new(BatchMetrics::default()),
            pending: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let collector = tokio::spawn(collect(Arc::clone(&shared), receiver, shutdown.clone()));

        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            shutdown,
            collector: tokio::sync::Mutex::new(Some(collector)),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    fn sender(&self) -> Option<mpsc::Sender<BatchRequest>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests accepted but not yet dispatched, including those held in a
    /// batch that is still collecting or being drained
    pub fn queue_depth(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn metrics(&self) -> BatchMetrics {
        let depth = self.queue_depth();
        BatchMetrics {
            queue_depth: depth,
            ..self.shared.metrics().clone()
        }
    }

    /// Stop collecting, drain what is queued, and wait for in-flight batches
    ///
    /// Safe to call more than once; later calls return once the first has
    /// finished draining.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown.cancel();

        let mut collector = self.collector.lock().await;
        if let Some(handle) = collector.take() {
            if let Err(err) = handle.await {
                error!(processor = self.shared.inner.name(), error = %err, "Batch collector panicked");
            }
        }
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        // Let the collector drain and exit even without an explicit shutdown
        self.shutdown.cancel();
    }
}

/// Collector loop, running on its own task
async fn collect(
    shared: Arc<Shared>,
    mut receiver: mpsc::Receiver<BatchRequest>,
    shutdown: CancellationToken,
) {
    let tracker = TaskTracker::new();
    let max_batch_size = shared.config.max_batch_size;
    let max_wait_time = shared.config.max_wait_time;

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = receiver.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        // Preallocate no more than the queue can hold
        let mut batch = Vec::with_capacity(max_batch_size.min(shared.config.max_queue_size));
        batch.push(first);
        let deadline = tokio::time::sleep(max_wait_time);
        tokio::pin!(deadline);

        while batch.len() < max_batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                _ = shutdown.cancelled() => break,
                item = receiver.recv() => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
            }
        }

        let shared = Arc::clone(&shared);
        tracker.spawn(async move {
            shared.dispatch(batch).await;
        });
    }

    // Refuse new submissions, then process whatever is still queued
    receiver.close();
    let mut remaining = Vec::new();
    while let Some(item) = receiver.recv().await {
        remaining.push(item);
    }

    if !remaining.is_empty() {
        info!(
            processor = shared.inner.name(),
            remaining = remaining.len(),
            "Draining batching queue"
        );
    }

    while !remaining.is_empty() {
        let rest = remaining.split_off(remaining.len().min(max_batch_size));
        let batch = std::mem::replace(&mut remaining, rest);
        shared.dispatch(batch).await;
    }

    tracker.close();
    tracker.wait().await;
    info!(processor = shared.inner.name(), "Batching queue closed");
}

#[async_trait]
impl Processor for BatchQueue {
    fn name(&self) -> &str {
        self.shared.inner.name()
    }

    fn capabilities(&self) -> BTreeSet<String> {
        self.shared.inner.capabilities()
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        let sender = self.sender().ok_or(ProcessorError::QueueClosed)?;

        // Waits while the queue is full
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
            permit = sender.reserve() => permit.map_err(|_| ProcessorError::QueueClosed)?,
        };

        let (reply, result) = oneshot::channel();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(BatchRequest {
            request,
            cancel: cancel.clone(),
            reply,
            enqueued_at: Instant::now(),
        });
        drop(sender);
        self.shared.metrics().submitted += 1;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProcessorError::Cancelled),
            delivered = result => delivered.unwrap_or(Err(ProcessorError::QueueClosed)),
        }
    }
}
