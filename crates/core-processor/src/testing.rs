//! Scripted fake processors for tests
//!
//! [`ScriptedProcessor`] replays a queue of outcomes, counts how many times it
//! was invoked and can simulate latency. Once the script runs dry it falls
//! back to a fixed default outcome.

use crate::{CancellationToken, Message, Processor, ProcessorError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one scripted call
#[derive(Debug, Clone)]
pub enum Step {
    /// Reply with an assistant message carrying this content
    Reply(String),
    /// Echo the request content back
    Echo,
    /// Fail with the given error
    Fail(ProcessorError),
}

/// A processor that follows a script
#[derive(Debug)]
pub struct ScriptedProcessor {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    honour_cancel: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedProcessor {
    /// A processor that echoes every request
    pub fn echo(name: impl Into<String>) -> Self {
        Self::with_fallback(name, Step::Echo)
    }

    /// A processor that always fails with a transient error
    pub fn failing(name: impl Into<String>) -> Self {
        Self::with_fallback(
            name,
            Step::Fail(ProcessorError::Transient("scripted failure".to_string())),
        )
    }

    pub fn with_fallback(name: impl Into<String>, fallback: Step) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            honour_cancel: true,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes to be returned before the fallback applies
    pub fn then(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(steps);
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep sleeping even after the caller cancels
    pub fn ignoring_cancellation(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    /// Number of times `process` has been entered
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently inside `process`
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Decrements the in-flight count even when the call future is dropped
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BTreeSet<String> {
        BTreeSet::from(["scripted".to_string()])
    }

    async fn process(&self, request: Message, cancel: &CancellationToken) -> Result<Message> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let step = self.next_step();

        let slept = if self.delay.is_zero() {
            true
        } else if self.honour_cancel {
            cancel
                .run_until_cancelled(tokio::time::sleep(self.delay))
                .await
                .is_some()
        } else {
            tokio::time::sleep(self.delay).await;
            true
        };

        if !slept {
            return Err(ProcessorError::Cancelled);
        }

        match step {
            Step::Reply(content) => Ok(Message::assistant(content)),
            Step::Echo => Ok(Message::assistant(request.content)),
            Step::Fail(err) => Err(err),
        }
    }
}
