//! In-memory batching of serialized envelopes
//!
//! The channel turns producer payloads into envelope lines and queues them.
//! When the queue reaches the batch threshold, or [`Channel::flush`] is
//! called, the whole queue is staged as one batch and the staged hook fires
//! (normally the sender's trigger).
//!
//! Staging happens synchronously on the thread that crossed the threshold
//! or called flush. Async callers should flush from `spawn_blocking`.
//!
//! Anything still queued when the process dies is lost.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::{ContextTags, Envelope, TelemetryData};
use crate::staging::StagingStore;
use crate::stats::PipelineStats;

/// Called after a batch was staged
pub type StagedHook = Arc<dyn Fn() + Send + Sync>;

/// Batches envelopes and hands full batches to the staging store
pub struct Channel {
    /// Serialized envelopes not yet staged, in call order
    queue: Mutex<Vec<String>>,
    batch_threshold: usize,
    instrumentation_key: Option<String>,
    store: Arc<StagingStore>,
    on_staged: Option<StagedHook>,
    stats: Arc<PipelineStats>,
}

impl Channel {
    /// Create a channel that stages a batch every `batch_threshold` events
    pub fn new(store: Arc<StagingStore>, batch_threshold: usize) -> Self {
        Self::with_stats(store, batch_threshold, Arc::new(PipelineStats::default()))
    }

    pub(crate) fn with_stats(
        store: Arc<StagingStore>,
        batch_threshold: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queue: Mutex::new(Vec::with_capacity(batch_threshold.max(1))),
            batch_threshold: batch_threshold.max(1),
            instrumentation_key: None,
            store,
            on_staged: None,
            stats,
        }
    }

    /// Stamp every envelope with this instrumentation key
    pub fn with_instrumentation_key(mut self, key: Option<String>) -> Self {
        self.instrumentation_key = key;
        self
    }

    /// Run `hook` after every successful staging
    pub fn on_staged(mut self, hook: StagedHook) -> Self {
        self.on_staged = Some(hook);
        self
    }

    /// Wrap `payload` in an envelope and queue it.
    ///
    /// Serialization failures are logged and the event is dropped.
    pub fn log<T>(&self, payload: &T, tags: ContextTags)
    where
        T: TelemetryData + ?Sized,
    {
        let line = Envelope::wrap(payload, tags, self.instrumentation_key.as_deref())
            .and_then(|envelope| envelope.to_line());

        match line {
            Ok(line) => self.enqueue(line),
            Err(e) => {
                tracing::warn!(
                    name = %payload.envelope_name(),
                    error = %e,
                    "Failed to build envelope, dropping event"
                );
                self.stats.record_event_dropped();
            }
        }
    }

    /// Queue an already-serialized envelope. Empty input is ignored.
    pub fn enqueue(&self, serialized: String) {
        if serialized.is_empty() {
            return;
        }

        let staged = {
            let mut queue = self.queue();
            queue.push(serialized);
            self.stats.record_event_logged();
            if queue.len() >= self.batch_threshold {
                self.stage(&mut queue)
            } else {
                false
            }
        };

        if staged {
            self.notify_staged();
        }
    }

    /// Stage whatever is queued as one batch
    pub fn flush(&self) {
        let staged = {
            let mut queue = self.queue();
            self.stage(&mut queue)
        };

        if staged {
            self.notify_staged();
        }
    }

    /// Number of envelopes waiting in memory
    pub fn pending_count(&self) -> usize {
        self.queue().len()
    }

    pub fn batch_threshold(&self) -> usize {
        self.batch_threshold
    }

    /// Drain the queue into the store while the caller holds the queue lock
    fn stage(&self, queue: &mut Vec<String>) -> bool {
        if queue.is_empty() {
            return false;
        }
        let batch = std::mem::replace(queue, Vec::with_capacity(self.batch_threshold));
        tracing::trace!(events = batch.len(), "Flushing batch");
        self.store.persist(&batch)
    }

    fn notify_staged(&self) {
        if let Some(hook) = &self.on_staged {
            hook();
        }
    }

    fn queue(&self) -> MutexGuard<'_, Vec<String>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
