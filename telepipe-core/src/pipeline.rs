//! Explicit telemetry pipeline
//!
//! [`Pipeline`] wires the channel, staging store and sender together. The
//! host builds one at startup (inside a Tokio runtime), hands references to
//! its producers, and calls [`Pipeline::shutdown`] when done.
//!
//! Two optional timers run alongside:
//! - a flush timer that stages partially filled batches
//! - a retry timer that re-triggers delivery so released units are retried

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::config::PipelineConfig;
use crate::envelope::{ContextProvider, ContextTags, TelemetryData};
use crate::error::{Error, Result};
use crate::sender::{HttpTransport, Sender, SenderConfig, StatusClassifier, Transport};
use crate::staging::StagingStore;
use crate::stats::{PipelineStats, StatsSnapshot};

/// Batching channel, staging store and sender, composed
pub struct Pipeline {
    channel: Arc<Channel>,
    sender: Arc<Sender>,
    store: Arc<StagingStore>,
    context: Option<Arc<dyn ContextProvider>>,
    stats: Arc<PipelineStats>,
    timers: CancellationToken,
}

impl Pipeline {
    /// Start a pipeline that ships to `config.endpoint_url` over HTTP
    pub fn start(config: &PipelineConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config)?);
        Self::start_with_transport(config, transport)
    }

    /// Start a pipeline with a custom transport
    ///
    /// Must be called from within a Tokio runtime. Triggers one delivery
    /// attempt immediately so units left by a previous process are shipped.
    pub fn start_with_transport(
        config: &PipelineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = Handle::try_current().map_err(|_| {
            Error::Config("telemetry pipeline must be started inside a Tokio runtime".to_string())
        })?;

        let stats = Arc::new(PipelineStats::default());
        let store = Arc::new(StagingStore::with_stats(
            config.staging_dir(),
            config.max_staged_units,
            Arc::clone(&stats),
        ));
        let sender = Arc::new(Sender::with_stats(
            Arc::clone(&store),
            transport,
            SenderConfig {
                max_in_flight: config.max_concurrent_requests,
                classifier: StatusClassifier::from_config(config),
            },
            runtime.clone(),
            Arc::clone(&stats),
        ));

        let trigger = Arc::clone(&sender);
        let channel = Arc::new(
            Channel::with_stats(Arc::clone(&store), config.batch_threshold, Arc::clone(&stats))
                .with_instrumentation_key(config.instrumentation_key.clone())
                .on_staged(Arc::new(move || {
                    trigger.trigger_send();
                })),
        );

        let timers = CancellationToken::new();

        if let Some(period) = config.flush_interval() {
            let channel: Weak<Channel> = Arc::downgrade(&channel);
            spawn_ticker(&runtime, period, timers.child_token(), move || {
                // Staging writes to disk, keep it off the runtime workers
                channel
                    .upgrade()
                    .map(|channel| tokio::task::spawn_blocking(move || channel.flush()))
                    .is_some()
            });
        }

        if let Some(period) = config.retry_interval() {
            let sender: Weak<Sender> = Arc::downgrade(&sender);
            spawn_ticker(&runtime, period, timers.child_token(), move || {
                sender
                    .upgrade()
                    .map(|sender| sender.trigger_send())
                    .is_some()
            });
        }

        tracing::info!(
            staging_dir = %store.dir().display(),
            staged = store.staged_count(),
            batch_threshold = config.batch_threshold,
            max_in_flight = config.max_concurrent_requests,
            "Telemetry pipeline started"
        );

        sender.trigger_send();

        Ok(Self {
            channel,
            sender,
            store,
            context: None,
            stats,
            timers,
        })
    }

    /// Merge tags from `provider` into every logged envelope
    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    /// Log a payload. Call-site tags override provider tags with the same key.
    pub fn log<T>(&self, payload: &T, tags: ContextTags)
    where
        T: TelemetryData + ?Sized,
    {
        let tags = match &self.context {
            Some(provider) => {
                let mut merged = provider.tags();
                merged.extend(tags);
                merged
            }
            None => tags,
        };
        self.channel.log(payload, tags);
    }

    /// Stage anything queued (e.g. when the host goes to the background)
    pub fn flush(&self) {
        self.channel.flush();
    }

    /// Poke the sender; returns false if the concurrency cap is reached
    pub fn trigger_send(&self) -> bool {
        self.sender.trigger_send()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn staged_count(&self) -> usize {
        self.store.staged_count()
    }

    pub fn pending_count(&self) -> usize {
        self.channel.pending_count()
    }

    pub fn in_flight(&self) -> usize {
        self.sender.in_flight()
    }

    pub fn store(&self) -> &Arc<StagingStore> {
        &self.store
    }

    /// Stop the timers, stage the queue and trigger a final send.
    ///
    /// In-flight sends keep running until they finish.
    pub fn shutdown(self) {
        self.timers.cancel();
        self.channel.flush();
        self.sender.trigger_send();
        tracing::info!(staged = self.store.staged_count(), "Telemetry pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

/// Run `tick` every `period` until it returns false or `cancel` fires
fn spawn_ticker<F>(runtime: &Handle, period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> bool + Send + 'static,
{
    runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !tick() {
                        break;
                    }
                }
            }
        }
    });
}
