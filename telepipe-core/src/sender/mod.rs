//! Delivery of staged units to the remote collector
//!
//! The sender ships one staged unit per attempt and bounds the number of
//! concurrent attempts with a single shared counter.
//!
//! ## Attempt lifecycle
//!
//! 1. [`Sender::trigger_send`] claims an in-flight slot. If every slot is
//!    taken the call does nothing; a later trigger resumes draining.
//! 2. The attempt claims the next available unit from the staging store.
//!    Units that load as empty are deleted and skipped. Store I/O runs on
//!    the blocking pool so file access never stalls runtime workers.
//! 3. The unit is POSTed and the response classified:
//!    - no status (connect error, timeout): release for retry
//!    - recoverable status: release for retry
//!    - success status: delete, then trigger again to drain backlog
//!    - anything else: delete, log the response body
//!
//! A unit whose file cannot be deleted stays claimed in the store, so
//! neither the empty-unit skip nor the follow-up trigger picks it up again.
//!
//! The slot is an RAII guard, so every exit path gives it back.

mod classify;
mod transport;

pub use classify::{Disposition, StatusClassifier};
pub use transport::{HttpTransport, Transport, TransportResponse, JSON_STREAM_CONTENT_TYPE};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::staging::{StagedUnit, StagingStore};
use crate::stats::PipelineStats;

/// Result of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// No unit was available
    Idle,
    /// Collector accepted the unit; it was deleted
    Delivered,
    /// Recoverable status; the unit was released
    Released { status: u16 },
    /// No status received; the unit was released
    NetworkFailure,
    /// Unexpected status; the unit was deleted
    Rejected { status: u16 },
}

/// Sender settings
pub struct SenderConfig {
    pub max_in_flight: usize,
    pub classifier: StatusClassifier,
}

/// Ships staged units, one attempt per in-flight slot
pub struct Sender {
    store: Arc<StagingStore>,
    transport: Arc<dyn Transport>,
    classifier: StatusClassifier,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    runtime: Handle,
    stats: Arc<PipelineStats>,
}

/// Holds one in-flight slot until dropped
struct InFlightSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Sender {
    /// Create a sender that spawns attempts onto `runtime`.
    ///
    /// Holding a handle lets [`trigger_send`](Self::trigger_send) be called
    /// from threads outside the runtime.
    pub fn new(
        store: Arc<StagingStore>,
        transport: Arc<dyn Transport>,
        config: SenderConfig,
        runtime: Handle,
    ) -> Self {
        Self::with_stats(
            store,
            transport,
            config,
            runtime,
            Arc::new(PipelineStats::default()),
        )
    }

    pub(crate) fn with_stats(
        store: Arc<StagingStore>,
        transport: Arc<dyn Transport>,
        config: SenderConfig,
        runtime: Handle,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            transport,
            classifier: config.classifier,
            max_in_flight: config.max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
            runtime,
            stats,
        }
    }

    /// Number of attempts currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Start a background delivery attempt if a slot is free.
    ///
    /// Returns false when the concurrency cap is reached; nothing is queued.
    pub fn trigger_send(self: &Arc<Self>) -> bool {
        let Some(slot) = self.try_acquire_slot() else {
            tracing::trace!(
                in_flight = self.in_flight(),
                "Delivery cap reached, skipping trigger"
            );
            return false;
        };

        let sender = Arc::clone(self);
        self.runtime.spawn(async move {
            let outcome = {
                let _slot = slot;
                sender.send_next().await
            };
            if outcome == SendOutcome::Delivered {
                sender.trigger_send();
            }
        });
        true
    }

    /// Run one attempt on the current task, without a follow-up trigger.
    ///
    /// Returns `None` when the concurrency cap is reached. Useful for hosts
    /// that drive delivery from their own scheduler.
    pub async fn send_once(&self) -> Option<SendOutcome> {
        let _slot = self.try_acquire_slot()?;
        Some(self.send_next().await)
    }

    fn try_acquire_slot(&self) -> Option<InFlightSlot> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_in_flight).then_some(current + 1)
            })
            .ok()
            .map(|_| InFlightSlot {
                counter: Arc::clone(&self.in_flight),
            })
    }

    async fn send_next(&self) -> SendOutcome {
        loop {
            let claimed = self
                .with_store(|store| {
                    store
                        .next_available()
                        .map(|unit| {
                            let payload = store.load(&unit);
                            (unit, payload)
                        })
                })
                .await;
            let Some((unit, payload)) = claimed.flatten() else {
                return SendOutcome::Idle;
            };

            if payload.is_empty() {
                tracing::debug!(unit = %unit.id(), "Staged unit is empty, deleting");
                // A unit that cannot be deleted stays claimed, so the next
                // claim moves past it
                self.delete(&unit).await;
                continue;
            }

            return self.deliver(&unit, &payload).await;
        }
    }

    async fn deliver(&self, unit: &StagedUnit, payload: &str) -> SendOutcome {
        let response = match self.transport.send(payload).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(unit = %unit.id(), error = %e, "Transient error sending telemetry");
                self.release(unit).await;
                self.stats.record_network_failure();
                return SendOutcome::NetworkFailure;
            }
        };

        let status = response.status;
        match self.classifier.classify(status) {
            Disposition::Delivered => {
                tracing::debug!(unit = %unit.id(), status, "Delivered staged unit");
                self.delete(unit).await;
                self.stats.record_delivered();
                SendOutcome::Delivered
            }
            Disposition::Recoverable => {
                tracing::info!(unit = %unit.id(), status, "Recoverable response, will retry");
                self.release(unit).await;
                self.stats.record_released();
                SendOutcome::Released { status }
            }
            Disposition::Rejected => {
                tracing::error!(
                    unit = %unit.id(),
                    status,
                    body = %response.body.as_deref().unwrap_or(""),
                    "Collector rejected staged unit, dropping"
                );
                self.delete(unit).await;
                self.stats.record_rejected();
                SendOutcome::Rejected { status }
            }
        }
    }

    async fn delete(&self, unit: &StagedUnit) {
        let unit = unit.clone();
        self.with_store(move |store| store.delete_unit(&unit)).await;
    }

    async fn release(&self, unit: &StagedUnit) {
        let unit = unit.clone();
        self.with_store(move |store| store.release(&unit)).await;
    }

    /// Run a staging store operation on the blocking thread pool
    async fn with_store<T, F>(&self, op: F) -> Option<T>
    where
        F: FnOnce(&StagingStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "Staging store task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use mockito::Server;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers with a scripted list of statuses (`None` = network failure)
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Option<u16>>>,
        payloads: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: &[Option<u16>]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                payloads: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, payload: &str) -> Result<TransportResponse> {
            self.payloads.lock().unwrap().push(payload.to_string());
            match self.script.lock().unwrap().pop_front().unwrap_or(Some(200)) {
                Some(status) => Ok(TransportResponse {
                    status,
                    body: Some("scripted".to_string()),
                }),
                None => Err(Error::Http("connection reset".to_string())),
            }
        }
    }

    fn sender_with(
        dir: &TempDir,
        transport: Arc<dyn Transport>,
        max_in_flight: usize,
    ) -> (Arc<StagingStore>, Arc<Sender>) {
        let store = Arc::new(StagingStore::new(dir.path().join("telemetry"), 50));
        let sender = Arc::new(Sender::new(
            Arc::clone(&store),
            transport,
            SenderConfig {
                max_in_flight,
                classifier: StatusClassifier::default(),
            },
            Handle::current(),
        ));
        (store, sender)
    }

    fn http_transport(url: &str) -> Arc<dyn Transport> {
        let config = PipelineConfig {
            gzip: false,
            ..PipelineConfig::for_endpoint(format!("{}/v2/track", url))
        };
        Arc::new(HttpTransport::new(&config).unwrap())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("timed out waiting for condition");
    }

    #[tokio::test]
    async fn test_send_once_idle_when_empty() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let (_store, sender) = sender_with(&dir, transport.clone(), 10);

        assert_eq!(sender.send_once().await, Some(SendOutcome::Idle));
        assert_eq!(transport.calls(), 0);
        assert_eq!(sender.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_recoverable_status_releases_unit() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/track")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let (store, sender) = sender_with(&dir, http_transport(&server.url()), 10);
        store.persist(&["{\"n\":1}".to_string()]);

        let outcome = sender.send_once().await;

        assert_eq!(outcome, Some(SendOutcome::Released { status: 429 }));
        assert_eq!(store.staged_count(), 1);
        let unit = store.next_available().expect("unit should be available again");
        assert_eq!(store.load(&unit), "{\"n\":1}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_status_deletes_unit() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/track")
            .with_status(403)
            .with_body("forbidden")
            .expect(1)
            .create_async()
            .await;
        let (store, sender) = sender_with(&dir, http_transport(&server.url()), 10);
        store.persist(&["{\"n\":1}".to_string()]);

        let outcome = sender.send_once().await;

        assert_eq!(outcome, Some(SendOutcome::Rejected { status: 403 }));
        assert_eq!(store.staged_count(), 0);
        assert!(store.next_available().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_success_deletes_and_drains_backlog() {
        let dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/track")
            .with_status(200)
            .expect(3)
            .create_async()
            .await;
        let (store, sender) = sender_with(&dir, http_transport(&server.url()), 1);
        for n in 0..3 {
            store.persist(&[format!("{{\"n\":{}}}", n)]);
        }

        // One trigger drains all three through follow-up triggers, even with a cap of 1
        assert!(sender.trigger_send());
        wait_until(|| store.staged_count() == 0 && sender.in_flight() == 0).await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_failure_releases_unit() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new(&[None]));
        let (store, sender) = sender_with(&dir, transport.clone(), 10);
        store.persist(&["{\"n\":1}".to_string()]);

        assert_eq!(sender.send_once().await, Some(SendOutcome::NetworkFailure));
        assert_eq!(store.staged_count(), 1);
        assert!(store.next_available().is_some());
        assert_eq!(sender.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cap_blocks_network_calls() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let (store, sender) = sender_with(&dir, transport.clone(), 2);
        store.persist(&["{\"n\":1}".to_string()]);

        let held: Vec<_> = (0..2).map(|_| sender.try_acquire_slot().unwrap()).collect();
        assert_eq!(sender.in_flight(), 2);

        assert!(!sender.trigger_send());
        assert_eq!(sender.send_once().await, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls(), 0);

        drop(held);
        assert_eq!(sender.in_flight(), 0);
        assert!(sender.trigger_send());
        wait_until(|| store.staged_count() == 0).await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_unit_deleted_without_network_call() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let (store, sender) = sender_with(&dir, transport.clone(), 10);
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("empty-unit"), "").unwrap();

        assert_eq!(sender.send_once().await, Some(SendOutcome::Idle));
        assert_eq!(store.staged_count(), 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_undeletable_empty_unit_does_not_spin() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let (store, sender) = sender_with(&dir, transport.clone(), 10);
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("empty-unit"), "").unwrap();
        store.fail_deletes();

        let outcome = tokio::time::timeout(Duration::from_secs(5), sender.send_once())
            .await
            .expect("attempt should finish");
        assert_eq!(outcome, Some(SendOutcome::Idle));

        // Still claimed, so later attempts skip it too
        assert_eq!(sender.send_once().await, Some(SendOutcome::Idle));
        assert_eq!(store.staged_count(), 1);
        assert_eq!(transport.calls(), 0);
        assert_eq!(sender.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_undeletable_delivered_unit_sent_once() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new(&[Some(200), Some(200)]));
        let (store, sender) = sender_with(&dir, transport.clone(), 1);
        store.persist(&["{\"n\":1}".to_string()]);
        store.fail_deletes();

        assert!(sender.trigger_send());
        wait_until(|| transport.calls() == 1 && sender.in_flight() == 0).await;

        // The follow-up trigger finds nothing to claim
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(sender.in_flight(), 0);
        assert_eq!(store.staged_count(), 1);
        assert!(sender.trigger_send());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_counter_released_on_every_path() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new(&[
            None,
            Some(503),
            Some(400),
            Some(201),
        ]));
        let (store, sender) = sender_with(&dir, transport.clone(), 1);
        store.persist(&["a".to_string()]);
        store.persist(&["b".to_string()]);

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(sender.send_once().await.expect("slot should be free"));
            assert_eq!(sender.in_flight(), 0);
        }

        assert_eq!(outcomes[0], SendOutcome::NetworkFailure);
        assert_eq!(outcomes[1], SendOutcome::Released { status: 503 });
        assert_eq!(outcomes[2], SendOutcome::Rejected { status: 400 });
        assert_eq!(outcomes[3], SendOutcome::Delivered);
        assert_eq!(store.staged_count(), 0);
    }
}
