//! Pipeline counters
//!
//! Every component records into one shared [`PipelineStats`]; hosts read a
//! plain [`StatsSnapshot`] copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the channel, staging store and sender
#[derive(Debug, Default)]
pub struct PipelineStats {
    events_logged: AtomicU64,
    events_dropped: AtomicU64,
    batches_staged: AtomicU64,
    batches_dropped: AtomicU64,
    units_delivered: AtomicU64,
    units_released: AtomicU64,
    units_rejected: AtomicU64,
    network_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events accepted into the in-memory queue
    pub events_logged: u64,
    /// Events that failed envelope construction
    pub events_dropped: u64,
    /// Batches written to the staging directory
    pub batches_staged: u64,
    /// Batches discarded by backpressure or a failed write
    pub batches_dropped: u64,
    /// Units deleted after a success response
    pub units_delivered: u64,
    /// Units released after a recoverable status
    pub units_released: u64,
    /// Units deleted after an unexpected status
    pub units_rejected: u64,
    /// Attempts that failed before a status was received
    pub network_failures: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub(crate) fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    counter!(record_event_logged, events_logged);
    counter!(record_event_dropped, events_dropped);
    counter!(record_batch_staged, batches_staged);
    counter!(record_batch_dropped, batches_dropped);
    counter!(record_delivered, units_delivered);
    counter!(record_released, units_released);
    counter!(record_rejected, units_rejected);
    counter!(record_network_failure, network_failures);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_logged: self.events_logged.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_staged: self.batches_staged.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            units_delivered: self.units_delivered.load(Ordering::Relaxed),
            units_released: self.units_released.load(Ordering::Relaxed),
            units_rejected: self.units_rejected.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
        }
    }
}
