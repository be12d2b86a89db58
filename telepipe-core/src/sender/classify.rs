//! Collector response classification

use std::collections::HashSet;
use std::ops::RangeInclusive;

use crate::config::PipelineConfig;

/// What to do with a staged unit after the collector answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted; delete the unit and look for more work
    Delivered,
    /// Transient server condition; release the unit for a later attempt
    Recoverable,
    /// Rejected payload; delete the unit without retrying
    Rejected,
}

/// Maps HTTP status codes to a [`Disposition`]
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    recoverable: HashSet<u16>,
    success: RangeInclusive<u16>,
}

impl StatusClassifier {
    pub fn new(recoverable: impl IntoIterator<Item = u16>, success: RangeInclusive<u16>) -> Self {
        Self {
            recoverable: recoverable.into_iter().collect(),
            success,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.recoverable_status_codes.iter().copied(),
            config.success_status_min..=config.success_status_max,
        )
    }

    pub fn classify(&self, status: u16) -> Disposition {
        if self.success.contains(&status) {
            Disposition::Delivered
        } else if self.recoverable.contains(&status) {
            Disposition::Recoverable
        } else {
            Disposition::Rejected
        }
    }
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}
