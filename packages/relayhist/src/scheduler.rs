//! Cache refresh scheduling: full rebuild every K snapshots, cheap
//! freshness pull in between.

use std::num::NonZeroUsize;

use crate::error::{RelayError, Result};

pub const DEFAULT_REFRESH_INTERVAL: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Reload the latest-state cache as of the snapshot's DLTS and drop the
    /// value dictionary memo.
    FullRebuild,
    /// Only pull newer freshness markers into existing cache entries.
    FreshnessOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshScheduler {
    interval: NonZeroUsize,
}

impl RefreshScheduler {
    pub fn new(interval: usize) -> Result<Self> {
        NonZeroUsize::new(interval)
            .map(|interval| Self { interval })
            .ok_or(RelayError::InvalidRefreshInterval(interval))
    }

    pub fn interval(&self) -> usize {
        self.interval.get()
    }

    /// `index` is the 0-based position of the snapshot in the run.
    pub fn should_fully_rebuild(&self, index: usize) -> bool {
        index % self.interval.get() == 0
    }

    pub fn plan(&self, index: usize) -> RefreshPlan {
        if self.should_fully_rebuild(index) {
            RefreshPlan::FullRebuild
        } else {
            RefreshPlan::FreshnessOnly
        }
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self {
            interval: NonZeroUsize::MIN,
        }
    }
}
