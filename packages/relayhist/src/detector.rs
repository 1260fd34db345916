//! Change detection for incoming relay records.
//!
//! Pure: no I/O, no cache mutation. The reconciler consumes the returned
//! [`Classification`] and performs the matching effect.

use crate::dlts::Dlts;
use crate::latest_state::{ComparableFields, LatestState};

/// How an incoming record relates to its latest persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Never persisted. Append a row.
    New,
    /// Fields match and the row was already confirmed at this DLTS.
    UnchangedFresh,
    /// Fields match but the snapshot is older than the row's last
    /// confirmation. Nothing may move backwards.
    UnchangedStale,
    /// Fields match and the snapshot is newer: sync addresses and advance
    /// `RecordLastSeen`, no new row.
    Refresh,
    /// Comparable fields differ. Append a row; the old one stays as
    /// history.
    Changed,
}

impl Classification {
    /// True when a relay row is appended.
    pub fn creates_row(&self) -> bool {
        matches!(self, Classification::New | Classification::Changed)
    }

    /// True for the freshness-only update.
    pub fn needs_freshness_update(&self) -> bool {
        matches!(self, Classification::Refresh)
    }

    /// True when the store is written at all.
    pub fn writes(&self) -> bool {
        self.creates_row() || self.needs_freshness_update()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "NEW",
            Classification::UnchangedFresh => "UNCHANGED_FRESH",
            Classification::UnchangedStale => "UNCHANGED_STALE",
            Classification::Refresh => "REFRESH",
            Classification::Changed => "CHANGED",
        }
    }
}

/// Classify `incoming` observed at `dlts` against its cached state.
pub fn classify(
    incoming: &ComparableFields,
    cached: Option<&LatestState>,
    dlts: &Dlts,
) -> Classification {
    let Some(cached) = cached else {
        return Classification::New;
    };

    if !incoming.matches(&cached.fields) {
        return Classification::Changed;
    }

    match dlts.cmp(&cached.record_last_seen) {
        std::cmp::Ordering::Equal => Classification::UnchangedFresh,
        std::cmp::Ordering::Less => Classification::UnchangedStale,
        std::cmp::Ordering::Greater => Classification::Refresh,
    }
}
