//! Batch delta extraction for sequential multi-snapshot imports.
//!
//! Consecutive snapshots in a backfill are mostly identical. Only new or
//! modified records are forwarded to the reconciler. A record deeply equal
//! to its predecessor is never reconciled for that snapshot, so its
//! `RecordLastSeen` and address sightings stay at the last snapshot that
//! forwarded it. Backfills trade that freshness for throughput.

use std::collections::HashMap;

use crate::relay::RelayDetails;

/// Records of `current` that are absent from `previous` (by fingerprint)
/// or not deeply equal to their previous counterpart. Order of `current`
/// is preserved. O(|previous| + |current|).
pub fn extract_new_and_updated(previous: &[RelayDetails], current: &[RelayDetails]) -> Vec<RelayDetails> {
    let index: HashMap<&str, usize> = previous
        .iter()
        .enumerate()
        .map(|(i, r)| (r.fingerprint.as_str(), i))
        .collect();

    current
        .iter()
        .filter(|record| match index.get(record.fingerprint.as_str()) {
            Some(&i) => previous[i] != **record,
            None => true,
        })
        .cloned()
        .collect()
}
