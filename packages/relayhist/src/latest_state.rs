//! Latest-state cache: each fingerprint's last persisted comparable fields.
//!
//! Rebuilt wholesale from the store at refresh points, then kept in step
//! with the store by applying every successful write in place, so the
//! engine never has to re-read a row it just wrote.
//!
//! NOT Send+Sync by contract -- single owner, single writer.

use std::collections::HashMap;

use crate::dictionary::SurrogateId;
use crate::dlts::Dlts;
use crate::error::Result;
use crate::relay::RelayDetails;
use crate::store::{RelayStore, RowId};

/// The attribute subset whose equality decides CHANGED vs UNCHANGED, in
/// decoded text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparableFields {
    pub nickname: String,
    pub country: String,
    pub city: String,
    pub platform: String,
    pub version: String,
    pub contact: String,
    pub last_changed_address_or_port: String,
    pub first_seen: String,
    pub exit_policy: String,
    pub exit_policy_summary: String,
    pub exit_policy_v6_summary: String,
}

impl ComparableFields {
    pub fn from_relay(relay: &RelayDetails) -> Result<Self> {
        let blobs = relay.policy_blobs()?;
        Ok(Self {
            nickname: relay.nickname.clone(),
            country: relay.country.clone(),
            city: relay.city_name.clone(),
            platform: relay.platform.clone(),
            version: relay.version.clone(),
            contact: relay.contact.clone(),
            last_changed_address_or_port: relay.last_changed_address_or_port.clone(),
            first_seen: relay.first_seen.clone(),
            exit_policy: blobs.exit_policy,
            exit_policy_summary: blobs.exit_policy_summary,
            exit_policy_v6_summary: blobs.exit_policy_v6_summary,
        })
    }

    /// Names of the fields that differ from `other`. Contact is compared
    /// case-insensitively. Empty means the records match.
    pub fn differences(&self, other: &ComparableFields) -> Vec<&'static str> {
        let mut diff = Vec::new();
        if self.nickname != other.nickname {
            diff.push("nickname");
        }
        if self.country != other.country {
            diff.push("country");
        }
        if self.city != other.city {
            diff.push("city");
        }
        if self.platform != other.platform {
            diff.push("platform");
        }
        if self.version != other.version {
            diff.push("version");
        }
        if self.contact.to_lowercase() != other.contact.to_lowercase() {
            diff.push("contact");
        }
        if self.last_changed_address_or_port != other.last_changed_address_or_port {
            diff.push("last_changed_address_or_port");
        }
        if self.first_seen != other.first_seen {
            diff.push("first_seen");
        }
        if self.exit_policy != other.exit_policy {
            diff.push("exit_policy");
        }
        if self.exit_policy_summary != other.exit_policy_summary {
            diff.push("exit_policy_summary");
        }
        if self.exit_policy_v6_summary != other.exit_policy_v6_summary {
            diff.push("exit_policy_v6_summary");
        }
        diff
    }

    pub fn matches(&self, other: &ComparableFields) -> bool {
        self.differences(other).is_empty()
    }
}

/// One cache entry: the persisted row's comparable fields plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestState {
    pub row_id: RowId,
    /// Surrogate id of the fingerprint; keys address history.
    pub entity_id: SurrogateId,
    pub fields: ComparableFields,
    pub record_last_seen: Dlts,
}

/// Outcome of a partial (freshness-only) refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshnessRefresh {
    pub checked: usize,
    pub advanced: usize,
}

/// Fingerprint -> latest persisted state.
#[derive(Debug, Default)]
pub struct LatestStateCache {
    entries: HashMap<String, LatestState>,
    built_as_of: Option<Dlts>,
}

impl LatestStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with the store's state as of `as_of`.
    /// O(store size).
    pub fn rebuild(&mut self, store: &dyn RelayStore, as_of: &Dlts) -> Result<usize> {
        self.entries = store.load_all_latest_states(as_of)?;
        self.built_as_of = Some(as_of.clone());
        tracing::debug!("latest-state cache rebuilt as of {}: {} entries", as_of, self.entries.len());
        Ok(self.entries.len())
    }

    /// Pull newer `RecordLastSeen` values from the store into the existing
    /// entries without reloading their fields. Markers are only ever
    /// raised.
    pub fn refresh_freshness(&mut self, store: &dyn RelayStore) -> Result<FreshnessRefresh> {
        let markers = store.load_freshness_markers()?;
        let mut outcome = FreshnessRefresh::default();
        for entry in self.entries.values_mut() {
            outcome.checked += 1;
            if let Some(stored) = markers.get(&entry.row_id) {
                if *stored > entry.record_last_seen {
                    entry.record_last_seen = stored.clone();
                    outcome.advanced += 1;
                }
            }
        }
        Ok(outcome)
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<&LatestState> {
        self.entries.get(fingerprint)
    }

    /// Install `state` after a successful store write. O(1).
    pub fn apply(&mut self, fingerprint: &str, state: LatestState) {
        self.entries.insert(fingerprint.to_string(), state);
    }

    /// Raise the cached `RecordLastSeen` after a freshness-only write.
    /// Returns false when the fingerprint is not cached.
    pub fn advance(&mut self, fingerprint: &str, dlts: &Dlts) -> bool {
        match self.entries.get_mut(fingerprint) {
            Some(entry) => {
                if *dlts > entry.record_last_seen {
                    entry.record_last_seen = dlts.clone();
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// DLTS the cache was last fully rebuilt for, if ever.
    pub fn built_as_of(&self) -> Option<&Dlts> {
        self.built_as_of.as_ref()
    }
}
