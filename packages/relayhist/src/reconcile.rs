//! Snapshot reconciliation engine.
//!
//! Owns the store and the two run-scoped caches. For every snapshot:
//!
//! 1. The refresh scheduler decides between a full cache rebuild and a
//!    freshness-only pull.
//! 2. When a previous batch is supplied, the delta extractor drops records
//!    identical to their predecessor.
//! 3. Each remaining record is classified against the latest-state cache
//!    and the matching effect is applied to the store, then mirrored into
//!    the cache.
//!
//! Failures are fatal for the snapshot and come back wrapped in
//! [`RelayError::Reconcile`] with the position needed to resume.

use std::time::Instant;

use crate::addresses::{sync_addresses, AddressSyncStats};
use crate::delta::extract_new_and_updated;
use crate::detector::{classify, Classification};
use crate::dictionary::{DictionaryClass, ValueDictionary};
use crate::dlts::Dlts;
use crate::error::{RelayError, Result};
use crate::latest_state::{ComparableFields, LatestState, LatestStateCache};
use crate::relay::RelayDetails;
use crate::scheduler::{RefreshPlan, RefreshScheduler};
use crate::store::{NewRelayRow, RelayStore};

/// Counters for one `reconcile` call, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Records that reached the change detector.
    pub processed: usize,
    pub new: usize,
    pub changed: usize,
    pub refreshed: usize,
    pub unchanged_fresh: usize,
    pub unchanged_stale: usize,
    /// Records dropped by the delta extractor before classification.
    pub skipped_by_delta: usize,
    /// Records without a fingerprint.
    pub skipped_invalid: usize,
    pub full_rebuilds: usize,
    pub addresses: AddressSyncStats,
}

impl ReconcileStats {
    /// Relay rows written (appended or advanced).
    pub fn rows_written(&self) -> usize {
        self.new + self.changed + self.refreshed
    }

    pub fn merge(&mut self, other: &ReconcileStats) {
        self.processed += other.processed;
        self.new += other.new;
        self.changed += other.changed;
        self.refreshed += other.refreshed;
        self.unchanged_fresh += other.unchanged_fresh;
        self.unchanged_stale += other.unchanged_stale;
        self.skipped_by_delta += other.skipped_by_delta;
        self.skipped_invalid += other.skipped_invalid;
        self.full_rebuilds += other.full_rebuilds;
        self.addresses.merge(other.addresses);
    }

    fn count(&mut self, classification: Classification) {
        self.processed += 1;
        match classification {
            Classification::New => self.new += 1,
            Classification::Changed => self.changed += 1,
            Classification::Refresh => self.refreshed += 1,
            Classification::UnchangedFresh => self.unchanged_fresh += 1,
            Classification::UnchangedStale => self.unchanged_stale += 1,
        }
    }
}

pub struct Reconciler<S: RelayStore> {
    store: S,
    dictionary: ValueDictionary,
    cache: LatestStateCache,
    scheduler: RefreshScheduler,
    /// Index the next non-first snapshot gets.
    next_snapshot: usize,
    last_completed_snapshot: Option<usize>,
    last_reconciled: Option<String>,
}

impl<S: RelayStore> Reconciler<S> {
    /// New engine with refresh interval 1 (full rebuild every snapshot).
    pub fn new(store: S) -> Self {
        Self {
            store,
            dictionary: ValueDictionary::new(),
            cache: LatestStateCache::new(),
            scheduler: RefreshScheduler::default(),
            next_snapshot: 0,
            last_completed_snapshot: None,
            last_reconciled: None,
        }
    }

    /// Rebuild the latest-state cache every `interval` snapshots.
    pub fn set_refresh_interval(&mut self, interval: usize) -> Result<()> {
        self.scheduler = RefreshScheduler::new(interval)?;
        Ok(())
    }

    pub fn refresh_interval(&self) -> usize {
        self.scheduler.interval()
    }

    /// Reconcile one snapshot batch observed at `dlts`.
    pub fn reconcile(&mut self, batch: &[RelayDetails], dlts: &Dlts, is_first_in_run: bool) -> Result<ReconcileStats> {
        self.reconcile_with_previous(batch, None, dlts, is_first_in_run)
    }

    /// Like [`reconcile`](Self::reconcile), but when `previous` (the full
    /// preceding batch) is given and this is not the first snapshot of the
    /// run, records identical to their predecessor are skipped.
    pub fn reconcile_with_previous(
        &mut self,
        batch: &[RelayDetails],
        previous: Option<&[RelayDetails]>,
        dlts: &Dlts,
        is_first_in_run: bool,
    ) -> Result<ReconcileStats> {
        let start = Instant::now();
        let index = if is_first_in_run { 0 } else { self.next_snapshot };
        self.last_reconciled = None;

        let mut stats = ReconcileStats::default();

        match self.scheduler.plan(index) {
            RefreshPlan::FullRebuild => {
                let entries = self.cache.rebuild(&self.store, dlts)?;
                stats.full_rebuilds = 1;
                tracing::debug!("snapshot {}: full cache rebuild, {} entries", index, entries);
            }
            RefreshPlan::FreshnessOnly => {
                let refreshed = self.cache.refresh_freshness(&self.store)?;
                tracing::debug!(
                    "snapshot {}: freshness refresh, {}/{} markers advanced",
                    index,
                    refreshed.advanced,
                    refreshed.checked
                );
            }
        }

        let delta;
        let records: &[RelayDetails] = match previous {
            Some(previous) if !is_first_in_run => {
                delta = extract_new_and_updated(previous, batch);
                stats.skipped_by_delta = batch.len() - delta.len();
                &delta
            }
            _ => batch,
        };

        for relay in records {
            if relay.fingerprint.is_empty() {
                tracing::warn!("snapshot {}: skipping relay {:?} without fingerprint", index, relay.nickname);
                stats.skipped_invalid += 1;
                continue;
            }
            match self.reconcile_record(relay, dlts, &mut stats) {
                Ok(classification) => {
                    stats.count(classification);
                    self.last_reconciled = Some(relay.fingerprint.clone());
                }
                Err(e) => {
                    tracing::error!("snapshot {}: relay {} failed: {}", index, relay.fingerprint, e);
                    return Err(RelayError::Reconcile {
                        snapshot: index,
                        fingerprint: relay.fingerprint.clone(),
                        last_reconciled: self.last_reconciled.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }

        self.next_snapshot = index + 1;
        self.last_completed_snapshot = Some(index);

        let dict = self.dictionary.take_stats();
        tracing::info!(
            "snapshot {} ({}): {} processed, {} new, {} changed, {} refreshed, {} unchanged, {} skipped by delta in {:?}",
            index,
            dlts,
            stats.processed,
            stats.new,
            stats.changed,
            stats.refreshed,
            stats.unchanged_fresh + stats.unchanged_stale,
            stats.skipped_by_delta,
            start.elapsed()
        );
        tracing::debug!(
            "snapshot {}: dictionary {} hits, {} misses; addresses {} inserted, {} advanced",
            index,
            dict.hits,
            dict.misses,
            stats.addresses.inserted,
            stats.addresses.advanced
        );

        Ok(stats)
    }

    fn reconcile_record(
        &mut self,
        relay: &RelayDetails,
        dlts: &Dlts,
        stats: &mut ReconcileStats,
    ) -> Result<Classification> {
        let mut fields = ComparableFields::from_relay(relay)?;
        fields.contact = fields.contact.trim().to_string();

        let cached = self.cache.lookup(&relay.fingerprint);
        let classification = classify(&fields, cached, dlts);

        if let (Classification::Changed, Some(cached)) = (classification, cached) {
            tracing::debug!(
                "{} changed: {}",
                relay.fingerprint,
                fields.differences(&cached.fields).join(", ")
            );
        } else {
            tracing::trace!("{} {}", relay.fingerprint, classification.as_str());
        }

        match classification {
            Classification::New | Classification::Changed => {
                let cached_rls = cached.map(|c| c.record_last_seen.clone());
                let state = self.append_row(relay, fields, dlts, stats)?;
                match cached_rls {
                    Some(rls) if *dlts < rls => {
                        tracing::debug!(
                            "{}: historical row {} at {} older than cached state ({})",
                            relay.fingerprint,
                            state.row_id,
                            dlts,
                            rls
                        );
                    }
                    _ => self.cache.apply(&relay.fingerprint, state),
                }
            }
            Classification::Refresh => {
                let (row_id, entity_id) = match cached {
                    Some(c) => (c.row_id, c.entity_id),
                    None => return Err(RelayError::Store(format!("no cached state for {}", relay.fingerprint))),
                };
                let addr = sync_addresses(&mut self.store, entity_id, relay, dlts)?;
                stats.addresses.merge(addr);
                self.store.advance_relay_freshness(row_id, dlts)?;
                self.cache.advance(&relay.fingerprint, dlts);
            }
            Classification::UnchangedFresh | Classification::UnchangedStale => {}
        }

        Ok(classification)
    }

    /// Resolve every dictionary-backed attribute, append a row, then sync
    /// addresses under the fingerprint's entity id.
    fn append_row(
        &mut self,
        relay: &RelayDetails,
        fields: ComparableFields,
        dlts: &Dlts,
        stats: &mut ReconcileStats,
    ) -> Result<LatestState> {
        let store: &mut dyn RelayStore = &mut self.store;
        let dict = &mut self.dictionary;

        let entity_id = dict.resolve(store, DictionaryClass::Fingerprint, &relay.fingerprint)?;
        let row = NewRelayRow {
            fingerprint_id: entity_id,
            country_id: dict.resolve_country(store, &relay.country, &relay.country_name)?,
            region_id: dict.resolve(store, DictionaryClass::Region, &relay.region_name)?,
            city_id: dict.resolve(store, DictionaryClass::City, &fields.city)?,
            platform_id: dict.resolve(store, DictionaryClass::Platform, &fields.platform)?,
            version_id: dict.resolve(store, DictionaryClass::Version, &fields.version)?,
            contact_id: dict.resolve(store, DictionaryClass::Contact, &fields.contact)?,
            exit_policy_id: dict.resolve(store, DictionaryClass::ExitPolicy, &fields.exit_policy)?,
            exit_policy_summary_id: dict.resolve(store, DictionaryClass::ExitPolicySummary, &fields.exit_policy_summary)?,
            exit_policy_v6_summary_id: dict.resolve(
                store,
                DictionaryClass::ExitPolicyV6Summary,
                &fields.exit_policy_v6_summary,
            )?,
            nickname: fields.nickname.clone(),
            last_changed_address_or_port: fields.last_changed_address_or_port.clone(),
            first_seen: fields.first_seen.clone(),
            record_time_inserted: dlts.clone(),
            record_last_seen: dlts.clone(),
            flags_json: relay.flags_json()?,
            residual_json: relay.residual_json()?,
        };
        let row_id = store.insert_relay_row(&row)?;

        let addr = sync_addresses(store, entity_id, relay, dlts)?;
        stats.addresses.merge(addr);

        Ok(LatestState {
            row_id,
            entity_id,
            fields,
            record_last_seen: dlts.clone(),
        })
    }

    // ── Accessors ──

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn latest_state(&self) -> &LatestStateCache {
        &self.cache
    }

    /// Index of the last snapshot reconciled to completion.
    pub fn last_completed_snapshot(&self) -> Option<usize> {
        self.last_completed_snapshot
    }
}
