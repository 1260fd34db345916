//! Integration test: end-to-end reconciliation scenarios on the in-memory
//! store.
//!
//! Validates that:
//! - Re-ingesting a snapshot writes nothing
//! - Freshness only moves forward, for relays and addresses alike
//! - Any comparable-field change appends a row and keeps the old one
//! - The batch delta forwards only new or modified relays
//! - Per-record failures carry resume information

use std::collections::HashMap;

use proptest::prelude::*;
use relayhist::store::{AddressHistory, HistoryId, NewRelayRow, RowId, RowVersion};
use relayhist::{
    AddressRole, DictionaryClass, Dlts, ImportRecord, LatestState, MemoryStore, ReconcileStats, Reconciler,
    RelayDetails, RelayError, RelayStore, SurrogateId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const FP_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const FP_B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
const FP_C: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";

fn dlts(s: &str) -> Dlts {
    Dlts::parse(s).unwrap()
}

fn make_relay(fingerprint: &str, nickname: &str) -> RelayDetails {
    RelayDetails {
        fingerprint: fingerprint.to_string(),
        nickname: nickname.to_string(),
        or_addresses: vec!["192.0.2.1:9001".to_string()],
        dir_address: "192.0.2.1:9030".to_string(),
        country: "de".to_string(),
        country_name: "Germany".to_string(),
        region_name: "Berlin".to_string(),
        city_name: "Berlin".to_string(),
        platform: "Tor 0.4.8.9 on Linux".to_string(),
        version: "0.4.8.9".to_string(),
        contact: "Operator <ops@example.org>".to_string(),
        first_seen: "2020-01-01 00:00:00".to_string(),
        last_changed_address_or_port: "2022-06-01 00:00:00".to_string(),
        flags: vec!["Fast".to_string(), "Running".to_string(), "Valid".to_string()],
        exit_policy: Some(vec!["reject *:*".to_string()]),
        exit_policy_summary: Some(serde_json::json!({"reject": ["1-65535"]})),
        ..Default::default()
    }
}

fn address_last_seen(store: &MemoryStore, fingerprint: &str, role: AddressRole, address: &str) -> Option<String> {
    let entity = store.find_latest_state(fingerprint).unwrap()?.entity_id;
    store
        .find_address_history(entity, role, address)
        .unwrap()
        .map(|h| h.record_last_seen.as_str().to_string())
}

// ---------------------------------------------------------------------------
// Tests: Lifecycle Scenario
// ---------------------------------------------------------------------------

#[test]
fn new_then_reingest_is_unchanged_fresh() {
    let mut engine = Reconciler::new(MemoryStore::new());
    let batch = vec![make_relay(FP_A, "n1")];

    let first = engine.reconcile(&batch, &dlts("20230101000000"), true).unwrap();
    assert_eq!(first.new, 1);
    assert_eq!(first.addresses.inserted, 2);

    let second = engine.reconcile(&batch, &dlts("20230101000000"), false).unwrap();
    assert_eq!(second.unchanged_fresh, 1);
    assert_eq!(second.rows_written(), 0);

    assert_eq!(engine.store().relay_row_count().unwrap(), 1);
    assert_eq!(engine.store().address_row_count().unwrap(), 2);
}

#[test]
fn freshness_only_update_with_new_or_address() {
    let mut engine = Reconciler::new(MemoryStore::new());
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();

    let mut moved = make_relay(FP_A, "n1");
    moved.or_addresses.push("[2001:db8::1]:9001".to_string());
    let stats = engine.reconcile(&[moved], &dlts("20230102000000"), false).unwrap();

    assert_eq!(stats.refreshed, 1);
    assert_eq!(stats.addresses.inserted, 1);
    assert_eq!(stats.addresses.advanced, 2);

    let store = engine.store();
    assert_eq!(store.relay_row_count().unwrap(), 1);
    let state = store.find_latest_state(FP_A).unwrap().unwrap();
    assert_eq!(state.record_last_seen.as_str(), "20230102000000");
    assert_eq!(
        address_last_seen(store, FP_A, AddressRole::Or, "[2001:db8::1]:9001").as_deref(),
        Some("20230102000000")
    );
    assert_eq!(
        address_last_seen(store, FP_A, AddressRole::Or, "192.0.2.1:9001").as_deref(),
        Some("20230102000000")
    );
}

#[test]
fn changed_nickname_appends_row_and_keeps_old() {
    let mut engine = Reconciler::new(MemoryStore::new());
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230102000000"), false).unwrap();

    let stats = engine.reconcile(&[make_relay(FP_A, "n2")], &dlts("20230103000000"), false).unwrap();
    assert_eq!(stats.changed, 1);

    let versions = engine.store().relay_versions(FP_A).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].nickname, "n1");
    assert_eq!(versions[0].record_last_seen.as_str(), "20230102000000");
    assert_eq!(versions[1].nickname, "n2");
    assert_eq!(versions[1].record_time_inserted.as_str(), "20230103000000");

    // Address history is keyed by the relay, not the row.
    assert_eq!(engine.store().address_row_count().unwrap(), 2);
    assert_eq!(
        address_last_seen(engine.store(), FP_A, AddressRole::Dir, "192.0.2.1:9030").as_deref(),
        Some("20230103000000")
    );

    let cached = engine.latest_state().lookup(FP_A).unwrap();
    assert_eq!(cached.fields.nickname, "n2");
}

#[test]
fn scenario_survives_full_rebuild_every_snapshot() {
    let mut engine = Reconciler::new(MemoryStore::new());
    engine.set_refresh_interval(1).unwrap();
    let days = ["20230101000000", "20230102000000", "20230103000000"];
    let mut totals = ReconcileStats::default();
    for (i, day) in days.iter().enumerate() {
        let stats = engine.reconcile(&[make_relay(FP_A, "n1")], &dlts(day), i == 0).unwrap();
        assert_eq!(stats.full_rebuilds, 1);
        totals.merge(&stats);
    }
    assert_eq!((totals.new, totals.refreshed, totals.changed), (1, 2, 0));
    assert_eq!(engine.store().relay_row_count().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Tests: Monotonicity
// ---------------------------------------------------------------------------

#[test]
fn older_identical_snapshot_never_regresses() {
    for interval in [1, 100] {
        let mut engine = Reconciler::new(MemoryStore::new());
        engine.set_refresh_interval(interval).unwrap();
        engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();
        engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230103000000"), false).unwrap();

        let stats = engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230102000000"), false).unwrap();
        assert_eq!(stats.unchanged_stale, 1, "interval {}", interval);

        let state = engine.store().find_latest_state(FP_A).unwrap().unwrap();
        assert_eq!(state.record_last_seen.as_str(), "20230103000000");
        assert_eq!(
            address_last_seen(engine.store(), FP_A, AddressRole::Or, "192.0.2.1:9001").as_deref(),
            Some("20230103000000")
        );
    }
}

#[test]
fn older_changed_snapshot_is_history_only() {
    let mut engine = Reconciler::new(MemoryStore::new());
    engine.set_refresh_interval(100).unwrap();
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230103000000"), true).unwrap();

    let stats = engine.reconcile(&[make_relay(FP_A, "old")], &dlts("20230102000000"), false).unwrap();
    assert_eq!(stats.changed, 1);

    assert_eq!(engine.store().relay_row_count().unwrap(), 2);
    assert_eq!(engine.latest_state().lookup(FP_A).unwrap().fields.nickname, "n1");
    assert_eq!(engine.store().find_latest_state(FP_A).unwrap().unwrap().fields.nickname, "n1");
}

#[test]
fn backfilled_row_loses_full_rebuild_to_confirmed_row() {
    for interval in [1, 100] {
        let mut engine = Reconciler::new(MemoryStore::new());
        engine.set_refresh_interval(interval).unwrap();
        engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();
        engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230103000000"), false).unwrap();
        engine.reconcile(&[make_relay(FP_A, "old")], &dlts("20230102000000"), false).unwrap();
        assert_eq!(engine.store().relay_row_count().unwrap(), 2);

        // A new run rebuilds the cache from the store before replaying.
        let stats = engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230103000000"), true).unwrap();
        assert_eq!(stats.full_rebuilds, 1);
        assert_eq!(stats.unchanged_fresh, 1, "interval {}", interval);
        assert_eq!(stats.rows_written(), 0, "interval {}", interval);
        assert_eq!(engine.store().relay_row_count().unwrap(), 2);

        let cached = engine.latest_state().lookup(FP_A).unwrap();
        assert_eq!(cached.fields.nickname, "n1");
        assert_eq!(cached.record_last_seen.as_str(), "20230103000000");
        let stored = engine.store().find_latest_state(FP_A).unwrap().unwrap();
        assert_eq!(stored.fields.nickname, "n1");
        assert_eq!(stored.record_last_seen.as_str(), "20230103000000");
    }
}

#[test]
fn dictionary_memo_survives_full_rebuild() {
    let store = FailingStore {
        inner: MemoryStore::new(),
        poison: "boom".into(),
        lookups: 0,
    };
    let mut engine = Reconciler::new(store);
    engine.set_refresh_interval(1).unwrap();
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();
    let after_first = engine.store().lookups;
    assert!(after_first > 0);

    // Same attribute values under a new nickname: every lookup is memoized.
    let stats = engine.reconcile(&[make_relay(FP_A, "n2")], &dlts("20230102000000"), false).unwrap();
    assert_eq!(stats.full_rebuilds, 1);
    assert_eq!(stats.changed, 1);
    assert_eq!(engine.store().lookups, after_first);
}

// ---------------------------------------------------------------------------
// Tests: Change Detection
// ---------------------------------------------------------------------------

#[test]
fn every_comparable_field_triggers_change() {
    let mutations: Vec<(&str, fn(&mut RelayDetails))> = vec![
        ("nickname", |r| r.nickname = "other".into()),
        ("country", |r| r.country = "fr".into()),
        ("city", |r| r.city_name = "Paris".into()),
        ("platform", |r| r.platform = "Tor 0.4.9.1 on FreeBSD".into()),
        ("version", |r| r.version = "0.4.9.1".into()),
        ("contact", |r| r.contact = "someone else".into()),
        ("last_changed", |r| r.last_changed_address_or_port = "2023-01-01 00:00:00".into()),
        ("first_seen", |r| r.first_seen = "2019-01-01 00:00:00".into()),
        ("exit_policy", |r| r.exit_policy = Some(vec!["accept *:443".into(), "reject *:*".into()])),
        ("exit_policy_summary", |r| r.exit_policy_summary = Some(serde_json::json!({"accept": ["443"]}))),
        ("exit_policy_v6_summary", |r| r.exit_policy_v6_summary = Some(serde_json::json!({"reject": ["1-65535"]}))),
    ];

    for (name, mutate) in mutations {
        let mut engine = Reconciler::new(MemoryStore::new());
        engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();

        let mut relay = make_relay(FP_A, "n1");
        mutate(&mut relay);
        let stats = engine.reconcile(&[relay], &dlts("20230102000000"), false).unwrap();
        assert_eq!(stats.changed, 1, "{} change not detected", name);
        assert_eq!(engine.store().relay_row_count().unwrap(), 2, "{}", name);
    }
}

#[test]
fn non_comparable_fields_do_not_create_rows() {
    let mut engine = Reconciler::new(MemoryStore::new());
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();

    let mut relay = make_relay(FP_A, "n1");
    relay.consensus_weight = 9000;
    relay.flags.push("Stable".into());
    relay.region_name = "Brandenburg".into();
    let stats = engine.reconcile(&[relay], &dlts("20230102000000"), false).unwrap();
    assert_eq!(stats.refreshed, 1);
    assert_eq!(engine.store().relay_row_count().unwrap(), 1);
}

#[test]
fn contact_case_and_padding_ignored() {
    let mut engine = Reconciler::new(MemoryStore::new());
    engine.reconcile(&[make_relay(FP_A, "n1")], &dlts("20230101000000"), true).unwrap();

    let mut relay = make_relay(FP_A, "n1");
    relay.contact = "  OPERATOR <OPS@EXAMPLE.ORG>\n".into();
    let stats = engine.reconcile(&[relay], &dlts("20230101000000"), false).unwrap();
    assert_eq!(stats.unchanged_fresh, 1);
}

// ---------------------------------------------------------------------------
// Tests: Batch Delta
// ---------------------------------------------------------------------------

#[test]
fn two_file_bulk_run_forwards_only_new_fingerprint() {
    let mut engine = Reconciler::new(MemoryStore::new());
    let first = vec![make_relay(FP_A, "a"), make_relay(FP_B, "b")];
    let second = vec![make_relay(FP_A, "a"), make_relay(FP_B, "b"), make_relay(FP_C, "c")];

    let s1 = engine.reconcile_with_previous(&first, None, &dlts("20230101000000"), true).unwrap();
    assert_eq!(s1.new, 2);

    let s2 = engine
        .reconcile_with_previous(&second, Some(&first), &dlts("20230102000000"), false)
        .unwrap();
    assert_eq!(s2.skipped_by_delta, 2);
    assert_eq!(s2.processed, 1);
    assert_eq!(s2.new, 1);

    // Skipped relays keep their previous freshness.
    let a = engine.store().find_latest_state(FP_A).unwrap().unwrap();
    assert_eq!(a.record_last_seen.as_str(), "20230101000000");
    assert_eq!(engine.store().relay_row_count().unwrap(), 3);
}

#[test]
fn previous_batch_ignored_for_first_snapshot() {
    let mut engine = Reconciler::new(MemoryStore::new());
    let batch = vec![make_relay(FP_A, "a")];
    let stats = engine
        .reconcile_with_previous(&batch, Some(&batch), &dlts("20230101000000"), true)
        .unwrap();
    assert_eq!(stats.skipped_by_delta, 0);
    assert_eq!(stats.new, 1);
}

// ---------------------------------------------------------------------------
// Tests: Failure Reporting
// ---------------------------------------------------------------------------

/// Delegates to a MemoryStore, counts dictionary lookups and refuses to
/// insert rows for one nickname.
struct FailingStore {
    inner: MemoryStore,
    poison: String,
    lookups: usize,
}

impl RelayStore for FailingStore {
    fn get_or_create_surrogate_id(&mut self, class: DictionaryClass, text: &str) -> relayhist::Result<SurrogateId> {
        self.lookups += 1;
        self.inner.get_or_create_surrogate_id(class, text)
    }
    fn get_or_create_country(&mut self, code: &str, name: &str) -> relayhist::Result<SurrogateId> {
        self.lookups += 1;
        self.inner.get_or_create_country(code, name)
    }
    fn find_latest_state(&self, fingerprint: &str) -> relayhist::Result<Option<LatestState>> {
        self.inner.find_latest_state(fingerprint)
    }
    fn load_all_latest_states(&self, as_of: &Dlts) -> relayhist::Result<HashMap<String, LatestState>> {
        self.inner.load_all_latest_states(as_of)
    }
    fn load_freshness_markers(&self) -> relayhist::Result<HashMap<RowId, Dlts>> {
        self.inner.load_freshness_markers()
    }
    fn insert_relay_row(&mut self, row: &NewRelayRow) -> relayhist::Result<RowId> {
        if row.nickname == self.poison {
            return Err(RelayError::Store("disk full".into()));
        }
        self.inner.insert_relay_row(row)
    }
    fn advance_relay_freshness(&mut self, row_id: RowId, dlts: &Dlts) -> relayhist::Result<()> {
        self.inner.advance_relay_freshness(row_id, dlts)
    }
    fn find_address_history(
        &self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
    ) -> relayhist::Result<Option<AddressHistory>> {
        self.inner.find_address_history(entity_id, role, address)
    }
    fn insert_address_history(
        &mut self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
        dlts: &Dlts,
    ) -> relayhist::Result<HistoryId> {
        self.inner.insert_address_history(entity_id, role, address, dlts)
    }
    fn advance_address_freshness(&mut self, history_id: HistoryId, dlts: &Dlts) -> relayhist::Result<()> {
        self.inner.advance_address_freshness(history_id, dlts)
    }
    fn record_import(&mut self, record: &ImportRecord) -> relayhist::Result<()> {
        self.inner.record_import(record)
    }
    fn relay_versions(&self, fingerprint: &str) -> relayhist::Result<Vec<RowVersion>> {
        self.inner.relay_versions(fingerprint)
    }
    fn relay_row_count(&self) -> relayhist::Result<usize> {
        self.inner.relay_row_count()
    }
    fn address_row_count(&self) -> relayhist::Result<usize> {
        self.inner.address_row_count()
    }
}

#[test]
fn failure_reports_position_and_keeps_prefix() {
    let store = FailingStore {
        inner: MemoryStore::new(),
        poison: "boom".into(),
        lookups: 0,
    };
    let mut engine = Reconciler::new(store);
    engine.reconcile(&[make_relay(FP_A, "a")], &dlts("20230101000000"), true).unwrap();

    let batch = vec![make_relay(FP_A, "a"), make_relay(FP_B, "boom"), make_relay(FP_C, "c")];
    let err = engine.reconcile(&batch, &dlts("20230102000000"), false).unwrap_err();

    match &err {
        RelayError::Reconcile {
            snapshot,
            fingerprint,
            last_reconciled,
            ..
        } => {
            assert_eq!(*snapshot, 1);
            assert_eq!(fingerprint, FP_B);
            assert_eq!(last_reconciled.as_deref(), Some(FP_A));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.code(), "STORE_ERROR");
    assert!(err.is_resumable());
    assert_eq!(engine.last_completed_snapshot(), Some(0));

    // The prefix before the failure is persisted; nothing after it.
    let store = engine.into_store();
    let a = store.find_latest_state(FP_A).unwrap().unwrap();
    assert_eq!(a.record_last_seen.as_str(), "20230102000000");
    assert!(store.find_latest_state(FP_C).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

const ADDRESS_POOL: [&str; 4] = ["192.0.2.1:9001", "192.0.2.2:9001", "[2001:db8::1]:9001", "198.51.100.7:443"];

proptest! {
    /// For every (relay, role, address), the history's last-seen equals the
    /// newest snapshot that listed it.
    #[test]
    fn address_last_seen_is_max_dlts(
        masks in prop::collection::vec(0u8..16, 1..8),
        nick_flips in prop::collection::vec(any::<bool>(), 8),
    ) {
        let mut engine = Reconciler::new(MemoryStore::new());
        let mut expected: HashMap<&str, String> = HashMap::new();

        for (day, mask) in masks.iter().enumerate() {
            let stamp = format!("202301{:02}000000", day + 1);
            let mut relay = make_relay(FP_A, if nick_flips[day] { "x" } else { "y" });
            let selected: Vec<&'static str> = ADDRESS_POOL
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1u8 << bit) != 0)
                .map(|(_, a)| *a)
                .collect();
            relay.or_addresses = selected.iter().map(|a| a.to_string()).collect();
            for a in selected {
                expected.insert(a, stamp.clone());
            }
            engine.reconcile(&[relay], &dlts(&stamp), day == 0).unwrap();
        }

        for (address, stamp) in &expected {
            let seen = address_last_seen(engine.store(), FP_A, AddressRole::Or, address);
            prop_assert_eq!(seen.as_deref(), Some(stamp.as_str()));
        }
        prop_assert_eq!(engine.store().address_row_count().unwrap(), expected.len() + 1);
    }

    /// Replaying any DLTS after the newest one never moves a relay's
    /// freshness backwards.
    #[test]
    fn freshness_is_monotonic(order in Just((1u32..=6).collect::<Vec<u32>>()).prop_shuffle()) {
        let mut engine = Reconciler::new(MemoryStore::new());
        let mut newest = String::new();
        for (i, day) in order.iter().enumerate() {
            let stamp = format!("202301{:02}000000", day);
            engine.reconcile(&[make_relay(FP_A, "n1")], &dlts(&stamp), i == 0).unwrap();
            if stamp > newest {
                newest = stamp;
            }
            let versions = engine.store().relay_versions(FP_A).unwrap();
            let max_seen = versions.iter().map(|v| v.record_last_seen.as_str().to_string()).max().unwrap();
            prop_assert_eq!(&max_seen, &newest);
        }
    }
}
