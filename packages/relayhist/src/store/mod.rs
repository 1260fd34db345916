//! Persistence backend for the ledger.
//!
//! The reconciliation engine talks to storage only through [`RelayStore`]:
//! a handful of keyed read/write primitives. Two backends are provided:
//!
//! - [`MemoryStore`]: in-process tables, used by tests and by print-only runs
//! - [`SqliteStore`]: a single-file relational store
//!
//! The store is single-writer. Every write is an independent, consistent
//! operation, so a run aborted mid-snapshot leaves a correct prefix behind.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::HashMap;

use crate::dictionary::{DictionaryClass, SurrogateId};
use crate::dlts::Dlts;
use crate::error::Result;
use crate::latest_state::LatestState;
use crate::relay::AddressRole;

/// Surrogate id of a persisted relay row.
pub type RowId = i64;

/// Surrogate id of an address history row.
pub type HistoryId = i64;

/// Fields of a relay row about to be appended. Dictionary-backed attributes
/// are already resolved to surrogate ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRelayRow {
    pub fingerprint_id: SurrogateId,
    pub country_id: SurrogateId,
    pub region_id: SurrogateId,
    pub city_id: SurrogateId,
    pub platform_id: SurrogateId,
    pub version_id: SurrogateId,
    pub contact_id: SurrogateId,
    pub exit_policy_id: SurrogateId,
    pub exit_policy_summary_id: SurrogateId,
    pub exit_policy_v6_summary_id: SurrogateId,
    pub nickname: String,
    pub last_changed_address_or_port: String,
    pub first_seen: String,
    pub record_time_inserted: Dlts,
    pub record_last_seen: Dlts,
    pub flags_json: String,
    pub residual_json: String,
}

/// One row of address history for (entity, role, address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressHistory {
    pub id: HistoryId,
    pub entity_id: SurrogateId,
    pub role: AddressRole,
    pub address: String,
    pub record_time_inserted: Dlts,
    pub record_last_seen: Dlts,
}

/// One persisted version of a relay, as listed by
/// [`RelayStore::relay_versions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowVersion {
    pub row_id: RowId,
    pub nickname: String,
    pub record_time_inserted: Dlts,
    pub record_last_seen: Dlts,
}

/// Per-snapshot import log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub protocol_version: String,
    pub relays_published: String,
    pub bridges_published: String,
    pub dlts: Dlts,
    /// Hex digest of the raw snapshot bytes, empty when unknown.
    pub digest: String,
}

/// Keyed primitives the reconciliation engine needs from a backend.
pub trait RelayStore {
    // === DICTIONARY ===

    /// Look up `text` in dictionary `class`, inserting it when absent.
    fn get_or_create_surrogate_id(&mut self, class: DictionaryClass, text: &str) -> Result<SurrogateId>;

    /// Look up a country by code, inserting it when absent. A name supplied
    /// for a code previously stored without one is filled in.
    fn get_or_create_country(&mut self, code: &str, name: &str) -> Result<SurrogateId>;

    // === RELAY ROWS ===

    /// Most recently inserted row for `fingerprint`, decoded.
    fn find_latest_state(&self, fingerprint: &str) -> Result<Option<LatestState>>;

    /// For every fingerprint, its most recent row inserted at or before
    /// `as_of`, decoded.
    fn load_all_latest_states(&self, as_of: &Dlts) -> Result<HashMap<String, LatestState>>;

    /// Current `RecordLastSeen` of every row.
    fn load_freshness_markers(&self) -> Result<HashMap<RowId, Dlts>>;

    /// Append a row and return its id.
    fn insert_relay_row(&mut self, row: &NewRelayRow) -> Result<RowId>;

    /// Raise a row's `RecordLastSeen` to `dlts`. Never lowers it.
    fn advance_relay_freshness(&mut self, row_id: RowId, dlts: &Dlts) -> Result<()>;

    // === ADDRESS HISTORY ===

    fn find_address_history(
        &self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
    ) -> Result<Option<AddressHistory>>;

    fn insert_address_history(
        &mut self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
        dlts: &Dlts,
    ) -> Result<HistoryId>;

    /// Raise an address row's `RecordLastSeen` to `dlts`. Never lowers it.
    fn advance_address_freshness(&mut self, history_id: HistoryId, dlts: &Dlts) -> Result<()>;

    // === IMPORT LOG / STATS ===

    fn record_import(&mut self, record: &ImportRecord) -> Result<()>;

    /// Every persisted version of `fingerprint`, oldest insertion first.
    fn relay_versions(&self, fingerprint: &str) -> Result<Vec<RowVersion>>;

    /// Number of persisted relay rows (all versions).
    fn relay_row_count(&self) -> Result<usize>;

    /// Number of address history rows.
    fn address_row_count(&self) -> Result<usize>;
}
