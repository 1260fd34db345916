//! In-process store backed by plain tables.
//!
//! NOT Send+Sync -- single-writer access assumed. Used by tests and by
//! print-only imports where nothing is persisted beyond the process.

use std::collections::HashMap;

use crate::dictionary::{DictionaryClass, SurrogateId, NO_VALUE};
use crate::dlts::Dlts;
use crate::error::{RelayError, Result};
use crate::latest_state::{ComparableFields, LatestState};
use crate::relay::AddressRole;
use crate::store::{AddressHistory, HistoryId, ImportRecord, NewRelayRow, RelayStore, RowId, RowVersion};

struct StoredRow {
    row: NewRelayRow,
    /// Current high-water mark; `row.record_last_seen` is the value at
    /// insertion time.
    record_last_seen: Dlts,
}

#[derive(Default)]
pub struct MemoryStore {
    /// Dictionary values; id = index + 1 so that 0 stays free for NO_VALUE.
    values: Vec<(DictionaryClass, String)>,
    value_ids: HashMap<(DictionaryClass, String), SurrogateId>,

    /// (code, name); id = index + 1.
    countries: Vec<(String, String)>,
    country_ids: HashMap<String, SurrogateId>,

    /// Relay rows; id = index + 1.
    rows: Vec<StoredRow>,
    rows_by_fingerprint: HashMap<SurrogateId, Vec<usize>>,

    /// Address history; id = index + 1.
    addresses: Vec<AddressHistory>,
    address_ids: HashMap<(SurrogateId, AddressRole, String), usize>,

    imports: Vec<ImportRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Inspection (tests / summaries) ---------------------------------------

    /// Dictionary and country entries created so far.
    pub fn dictionary_write_count(&self) -> usize {
        self.values.len() + self.countries.len()
    }

    /// Stored name of country `id`; `None` for unknown ids.
    pub fn country_name(&self, id: SurrogateId) -> Option<String> {
        self.countries.get(slot(id)?).map(|(_, name)| name.clone())
    }

    pub fn imports(&self) -> &[ImportRecord] {
        &self.imports
    }

    // -- Decoding -------------------------------------------------------------

    fn value_text(&self, id: SurrogateId) -> Result<String> {
        if id == NO_VALUE {
            return Ok(String::new());
        }
        slot(id)
            .and_then(|i| self.values.get(i))
            .map(|(_, text)| text.clone())
            .ok_or_else(|| RelayError::Store(format!("dangling dictionary id {}", id)))
    }

    fn country_code(&self, id: SurrogateId) -> Result<String> {
        if id == NO_VALUE {
            return Ok(String::new());
        }
        slot(id)
            .and_then(|i| self.countries.get(i))
            .map(|(code, _)| code.clone())
            .ok_or_else(|| RelayError::Store(format!("dangling country id {}", id)))
    }

    fn decode(&self, index: usize) -> Result<LatestState> {
        let stored = &self.rows[index];
        let row = &stored.row;
        Ok(LatestState {
            row_id: row_id(index),
            entity_id: row.fingerprint_id,
            fields: ComparableFields {
                nickname: row.nickname.clone(),
                country: self.country_code(row.country_id)?,
                city: self.value_text(row.city_id)?,
                platform: self.value_text(row.platform_id)?,
                version: self.value_text(row.version_id)?,
                contact: self.value_text(row.contact_id)?,
                last_changed_address_or_port: row.last_changed_address_or_port.clone(),
                first_seen: row.first_seen.clone(),
                exit_policy: self.value_text(row.exit_policy_id)?,
                exit_policy_summary: self.value_text(row.exit_policy_summary_id)?,
                exit_policy_v6_summary: self.value_text(row.exit_policy_v6_summary_id)?,
            },
            record_last_seen: stored.record_last_seen.clone(),
        })
    }

    /// Latest row of one fingerprint by (RecordLastSeen, RecordTimeInserted,
    /// id) among rows inserted at or before `as_of`. A backfilled row never
    /// outranks a row confirmed later.
    fn latest_index(&self, indices: &[usize], as_of: Option<&Dlts>) -> Option<usize> {
        indices
            .iter()
            .copied()
            .filter(|&i| as_of.map_or(true, |t| self.rows[i].row.record_time_inserted <= *t))
            .max_by(|&a, &b| {
                let (ra, rb) = (&self.rows[a], &self.rows[b]);
                ra.record_last_seen
                    .cmp(&rb.record_last_seen)
                    .then_with(|| ra.row.record_time_inserted.cmp(&rb.row.record_time_inserted))
                    .then(a.cmp(&b))
            })
    }

    fn row_index(&self, id: RowId) -> Result<usize> {
        slot(id)
            .filter(|&i| i < self.rows.len())
            .ok_or_else(|| RelayError::Store(format!("no relay row {}", id)))
    }
}

fn slot(id: SurrogateId) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn row_id(index: usize) -> RowId {
    index as RowId + 1
}

impl RelayStore for MemoryStore {
    fn get_or_create_surrogate_id(&mut self, class: DictionaryClass, text: &str) -> Result<SurrogateId> {
        let key = (class, text.to_string());
        if let Some(&id) = self.value_ids.get(&key) {
            return Ok(id);
        }
        self.values.push(key.clone());
        let id = self.values.len() as SurrogateId;
        self.value_ids.insert(key, id);
        Ok(id)
    }

    fn get_or_create_country(&mut self, code: &str, name: &str) -> Result<SurrogateId> {
        if let Some(&id) = self.country_ids.get(code) {
            if let Some(entry) = slot(id).and_then(|i| self.countries.get_mut(i)) {
                if entry.1.is_empty() && !name.is_empty() {
                    entry.1 = name.to_string();
                }
            }
            return Ok(id);
        }
        self.countries.push((code.to_string(), name.to_string()));
        let id = self.countries.len() as SurrogateId;
        self.country_ids.insert(code.to_string(), id);
        Ok(id)
    }

    fn find_latest_state(&self, fingerprint: &str) -> Result<Option<LatestState>> {
        let Some(&fp_id) = self.value_ids.get(&(DictionaryClass::Fingerprint, fingerprint.to_string())) else {
            return Ok(None);
        };
        let indices = self.rows_by_fingerprint.get(&fp_id).map(Vec::as_slice).unwrap_or(&[]);
        self.latest_index(indices, None).map(|i| self.decode(i)).transpose()
    }

    fn load_all_latest_states(&self, as_of: &Dlts) -> Result<HashMap<String, LatestState>> {
        let mut out = HashMap::with_capacity(self.rows_by_fingerprint.len());
        for (&fp_id, indices) in &self.rows_by_fingerprint {
            if let Some(i) = self.latest_index(indices, Some(as_of)) {
                out.insert(self.value_text(fp_id)?, self.decode(i)?);
            }
        }
        Ok(out)
    }

    fn load_freshness_markers(&self) -> Result<HashMap<RowId, Dlts>> {
        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (row_id(i), r.record_last_seen.clone()))
            .collect())
    }

    fn insert_relay_row(&mut self, row: &NewRelayRow) -> Result<RowId> {
        let index = self.rows.len();
        self.rows.push(StoredRow {
            row: row.clone(),
            record_last_seen: row.record_last_seen.clone(),
        });
        self.rows_by_fingerprint.entry(row.fingerprint_id).or_default().push(index);
        Ok(row_id(index))
    }

    fn advance_relay_freshness(&mut self, row_id: RowId, dlts: &Dlts) -> Result<()> {
        let index = self.row_index(row_id)?;
        let stored = &mut self.rows[index];
        if *dlts > stored.record_last_seen {
            stored.record_last_seen = dlts.clone();
        }
        Ok(())
    }

    fn find_address_history(
        &self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
    ) -> Result<Option<AddressHistory>> {
        Ok(self
            .address_ids
            .get(&(entity_id, role, address.to_string()))
            .map(|&i| self.addresses[i].clone()))
    }

    fn insert_address_history(
        &mut self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
        dlts: &Dlts,
    ) -> Result<HistoryId> {
        let key = (entity_id, role, address.to_string());
        if self.address_ids.contains_key(&key) {
            return Err(RelayError::Store(format!(
                "duplicate address history ({}, {}, {})",
                entity_id,
                role.as_str(),
                address
            )));
        }
        let index = self.addresses.len();
        let id = index as HistoryId + 1;
        self.addresses.push(AddressHistory {
            id,
            entity_id,
            role,
            address: address.to_string(),
            record_time_inserted: dlts.clone(),
            record_last_seen: dlts.clone(),
        });
        self.address_ids.insert(key, index);
        Ok(id)
    }

    fn advance_address_freshness(&mut self, history_id: HistoryId, dlts: &Dlts) -> Result<()> {
        let entry = slot(history_id)
            .and_then(|i| self.addresses.get_mut(i))
            .ok_or_else(|| RelayError::Store(format!("no address history {}", history_id)))?;
        if *dlts > entry.record_last_seen {
            entry.record_last_seen = dlts.clone();
        }
        Ok(())
    }

    fn record_import(&mut self, record: &ImportRecord) -> Result<()> {
        self.imports.push(record.clone());
        Ok(())
    }

    fn relay_versions(&self, fingerprint: &str) -> Result<Vec<RowVersion>> {
        let Some(&fp_id) = self.value_ids.get(&(DictionaryClass::Fingerprint, fingerprint.to_string())) else {
            return Ok(Vec::new());
        };
        let mut indices = self.rows_by_fingerprint.get(&fp_id).cloned().unwrap_or_default();
        indices.sort_by(|&a, &b| {
            self.rows[a]
                .row
                .record_time_inserted
                .cmp(&self.rows[b].row.record_time_inserted)
                .then(a.cmp(&b))
        });
        Ok(indices
            .into_iter()
            .map(|i| RowVersion {
                row_id: row_id(i),
                nickname: self.rows[i].row.nickname.clone(),
                record_time_inserted: self.rows[i].row.record_time_inserted.clone(),
                record_last_seen: self.rows[i].record_last_seen.clone(),
            })
            .collect())
    }

    fn relay_row_count(&self) -> Result<usize> {
        Ok(self.rows.len())
    }

    fn address_row_count(&self) -> Result<usize> {
        Ok(self.addresses.len())
    }
}
