//! Single-file relational store.
//!
//! Dictionary-backed attributes are stored as integer ids; id 0 is the
//! "no value" sentinel and is never a real row, so decoding uses LEFT JOINs
//! that fall back to the empty string.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::dictionary::{DictionaryClass, SurrogateId};
use crate::dlts::Dlts;
use crate::error::{RelayError, Result};
use crate::latest_state::{ComparableFields, LatestState};
use crate::relay::AddressRole;
use crate::store::{AddressHistory, HistoryId, ImportRecord, NewRelayRow, RelayStore, RowId, RowVersion};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS dictionary (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    class TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE(class, value)
);

CREATE TABLE IF NOT EXISTS countries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS relays (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint_id INTEGER NOT NULL,
    country_id INTEGER NOT NULL DEFAULT 0,
    region_id INTEGER NOT NULL DEFAULT 0,
    city_id INTEGER NOT NULL DEFAULT 0,
    platform_id INTEGER NOT NULL DEFAULT 0,
    version_id INTEGER NOT NULL DEFAULT 0,
    contact_id INTEGER NOT NULL DEFAULT 0,
    exitp_id INTEGER NOT NULL DEFAULT 0,
    exitps_id INTEGER NOT NULL DEFAULT 0,
    exitps6_id INTEGER NOT NULL DEFAULT 0,
    nickname TEXT NOT NULL,
    last_changed_address_or_port TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    flags TEXT NOT NULL,
    residual TEXT NOT NULL,
    record_time_inserted TEXT NOT NULL,
    record_last_seen TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relays_fingerprint
    ON relays(fingerprint_id, record_time_inserted);

CREATE TABLE IF NOT EXISTS relay_addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    address TEXT NOT NULL,
    record_time_inserted TEXT NOT NULL,
    record_last_seen TEXT NOT NULL,
    UNIQUE(entity_id, role, address)
);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    protocol_version TEXT NOT NULL,
    relays_published TEXT NOT NULL,
    bridges_published TEXT NOT NULL,
    dlts TEXT NOT NULL,
    digest TEXT NOT NULL
);
";

/// Columns and joins shared by every latest-state query.
const STATE_SELECT: &str = "
SELECT r.id, r.fingerprint_id, fp.value, r.nickname,
       COALESCE(c.code, ''), COALESCE(city.value, ''), COALESCE(pl.value, ''),
       COALESCE(ver.value, ''), COALESCE(ct.value, ''),
       r.last_changed_address_or_port, r.first_seen,
       COALESCE(ep.value, ''), COALESCE(eps.value, ''), COALESCE(eps6.value, ''),
       r.record_last_seen
FROM relays r
JOIN dictionary fp ON fp.id = r.fingerprint_id
LEFT JOIN countries c ON c.id = r.country_id
LEFT JOIN dictionary city ON city.id = r.city_id
LEFT JOIN dictionary pl ON pl.id = r.platform_id
LEFT JOIN dictionary ver ON ver.id = r.version_id
LEFT JOIN dictionary ct ON ct.id = r.contact_id
LEFT JOIN dictionary ep ON ep.id = r.exitp_id
LEFT JOIN dictionary eps ON eps.id = r.exitps_id
LEFT JOIN dictionary eps6 ON eps6.id = r.exitps6_id
";

/// A decoded row before its DLTS is validated.
struct RawState {
    fingerprint: String,
    row_id: RowId,
    entity_id: SurrogateId,
    fields: ComparableFields,
    record_last_seen: String,
}

impl RawState {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            entity_id: row.get(1)?,
            fingerprint: row.get(2)?,
            fields: ComparableFields {
                nickname: row.get(3)?,
                country: row.get(4)?,
                city: row.get(5)?,
                platform: row.get(6)?,
                version: row.get(7)?,
                contact: row.get(8)?,
                last_changed_address_or_port: row.get(9)?,
                first_seen: row.get(10)?,
                exit_policy: row.get(11)?,
                exit_policy_summary: row.get(12)?,
                exit_policy_v6_summary: row.get(13)?,
            },
            record_last_seen: row.get(14)?,
        })
    }

    fn into_state(self) -> Result<(String, LatestState)> {
        let record_last_seen = Dlts::parse(&self.record_last_seen)?;
        Ok((
            self.fingerprint,
            LatestState {
                row_id: self.row_id,
                entity_id: self.entity_id,
                fields: self.fields,
                record_last_seen,
            },
        ))
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!("sqlite schema ready");
        Ok(Self { conn })
    }

    pub fn import_count(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM imports", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Most recent import log entry.
    pub fn last_import(&self) -> Result<Option<ImportRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT protocol_version, relays_published, bridges_published, dlts, digest
                 FROM imports ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(protocol_version, relays_published, bridges_published, dlts, digest)| {
            Ok(ImportRecord {
                protocol_version,
                relays_published,
                bridges_published,
                dlts: Dlts::parse(&dlts)?,
                digest,
            })
        })
        .transpose()
    }

    fn count(&self, table: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl RelayStore for SqliteStore {
    fn get_or_create_surrogate_id(&mut self, class: DictionaryClass, text: &str) -> Result<SurrogateId> {
        let existing = self
            .conn
            .prepare_cached("SELECT id FROM dictionary WHERE class = ?1 AND value = ?2")?
            .query_row(params![class.as_str(), text], |row| row.get(0))
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.conn
            .prepare_cached("INSERT INTO dictionary (class, value) VALUES (?1, ?2)")?
            .execute(params![class.as_str(), text])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_or_create_country(&mut self, code: &str, name: &str) -> Result<SurrogateId> {
        let existing: Option<(SurrogateId, String)> = self
            .conn
            .prepare_cached("SELECT id, name FROM countries WHERE code = ?1")?
            .query_row(params![code], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        match existing {
            Some((id, stored)) => {
                if stored.is_empty() && !name.is_empty() {
                    self.conn
                        .prepare_cached("UPDATE countries SET name = ?2 WHERE id = ?1")?
                        .execute(params![id, name])?;
                }
                Ok(id)
            }
            None => {
                self.conn
                    .prepare_cached("INSERT INTO countries (code, name) VALUES (?1, ?2)")?
                    .execute(params![code, name])?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    fn find_latest_state(&self, fingerprint: &str) -> Result<Option<LatestState>> {
        let sql = format!(
            "{} WHERE fp.class = 'fingerprint' AND fp.value = ?1
             ORDER BY r.record_last_seen DESC, r.record_time_inserted DESC, r.id DESC LIMIT 1",
            STATE_SELECT
        );
        let raw = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![fingerprint], RawState::from_row)
            .optional()?;
        raw.map(|r| r.into_state().map(|(_, state)| state)).transpose()
    }

    fn load_all_latest_states(&self, as_of: &Dlts) -> Result<HashMap<String, LatestState>> {
        let sql = format!(
            "{} WHERE r.id = (
                SELECT r2.id FROM relays r2
                WHERE r2.fingerprint_id = r.fingerprint_id AND r2.record_time_inserted <= ?1
                ORDER BY r2.record_last_seen DESC, r2.record_time_inserted DESC, r2.id DESC LIMIT 1
             )",
            STATE_SELECT
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![as_of.as_str()], RawState::from_row)?;

        let mut out = HashMap::new();
        for raw in rows {
            let (fingerprint, state) = raw?.into_state()?;
            out.insert(fingerprint, state);
        }
        Ok(out)
    }

    fn load_freshness_markers(&self) -> Result<HashMap<RowId, Dlts>> {
        let mut stmt = self.conn.prepare("SELECT id, record_last_seen FROM relays")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, RowId>(0)?, row.get::<_, String>(1)?)))?;

        let mut out = HashMap::new();
        for row in rows {
            let (id, rls) = row?;
            out.insert(id, Dlts::parse(&rls)?);
        }
        Ok(out)
    }

    fn insert_relay_row(&mut self, row: &NewRelayRow) -> Result<RowId> {
        self.conn
            .prepare_cached(
                "INSERT INTO relays (
                    fingerprint_id, country_id, region_id, city_id, platform_id, version_id,
                    contact_id, exitp_id, exitps_id, exitps6_id,
                    nickname, last_changed_address_or_port, first_seen, flags, residual,
                    record_time_inserted, record_last_seen
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?
            .execute(params![
                row.fingerprint_id,
                row.country_id,
                row.region_id,
                row.city_id,
                row.platform_id,
                row.version_id,
                row.contact_id,
                row.exit_policy_id,
                row.exit_policy_summary_id,
                row.exit_policy_v6_summary_id,
                row.nickname,
                row.last_changed_address_or_port,
                row.first_seen,
                row.flags_json,
                row.residual_json,
                row.record_time_inserted.as_str(),
                row.record_last_seen.as_str(),
            ])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn advance_relay_freshness(&mut self, row_id: RowId, dlts: &Dlts) -> Result<()> {
        let updated = self
            .conn
            .prepare_cached("UPDATE relays SET record_last_seen = ?2 WHERE id = ?1 AND record_last_seen < ?2")?
            .execute(params![row_id, dlts.as_str()])?;
        if updated == 0 {
            let exists = self
                .conn
                .prepare_cached("SELECT 1 FROM relays WHERE id = ?1")?
                .query_row(params![row_id], |_| Ok(()))
                .optional()?;
            if exists.is_none() {
                return Err(RelayError::Store(format!("no relay row {}", row_id)));
            }
        }
        Ok(())
    }

    fn find_address_history(
        &self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
    ) -> Result<Option<AddressHistory>> {
        let raw: Option<(HistoryId, String, String)> = self
            .conn
            .prepare_cached(
                "SELECT id, record_time_inserted, record_last_seen FROM relay_addresses
                 WHERE entity_id = ?1 AND role = ?2 AND address = ?3",
            )?
            .query_row(params![entity_id, role.as_str(), address], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        raw.map(|(id, inserted, last_seen)| {
            Ok(AddressHistory {
                id,
                entity_id,
                role,
                address: address.to_string(),
                record_time_inserted: Dlts::parse(&inserted)?,
                record_last_seen: Dlts::parse(&last_seen)?,
            })
        })
        .transpose()
    }

    fn insert_address_history(
        &mut self,
        entity_id: SurrogateId,
        role: AddressRole,
        address: &str,
        dlts: &Dlts,
    ) -> Result<HistoryId> {
        self.conn
            .prepare_cached(
                "INSERT INTO relay_addresses (entity_id, role, address, record_time_inserted, record_last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
            )?
            .execute(params![entity_id, role.as_str(), address, dlts.as_str()])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn advance_address_freshness(&mut self, history_id: HistoryId, dlts: &Dlts) -> Result<()> {
        self.conn
            .prepare_cached(
                "UPDATE relay_addresses SET record_last_seen = ?2 WHERE id = ?1 AND record_last_seen < ?2",
            )?
            .execute(params![history_id, dlts.as_str()])?;
        Ok(())
    }

    fn record_import(&mut self, record: &ImportRecord) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO imports (protocol_version, relays_published, bridges_published, dlts, digest)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                record.protocol_version,
                record.relays_published,
                record.bridges_published,
                record.dlts.as_str(),
                record.digest,
            ])?;
        Ok(())
    }

    fn relay_versions(&self, fingerprint: &str) -> Result<Vec<RowVersion>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT r.id, r.nickname, r.record_time_inserted, r.record_last_seen
             FROM relays r JOIN dictionary fp ON fp.id = r.fingerprint_id
             WHERE fp.class = 'fingerprint' AND fp.value = ?1
             ORDER BY r.record_time_inserted, r.id",
        )?;
        let rows = stmt.query_map(params![fingerprint], |row| {
            Ok((
                row.get::<_, RowId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (row_id, nickname, inserted, last_seen) = row?;
            out.push(RowVersion {
                row_id,
                nickname,
                record_time_inserted: Dlts::parse(&inserted)?,
                record_last_seen: Dlts::parse(&last_seen)?,
            });
        }
        Ok(out)
    }

    fn relay_row_count(&self) -> Result<usize> {
        self.count("relays")
    }

    fn address_row_count(&self) -> Result<usize> {
        self.count("relay_addresses")
    }
}
