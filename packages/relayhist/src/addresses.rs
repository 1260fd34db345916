//! Address history synchronization.
//!
//! Each (entity, role, address) triple owns one append-only history row.
//! Addresses missing from a snapshot are left alone: absence is not
//! deletion.

use crate::dictionary::SurrogateId;
use crate::dlts::Dlts;
use crate::error::Result;
use crate::relay::{AddressRole, RelayDetails};
use crate::store::RelayStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressSyncStats {
    pub inserted: usize,
    pub advanced: usize,
    pub unchanged: usize,
}

impl AddressSyncStats {
    pub fn merge(&mut self, other: AddressSyncStats) {
        self.inserted += other.inserted;
        self.advanced += other.advanced;
        self.unchanged += other.unchanged;
    }
}

/// Sync one role's addresses for `entity_id` observed at `dlts`.
pub fn sync_role(
    store: &mut dyn RelayStore,
    role: AddressRole,
    entity_id: SurrogateId,
    addresses: &[String],
    dlts: &Dlts,
) -> Result<AddressSyncStats> {
    let mut stats = AddressSyncStats::default();
    for address in addresses.iter().filter(|a| !a.is_empty()) {
        match store.find_address_history(entity_id, role, address)? {
            None => {
                store.insert_address_history(entity_id, role, address, dlts)?;
                tracing::trace!("address {} {} inserted for entity {}", role.as_str(), address, entity_id);
                stats.inserted += 1;
            }
            Some(history) if history.record_last_seen < *dlts => {
                store.advance_address_freshness(history.id, dlts)?;
                stats.advanced += 1;
            }
            Some(_) => stats.unchanged += 1,
        }
    }
    Ok(stats)
}

/// Sync all three roles of `relay`.
pub fn sync_addresses(
    store: &mut dyn RelayStore,
    entity_id: SurrogateId,
    relay: &RelayDetails,
    dlts: &Dlts,
) -> Result<AddressSyncStats> {
    let mut stats = AddressSyncStats::default();
    for role in AddressRole::ALL {
        stats.merge(sync_role(store, role, entity_id, role.addresses(relay), dlts)?);
    }
    Ok(stats)
}
