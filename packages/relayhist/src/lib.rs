//! relayhist: relay snapshot history ledger.
//!
//! Reconciles periodic consensus snapshots into an append-only store,
//! writing only effective changes: new relays, changed relays (as new
//! rows), freshness advances for unchanged relays, and per-role address
//! history.

pub mod addresses;
pub mod delta;
pub mod detector;
pub mod dictionary;
pub mod dlts;
pub mod error;
pub mod latest_state;
pub mod reconcile;
pub mod relay;
pub mod scheduler;
pub mod store;

pub use addresses::AddressSyncStats;
pub use delta::extract_new_and_updated;
pub use detector::{classify, Classification};
pub use dictionary::{DictionaryClass, SurrogateId, ValueDictionary, NO_VALUE};
pub use dlts::{Dlts, DltsResolver, DltsSource, TimestampFormat};
pub use error::{RelayError, Result};
pub use latest_state::{ComparableFields, LatestState, LatestStateCache};
pub use reconcile::{ReconcileStats, Reconciler};
pub use relay::{AddressRole, ConsensusDocument, RelayDetails};
pub use scheduler::{RefreshPlan, RefreshScheduler, DEFAULT_REFRESH_INTERVAL};
pub use store::{ImportRecord, MemoryStore, RelayStore, SqliteStore};
