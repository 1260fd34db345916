//! Value dictionary: repeated free-text attributes to surrogate ids.
//!
//! Memoizes store lookups for the lifetime of one run. A (class, text) pair
//! reaches the store at most once per process; empty text never does.

use std::collections::HashMap;

use crate::error::Result;
use crate::store::RelayStore;

/// Surrogate id substituted for a repeated text value.
pub type SurrogateId = i64;

/// Sentinel id for "no value" (empty text).
pub const NO_VALUE: SurrogateId = 0;

/// Attribute classes backed by the dictionary. Countries have their own
/// table because code and name are normalized together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictionaryClass {
    Fingerprint,
    Region,
    City,
    Platform,
    Version,
    Contact,
    ExitPolicy,
    ExitPolicySummary,
    ExitPolicyV6Summary,
}

impl DictionaryClass {
    pub const ALL: [DictionaryClass; 9] = [
        DictionaryClass::Fingerprint,
        DictionaryClass::Region,
        DictionaryClass::City,
        DictionaryClass::Platform,
        DictionaryClass::Version,
        DictionaryClass::Contact,
        DictionaryClass::ExitPolicy,
        DictionaryClass::ExitPolicySummary,
        DictionaryClass::ExitPolicyV6Summary,
    ];

    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            DictionaryClass::Fingerprint => "fingerprint",
            DictionaryClass::Region => "region",
            DictionaryClass::City => "city",
            DictionaryClass::Platform => "platform",
            DictionaryClass::Version => "version",
            DictionaryClass::Contact => "contact",
            DictionaryClass::ExitPolicy => "exitp",
            DictionaryClass::ExitPolicySummary => "exitps",
            DictionaryClass::ExitPolicyV6Summary => "exitps6",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

/// Hit/miss counters, reported once per snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DictionaryStats {
    pub hits: usize,
    pub misses: usize,
    pub empty: usize,
}

/// Per-run memo of dictionary and country ids.
#[derive(Debug, Default)]
pub struct ValueDictionary {
    values: HashMap<(DictionaryClass, String), SurrogateId>,
    countries: HashMap<(String, String), SurrogateId>,
    stats: DictionaryStats,
}

impl ValueDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `text` in `class` to its surrogate id.
    pub fn resolve(
        &mut self,
        store: &mut dyn RelayStore,
        class: DictionaryClass,
        text: &str,
    ) -> Result<SurrogateId> {
        if text.is_empty() {
            self.stats.empty += 1;
            return Ok(NO_VALUE);
        }
        let key = (class, text.to_string());
        if let Some(&id) = self.values.get(&key) {
            self.stats.hits += 1;
            return Ok(id);
        }

        let id = store.get_or_create_surrogate_id(class, text)?;
        tracing::trace!("dictionary miss: {}={:?} -> {}", class.as_str(), text, id);
        self.stats.misses += 1;
        self.values.insert(key, id);
        Ok(id)
    }

    /// Resolve a country by code and name together. An empty code has no
    /// value regardless of the name.
    pub fn resolve_country(
        &mut self,
        store: &mut dyn RelayStore,
        code: &str,
        name: &str,
    ) -> Result<SurrogateId> {
        if code.is_empty() {
            self.stats.empty += 1;
            return Ok(NO_VALUE);
        }
        let key = (code.to_string(), name.to_string());
        if let Some(&id) = self.countries.get(&key) {
            self.stats.hits += 1;
            return Ok(id);
        }

        let id = store.get_or_create_country(code, name)?;
        self.stats.misses += 1;
        self.countries.insert(key, id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.values.len() + self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DictionaryStats {
        self.stats
    }

    /// Return the counters and reset them.
    pub fn take_stats(&mut self) -> DictionaryStats {
        std::mem::take(&mut self.stats)
    }
}
