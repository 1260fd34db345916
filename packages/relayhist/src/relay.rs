//! Relay records as decoded from a consensus details document.
//!
//! Field names follow the Onionoo "details" document. Every field is
//! optional on the wire; absent values decode to their defaults so two
//! decodes of the same document compare equal field-for-field.

use serde::{Deserialize, Serialize};

use crate::error::Result;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

/// One consensus details document: protocol header plus the relay list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusDocument {
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_major_version_scheduled: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub build_revision: String,
    pub relays_published: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub relays_skipped: u64,
    pub relays: Vec<RelayDetails>,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub relays_truncated: u64,
    pub bridges_published: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub bridges_skipped: u64,
    pub bridges: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub bridges_truncated: u64,
}

impl ConsensusDocument {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A single relay entry.
///
/// `PartialEq` is full structural equality over every decoded field; the
/// batch delta extractor relies on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayDetails {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nickname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub or_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exit_addresses: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_seen: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_changed_address_or_port: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub first_seen: String,
    #[serde(skip_serializing_if = "is_false")]
    pub running: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub hibernating: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city_name: String,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub latitude: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub longitude: f64,
    #[serde(rename = "as", skip_serializing_if = "String::is_empty")]
    pub autonomous_system: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub as_number: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub as_name: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub consensus_weight: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verified_host_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unverified_host_names: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_restarted: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub bandwidth_rate: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub bandwidth_burst: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub observed_bandwidth: u64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub advertised_bandwidth: u64,
    /// Absent and empty are distinct: `null` vs `[]` in canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_policy: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_policy_summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_policy_v6_summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub contact: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "is_false")]
    pub recommended_version: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version_status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub effective_family: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alleged_family: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indirect_family: Vec<String>,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub consensus_weight_fraction: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub guard_probability: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub middle_probability: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub exit_probability: f64,
    #[serde(skip_serializing_if = "is_false")]
    pub measured: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unreachable_or_addresses: Vec<String>,
}

/// Canonical serialized forms of the three policy blobs. These are what the
/// value dictionary stores and what change detection compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBlobs {
    pub exit_policy: String,
    pub exit_policy_summary: String,
    pub exit_policy_v6_summary: String,
}

impl RelayDetails {
    /// Serialize each policy to compact JSON. Absent policies become
    /// `null`; object keys come out sorted, so equal policies always
    /// produce equal text.
    pub fn policy_blobs(&self) -> Result<PolicyBlobs> {
        Ok(PolicyBlobs {
            exit_policy: serde_json::to_string(&self.exit_policy)?,
            exit_policy_summary: serde_json::to_string(&self.exit_policy_summary)?,
            exit_policy_v6_summary: serde_json::to_string(&self.exit_policy_v6_summary)?,
        })
    }

    /// Flags as stored alongside a persisted row.
    pub fn flags_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.flags)?)
    }

    /// JSON of every field that has no dedicated column in the relay table.
    /// Addresses stay in the residual copy; they are versioned separately
    /// but kept here for auditing.
    pub fn residual_json(&self) -> Result<String> {
        let mut residual = self.clone();
        residual.nickname.clear();
        residual.fingerprint.clear();
        residual.country.clear();
        residual.country_name.clear();
        residual.region_name.clear();
        residual.city_name.clear();
        residual.platform.clear();
        residual.version.clear();
        residual.contact.clear();
        residual.last_changed_address_or_port.clear();
        residual.first_seen.clear();
        residual.exit_policy = None;
        residual.exit_policy_summary = None;
        residual.exit_policy_v6_summary = None;
        Ok(serde_json::to_string(&residual)?)
    }

    /// True when every flag in `required` is present on this relay.
    pub fn has_all_flags(&self, required: &[String]) -> bool {
        required.iter().all(|f| self.flags.iter().any(|have| have == f))
    }
}

/// The three independently versioned address roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressRole {
    /// Onion-routing addresses
    Or,
    Exit,
    Dir,
}

impl AddressRole {
    pub const ALL: [AddressRole; 3] = [AddressRole::Or, AddressRole::Exit, AddressRole::Dir];

    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressRole::Or => "Or",
            AddressRole::Exit => "Ex",
            AddressRole::Dir => "Di",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Or" => Some(AddressRole::Or),
            "Ex" => Some(AddressRole::Exit),
            "Di" => Some(AddressRole::Dir),
            _ => None,
        }
    }

    /// Addresses of this role on `relay`. The directory role carries at
    /// most one address.
    pub fn addresses<'a>(&self, relay: &'a RelayDetails) -> &'a [String] {
        match self {
            AddressRole::Or => &relay.or_addresses,
            AddressRole::Exit => &relay.exit_addresses,
            AddressRole::Dir => {
                if relay.dir_address.is_empty() {
                    &[]
                } else {
                    std::slice::from_ref(&relay.dir_address)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "version": "8.0",
        "build_revision": "abc123",
        "relays_published": "2023-01-01 00:00:00",
        "relays": [
            {
                "nickname": "n1",
                "fingerprint": "AAAA",
                "or_addresses": ["1.2.3.4:9001", "[2001:db8::1]:9001"],
                "dir_address": "1.2.3.4:9030",
                "flags": ["Fast", "Running", "Valid"],
                "country": "us",
                "as": "AS64500",
                "exit_policy": ["reject *:*"],
                "exit_policy_summary": {"reject": ["1-65535"]},
                "some_future_field": 42
            }
        ],
        "bridges_published": "2023-01-01 00:00:00",
        "bridges": []
    }"#;

    #[test]
    fn test_decode_document() {
        let doc = ConsensusDocument::from_slice(DOC.as_bytes()).unwrap();
        assert_eq!(doc.version, "8.0");
        assert_eq!(doc.relays.len(), 1);
        let relay = &doc.relays[0];
        assert_eq!(relay.fingerprint, "AAAA");
        assert_eq!(relay.autonomous_system, "AS64500");
        assert_eq!(relay.or_addresses.len(), 2);
        assert!(relay.exit_policy_v6_summary.is_none());
    }

    #[test]
    fn test_policy_blobs_canonical() {
        let doc = ConsensusDocument::from_slice(DOC.as_bytes()).unwrap();
        let blobs = doc.relays[0].policy_blobs().unwrap();
        assert_eq!(blobs.exit_policy, r#"["reject *:*"]"#);
        assert_eq!(blobs.exit_policy_summary, r#"{"reject":["1-65535"]}"#);
        assert_eq!(blobs.exit_policy_v6_summary, "null");
    }

    #[test]
    fn test_policy_key_order_is_canonical() {
        let a: RelayDetails = serde_json::from_str(
            r#"{"exit_policy_summary": {"reject": ["25"], "accept": ["80"]}}"#,
        )
        .unwrap();
        let b: RelayDetails = serde_json::from_str(
            r#"{"exit_policy_summary": {"accept": ["80"], "reject": ["25"]}}"#,
        )
        .unwrap();
        assert_eq!(a.policy_blobs().unwrap(), b.policy_blobs().unwrap());
    }

    #[test]
    fn test_empty_and_absent_policy_differ() {
        let absent = RelayDetails::default();
        let empty = RelayDetails {
            exit_policy: Some(Vec::new()),
            ..Default::default()
        };
        assert_ne!(
            absent.policy_blobs().unwrap().exit_policy,
            empty.policy_blobs().unwrap().exit_policy
        );
    }

    #[test]
    fn test_residual_json_drops_dedicated_columns() {
        let doc = ConsensusDocument::from_slice(DOC.as_bytes()).unwrap();
        let residual = doc.relays[0].residual_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&residual).unwrap();
        assert!(v.get("nickname").is_none());
        assert!(v.get("fingerprint").is_none());
        assert!(v.get("exit_policy").is_none());
        assert_eq!(v["as"], "AS64500");
        assert_eq!(v["or_addresses"][0], "1.2.3.4:9001");
    }

    #[test]
    fn test_role_addresses() {
        let doc = ConsensusDocument::from_slice(DOC.as_bytes()).unwrap();
        let relay = &doc.relays[0];
        assert_eq!(AddressRole::Or.addresses(relay).len(), 2);
        assert!(AddressRole::Exit.addresses(relay).is_empty());
        assert_eq!(AddressRole::Dir.addresses(relay), ["1.2.3.4:9030".to_string()]);

        let no_dir = RelayDetails::default();
        assert!(AddressRole::Dir.addresses(&no_dir).is_empty());
    }

    #[test]
    fn test_flag_filter() {
        let doc = ConsensusDocument::from_slice(DOC.as_bytes()).unwrap();
        let relay = &doc.relays[0];
        assert!(relay.has_all_flags(&[]));
        assert!(relay.has_all_flags(&["Fast".into(), "Valid".into()]));
        assert!(!relay.has_all_flags(&["Fast".into(), "Exit".into()]));
    }
}
