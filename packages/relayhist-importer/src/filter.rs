//! Relay flag filters.

use relayhist::RelayDetails;

/// Split a comma-separated flag list. Blank entries are dropped.
pub fn parse_node_filters(list: &str) -> Vec<String> {
    let flags: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    if flags.is_empty() {
        tracing::debug!("no node filters applied");
    } else {
        tracing::info!("node flag filter: {:?}", flags);
    }
    flags
}

/// Keep relays carrying every flag in `required`. An empty filter keeps
/// everything.
pub fn apply_flag_filter(relays: Vec<RelayDetails>, required: &[String]) -> Vec<RelayDetails> {
    if required.is_empty() {
        return relays;
    }
    relays.into_iter().filter(|r| r.has_all_flags(required)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(fp: &str, flags: &[&str]) -> RelayDetails {
        RelayDetails {
            fingerprint: fp.into(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse() {
        assert!(parse_node_filters("").is_empty());
        assert_eq!(parse_node_filters("Exit, Fast,,"), vec!["Exit", "Fast"]);
    }

    #[test]
    fn test_all_flags_required() {
        let relays = vec![
            relay("A", &["Exit", "Fast", "Running"]),
            relay("B", &["Fast", "Running"]),
            relay("C", &[]),
        ];
        let kept = apply_flag_filter(relays.clone(), &parse_node_filters("Exit,Fast"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].fingerprint, "A");

        assert_eq!(apply_flag_filter(relays, &[]).len(), 3);
    }
}
