//! Report lines printed for each imported relay.

use std::io::{self, Write};

use relayhist::RelayDetails;

/// Which relay fields to print, in fixed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintOptions {
    pub separator: String,
    pub nickname: bool,
    pub fingerprint: bool,
    pub or_addresses: bool,
    pub exit_addresses: bool,
    pub dir_address: bool,
    pub country: bool,
    pub autonomous_system: bool,
    pub hostname: bool,
    pub flags: bool,
    pub ip_per_line: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            separator: ",".to_string(),
            nickname: false,
            fingerprint: false,
            or_addresses: false,
            exit_addresses: false,
            dir_address: false,
            country: false,
            autonomous_system: false,
            hostname: false,
            flags: false,
            ip_per_line: false,
        }
    }
}

impl PrintOptions {
    /// Nickname, fingerprint, exit addresses and host name.
    pub fn apply_node_info(&mut self) {
        self.nickname = true;
        self.fingerprint = true;
        self.exit_addresses = true;
        self.hostname = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.nickname
            || self.fingerprint
            || self.or_addresses
            || self.exit_addresses
            || self.dir_address
            || self.country
            || self.autonomous_system
            || self.hostname
            || self.flags
    }
}

/// A printed field; address lists may expand into one line per address.
enum Field<'a> {
    Text(&'a str),
    Owned(String),
    ExpandOr,
    ExpandExit,
}

/// Report lines for one relay. Every field is followed by the separator.
/// With `ip_per_line`, several OR addresses expand into one line each;
/// otherwise several exit addresses do.
pub fn format_relay(opts: &PrintOptions, relay: &RelayDetails) -> Vec<String> {
    let mut fields: Vec<Field<'_>> = Vec::new();

    if opts.nickname {
        fields.push(Field::Text(&relay.nickname));
    }
    if opts.fingerprint {
        fields.push(Field::Text(&relay.fingerprint));
    }
    if opts.or_addresses {
        if opts.ip_per_line && relay.or_addresses.len() > 1 {
            fields.push(Field::ExpandOr);
        } else {
            fields.extend(relay.or_addresses.iter().map(|a| Field::Text(a)));
        }
    }
    if opts.exit_addresses {
        if opts.ip_per_line && relay.exit_addresses.len() > 1 {
            fields.push(Field::ExpandExit);
        } else {
            fields.extend(relay.exit_addresses.iter().map(|a| Field::Text(a)));
        }
    }
    if opts.dir_address {
        fields.push(Field::Text(&relay.dir_address));
    }
    if opts.country {
        fields.push(Field::Text(&relay.country));
    }
    if opts.autonomous_system {
        fields.push(Field::Text(&relay.autonomous_system));
    }
    if opts.hostname {
        fields.push(Field::Text(&relay.host_name));
    }
    if opts.flags {
        fields.push(Field::Owned(format!("[{}]", relay.flags.join(" "))));
    }

    if fields.is_empty() {
        return Vec::new();
    }

    let expand_or = fields.iter().any(|f| matches!(f, Field::ExpandOr));
    let expand_exit = fields.iter().any(|f| matches!(f, Field::ExpandExit));

    let render = |or: Option<&str>, exit: Option<&str>| -> String {
        let sep = opts.separator.as_str();
        let mut line = String::new();
        for field in &fields {
            match field {
                Field::Text(t) => {
                    line.push_str(t);
                    line.push_str(sep);
                }
                Field::Owned(t) => {
                    line.push_str(t);
                    line.push_str(sep);
                }
                Field::ExpandOr => push_expanded(&mut line, or, &relay.or_addresses, sep),
                Field::ExpandExit => push_expanded(&mut line, exit, &relay.exit_addresses, sep),
            }
        }
        line
    };

    if expand_or {
        relay.or_addresses.iter().map(|a| render(Some(a.as_str()), None)).collect()
    } else if expand_exit {
        relay.exit_addresses.iter().map(|a| render(None, Some(a.as_str()))).collect()
    } else {
        vec![render(None, None)]
    }
}

/// The chosen address of an expanded field, or the whole list inline when
/// another field is being expanded.
fn push_expanded(line: &mut String, chosen: Option<&str>, all: &[String], sep: &str) {
    match chosen {
        Some(addr) => {
            line.push_str(addr);
            line.push_str(sep);
        }
        None => {
            for addr in all {
                line.push_str(addr);
                line.push_str(sep);
            }
        }
    }
}

/// Write report lines for `relays`; returns the number of lines written.
pub fn print_relays(opts: &PrintOptions, relays: &[RelayDetails], out: &mut dyn Write) -> io::Result<usize> {
    if !opts.is_enabled() {
        return Ok(0);
    }
    let mut written = 0;
    for relay in relays {
        for line in format_relay(opts, relay) {
            writeln!(out, "{}", line)?;
            written += 1;
        }
    }
    Ok(written)
}
