//! Snapshot acquisition timestamps (DLTS).
//!
//! A DLTS is the logical clock of one snapshot. It is stored and compared in
//! its canonical `YYYYMMDDhhmmss` form, where lexicographic order equals
//! chronological order.
//!
//! [`DltsResolver`] derives the DLTS for a snapshot from one of three sources:
//! the system clock, an explicit override string, or timestamp-looking
//! substrings of the source filename. Candidates are tried against an
//! ordered list of [`TimestampFormat`]s and the first successful parse wins.
//! When nothing parses the resolution fails; there is no silent default.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// strftime layout of the canonical form.
pub const CANONICAL_FORMAT: &str = "%Y%m%d%H%M%S";

/// Pattern used to pull timestamp candidates out of a filename when no
/// custom pattern is configured.
pub const DEFAULT_FILENAME_PATTERN: &str = r"[0-9][0-9_:-]+[0-9]";

// ── Dlts ───────────────────────────────────────────────────────────

/// Canonical acquisition timestamp, `YYYYMMDDhhmmss`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dlts(String);

impl Dlts {
    /// Validate a canonical string. Must be 14 ASCII digits forming a real
    /// calendar date and time.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RelayError::InvalidTimestamp(s.to_string()));
        }
        NaiveDateTime::parse_from_str(s, CANONICAL_FORMAT)
            .map_err(|_| RelayError::InvalidTimestamp(s.to_string()))?;
        Ok(Self(s.to_string()))
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self(dt.format(CANONICAL_FORMAT).to_string())
    }

    /// Current local wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_datetime(&self) -> NaiveDateTime {
        // Validated on construction.
        NaiveDateTime::parse_from_str(&self.0, CANONICAL_FORMAT)
            .unwrap_or_default()
    }
}

impl fmt::Display for Dlts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Dlts {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Dlts {
    type Error = RelayError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Dlts> for String {
    fn from(d: Dlts) -> String {
        d.0
    }
}

// ── Timestamp formats ──────────────────────────────────────────────

/// One accepted input layout for timestamp candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    /// strftime layout without a numeric offset. Zone names (`%Z`) are
    /// skipped, keeping the wall clock as written.
    Naive(String),
    /// strftime layout with a numeric offset (`%z`). The wall clock in the
    /// parsed offset is kept.
    Zoned(String),
    /// RFC 3339, with or without fractional seconds.
    Rfc3339,
}

impl TimestampFormat {
    /// The default ordered format list.
    pub fn defaults() -> Vec<TimestampFormat> {
        use TimestampFormat::*;
        vec![
            Naive("%Y-%m-%d_%H:%M:%S".into()),
            Naive("%Y-%m-%d_%H:%M".into()),
            Naive("%Y%m%d%H%M%S".into()),
            Naive("%Y%m%d%H%M".into()),
            Naive("%Y-%m-%d-%H-%M-%S".into()),
            Naive("%Y-%m-%d-%H-%M".into()),
            Rfc3339,
            // ANSI C asctime
            Naive("%a %b %e %H:%M:%S %Y".into()),
            // Unix date
            Naive("%a %b %e %H:%M:%S %Z %Y".into()),
            // RFC 822
            Naive("%d %b %y %H:%M %Z".into()),
            Zoned("%d %b %y %H:%M %z".into()),
            // RFC 850
            Naive("%A, %d-%b-%y %H:%M:%S %Z".into()),
            // RFC 1123
            Naive("%a, %d %b %Y %H:%M:%S %Z".into()),
            Zoned("%a, %d %b %Y %H:%M:%S %z".into()),
            // Ruby date
            Zoned("%a %b %d %H:%M:%S %z %Y".into()),
        ]
    }

    /// Build a format from user input. Go-style reference layouts
    /// (`2006-01-02 15:04:05`) are translated; anything containing a `%`
    /// is taken as a strftime layout.
    pub fn custom(layout: &str) -> TimestampFormat {
        let strftime = if layout.contains('%') {
            layout.to_string()
        } else {
            translate_reference_layout(layout)
        };
        if strftime.contains("%z") {
            TimestampFormat::Zoned(strftime)
        } else {
            TimestampFormat::Naive(strftime)
        }
    }

    pub fn parse(&self, candidate: &str) -> Option<NaiveDateTime> {
        match self {
            TimestampFormat::Naive(fmt) => NaiveDateTime::parse_from_str(candidate, fmt).ok(),
            TimestampFormat::Zoned(fmt) => DateTime::parse_from_str(candidate, fmt)
                .ok()
                .map(|dt| dt.naive_local()),
            TimestampFormat::Rfc3339 => DateTime::parse_from_rfc3339(candidate)
                .ok()
                .map(|dt| dt.naive_local()),
        }
    }
}

/// Translate a Go reference-time layout into strftime. Longest tokens are
/// matched first so `2006` is not read as `2` + `006`.
fn translate_reference_layout(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("Monday", "%A"),
        ("January", "%B"),
        ("-07:00", "%:z"),
        ("-0700", "%z"),
        ("2006", "%Y"),
        ("Mon", "%a"),
        ("Jan", "%b"),
        ("MST", "%Z"),
        (".000", "%.3f"),
        ("_2", "%e"),
        ("01", "%m"),
        ("02", "%d"),
        ("15", "%H"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("06", "%y"),
        ("PM", "%p"),
    ];

    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let ch = rest.chars().next().unwrap_or_default();
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Return the first candidate/format pair that parses. Candidates are the
/// outer loop: an earlier candidate always wins over a later one.
pub fn match_timestamp_to_formats(
    candidates: &[String],
    formats: &[TimestampFormat],
) -> Option<NaiveDateTime> {
    for candidate in candidates {
        tracing::trace!("matching timestamp candidate: {}", candidate);
        for format in formats {
            if let Some(dt) = format.parse(candidate) {
                tracing::trace!("candidate {} matched {:?}", candidate, format);
                return Some(dt);
            }
        }
    }
    None
}

// ── Resolver ───────────────────────────────────────────────────────

/// Where a snapshot's DLTS comes from.
#[derive(Debug, Clone)]
pub enum DltsSource {
    SystemClock,
    Override(String),
    Filename { pattern: Regex },
}

/// Derives the DLTS of each snapshot of a run.
#[derive(Debug, Clone)]
pub struct DltsResolver {
    source: DltsSource,
    formats: Vec<TimestampFormat>,
}

impl DltsResolver {
    pub fn system_clock() -> Self {
        Self {
            source: DltsSource::SystemClock,
            formats: TimestampFormat::defaults(),
        }
    }

    /// Use a fixed override string for every snapshot.
    pub fn with_override(value: impl Into<String>) -> Self {
        Self {
            source: DltsSource::Override(value.into()),
            formats: TimestampFormat::defaults(),
        }
    }

    /// Extract candidates from filenames, with an optional custom pattern.
    pub fn from_filename(pattern: Option<&str>) -> Result<Self> {
        let pattern = pattern.unwrap_or(DEFAULT_FILENAME_PATTERN);
        let pattern = Regex::new(pattern).map_err(|e| {
            RelayError::Config(format!("invalid filename pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            source: DltsSource::Filename { pattern },
            formats: TimestampFormat::defaults(),
        })
    }

    /// Replace the default format list with a single custom layout.
    pub fn with_format(mut self, layout: &str) -> Self {
        tracing::debug!("custom timestamp format supplied: {}", layout);
        self.formats = vec![TimestampFormat::custom(layout)];
        self
    }

    pub fn source(&self) -> &DltsSource {
        &self.source
    }

    pub fn formats(&self) -> &[TimestampFormat] {
        &self.formats
    }

    /// Timestamp candidates for `filename`, in the order they are tried.
    pub fn candidates(&self, filename: &str) -> Vec<String> {
        match &self.source {
            DltsSource::SystemClock => Vec::new(),
            DltsSource::Override(value) => vec![value.clone()],
            DltsSource::Filename { pattern } => pattern
                .find_iter(filename)
                .map(|m| m.as_str().to_string())
                .collect(),
        }
    }

    /// Resolve the DLTS for a snapshot read from `filename` (ignored for
    /// the system clock and override sources).
    pub fn resolve(&self, filename: &str) -> Result<Dlts> {
        if let DltsSource::SystemClock = self.source {
            let now = Dlts::now();
            tracing::debug!("DLTS from system time: {}", now);
            return Ok(now);
        }

        let candidates = self.candidates(filename);
        tracing::trace!("timestamp candidates for '{}': {:?}", filename, candidates);
        match match_timestamp_to_formats(&candidates, &self.formats) {
            Some(dt) => {
                let dlts = Dlts::from_datetime(&dt);
                tracing::debug!("DLTS for '{}': {}", filename, dlts);
                Ok(dlts)
            }
            None => Err(RelayError::UnparsableTimestamp { candidates }),
        }
    }
}
