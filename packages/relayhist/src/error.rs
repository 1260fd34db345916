//! Error types for the relay ledger

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid DLTS '{0}': expected YYYYMMDDhhmmss")]
    InvalidTimestamp(String),

    #[error("Unable to parse timestamp from candidates {candidates:?}")]
    UnparsableTimestamp { candidates: Vec<String> },

    #[error("Cache refresh interval must be >= 1, got {0}")]
    InvalidRefreshInterval(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A per-record failure, annotated with enough position information to
    /// resume the run safely.
    #[error(
        "Reconciliation failed at snapshot {snapshot}, relay {fingerprint} \
         (last reconciled: {}): {source}",
        .last_reconciled.as_deref().unwrap_or("none")
    )]
    Reconcile {
        snapshot: usize,
        fingerprint: String,
        last_reconciled: Option<String>,
        #[source]
        source: Box<RelayError>,
    },
}

impl RelayError {
    /// Stable error code for logs and exit reporting
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Sqlite(_) | RelayError::Store(_) => "STORE_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::Json(_) => "DECODE_ERROR",
            RelayError::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            RelayError::UnparsableTimestamp { .. } => "UNPARSABLE_TIMESTAMP",
            RelayError::InvalidRefreshInterval(_) | RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::Reconcile { source, .. } => source.code(),
        }
    }

    /// True for errors that leave the run in a resumable position: the
    /// store holds a correct prefix of the failing snapshot.
    pub fn is_resumable(&self) -> bool {
        matches!(self, RelayError::Reconcile { .. })
    }
}
