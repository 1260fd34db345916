//! Importer configuration: command line plus an optional YAML file.
//!
//! The command line wins over the file except for verbosity, where the file
//! value is used unless the command line sets a non-zero level.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use relayhist::{DltsResolver, DEFAULT_REFRESH_INTERVAL};
use serde::Deserialize;

use crate::report::PrintOptions;

pub const DEFAULT_CONSENSUS_URL: &str = "https://onionoo.torproject.org/details";

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "relayhist-importer",
    version,
    about = "Download or bulk-load relay consensus snapshots into the history ledger"
)]
pub struct Args {
    /// Verbosity level (0-8)
    #[arg(long, default_value_t = 0)]
    pub verbosity: u8,

    /// Only report errors
    #[arg(long)]
    pub quiet: bool,

    /// Path of a YAML config file
    #[arg(long = "config-filename")]
    pub config_filename: Option<PathBuf>,

    /// SQLite database to reconcile into; without one nothing is persisted
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Import file or glob pattern instead of downloading the consensus
    #[arg(long = "import-data-file")]
    pub import_data_file: Option<String>,

    /// Backup path prefix; a UTC timestamp is appended
    #[arg(long = "consensus-backup-file")]
    pub consensus_backup_file: Option<String>,

    /// Gzip the backup file
    #[arg(long = "consensus-backup-gzip")]
    pub consensus_backup_gzip: bool,

    /// Fully rebuild the caches every N snapshots [default: 100]
    #[arg(long = "reinit-caches-every")]
    pub reinit_caches_every: Option<usize>,

    /// Time the imported consensus was downloaded
    #[arg(long = "consensus-download-time")]
    pub consensus_download_time: Option<String>,

    /// Format of the download time (Go reference layout or strftime)
    #[arg(long = "consensus-download-time-format")]
    pub consensus_download_time_format: Option<String>,

    /// Take the download time from the import file name
    #[arg(long = "extract-consensus-download-time-from-filename")]
    pub extract_consensus_download_time_from_filename: bool,

    /// Regex locating the timestamp in the file name (implies extraction)
    #[arg(long = "filename-regex")]
    pub filename_regex: Option<String>,

    // ── Printing ──
    /// Separator between printed fields
    #[arg(long, default_value = ",")]
    pub separator: String,

    #[arg(long)]
    pub nick: bool,

    #[arg(long)]
    pub fp: bool,

    /// Print OR addresses
    #[arg(long)]
    pub or: bool,

    /// Print exit addresses
    #[arg(long)]
    pub ex: bool,

    /// Print the directory address
    #[arg(long)]
    pub di: bool,

    #[arg(long)]
    pub country: bool,

    /// Print the autonomous system
    #[arg(long = "as")]
    pub autonomous_system: bool,

    #[arg(long)]
    pub hostname: bool,

    #[arg(long)]
    pub flags: bool,

    /// One line per address when a relay has several OR (or exit) addresses
    #[arg(long = "ip-per-line")]
    pub ip_per_line: bool,

    /// Shortcut for --nick --fp --ex --hostname
    #[arg(long = "node-info")]
    pub node_info: bool,

    /// Comma-separated relay flags that must all be present
    #[arg(long)]
    pub filter: Option<String>,
}

// ── YAML file ──

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub verbosity: u8,
    pub database: DatabaseSection,
    pub consensus: ConsensusSection,
    pub backup: BackupSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
    pub reinit_caches: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub url: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    pub filename: Option<String>,
    pub gzip: bool,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to open configuration file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

// ── Resolved configuration ──

/// Where snapshots come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Download { url: String },
    Files { pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub prefix: String,
    pub gzip: bool,
}

/// How each snapshot's DLTS is determined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DltsOptions {
    pub override_value: Option<String>,
    pub format: Option<String>,
    pub extract_from_filename: bool,
    pub filename_regex: Option<String>,
}

impl DltsOptions {
    pub fn resolver(&self) -> relayhist::Result<DltsResolver> {
        let resolver = if self.extract_from_filename {
            DltsResolver::from_filename(self.filename_regex.as_deref())?
        } else if let Some(value) = &self.override_value {
            DltsResolver::with_override(value.clone())
        } else {
            DltsResolver::system_clock()
        };
        Ok(match &self.format {
            Some(layout) => resolver.with_format(layout),
            None => resolver,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub verbosity: u8,
    pub quiet: bool,
    pub database: Option<PathBuf>,
    pub source: Source,
    pub backup: Option<BackupConfig>,
    pub reinit_caches_every: usize,
    pub dlts: DltsOptions,
    pub print: PrintOptions,
    pub filter: Vec<String>,
}

impl ImportConfig {
    /// Merge `args` with the config file it names, then validate.
    pub fn from_args(args: Args) -> Result<Self> {
        let file = match &args.config_filename {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: Args, file: FileConfig) -> Result<Self> {
        let has_import_file = args.import_data_file.is_some() || file.consensus.filename.is_some();
        if !has_import_file
            && (args.extract_consensus_download_time_from_filename
                || args.consensus_download_time.is_some()
                || args.consensus_download_time_format.is_some()
                || args.filename_regex.is_some())
        {
            bail!(
                "--consensus-download-time, --consensus-download-time-format, \
                 --extract-consensus-download-time-from-filename and --filename-regex \
                 require --import-data-file"
            );
        }

        let extract_from_filename =
            args.extract_consensus_download_time_from_filename || args.filename_regex.is_some();
        if extract_from_filename && args.consensus_download_time.is_some() {
            bail!(
                "--extract-consensus-download-time-from-filename and --consensus-download-time \
                 are mutually exclusive"
            );
        }

        let reinit_caches_every = args
            .reinit_caches_every
            .or(file.database.reinit_caches)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL);
        if reinit_caches_every == 0 {
            bail!("--reinit-caches-every must be at least 1");
        }

        let source = match args.import_data_file.or(file.consensus.filename) {
            Some(pattern) => Source::Files { pattern },
            None => Source::Download {
                url: file.consensus.url.unwrap_or_else(|| DEFAULT_CONSENSUS_URL.to_string()),
            },
        };

        let backup = match args.consensus_backup_file {
            Some(prefix) => Some(BackupConfig {
                prefix,
                gzip: args.consensus_backup_gzip,
            }),
            None => file.backup.filename.map(|prefix| BackupConfig {
                prefix,
                gzip: file.backup.gzip,
            }),
        };

        let mut print = PrintOptions {
            separator: args.separator,
            nickname: args.nick,
            fingerprint: args.fp,
            or_addresses: args.or,
            exit_addresses: args.ex,
            dir_address: args.di,
            country: args.country,
            autonomous_system: args.autonomous_system,
            hostname: args.hostname,
            flags: args.flags,
            ip_per_line: args.ip_per_line,
        };
        if args.node_info {
            print.apply_node_info();
        }

        Ok(Self {
            verbosity: if args.verbosity != 0 { args.verbosity } else { file.verbosity },
            quiet: args.quiet,
            database: args.database.or(file.database.path),
            source,
            backup,
            reinit_caches_every,
            dlts: DltsOptions {
                override_value: args.consensus_download_time,
                format: args.consensus_download_time_format,
                extract_from_filename,
                filename_regex: args.filename_regex,
            },
            print,
            filter: crate::filter::parse_node_filters(args.filter.as_deref().unwrap_or("")),
        })
    }

    /// Default log directive for the configured verbosity.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbosity {
            0 => "warn",
            1..=2 => "info",
            3..=5 => "debug",
            _ => "trace",
        }
    }
}
