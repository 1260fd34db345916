//! The import run: acquire each snapshot, report it and reconcile it.
//!
//! A run is either a single download (DLTS = now) or a sorted list of files
//! expanded from a glob. More than one file is a bulk run: the DLTS must
//! come from the file names and each snapshot after the first is reduced
//! to its delta against the previous full snapshot before filtering,
//! printing and reconciliation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use relayhist::{
    extract_new_and_updated, ConsensusDocument, Dlts, DltsResolver, ImportRecord, ReconcileStats, Reconciler,
    RelayDetails, RelayStore,
};

use crate::acquire;
use crate::config::{ImportConfig, Source};
use crate::filter::apply_flag_filter;
use crate::report::print_relays;

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Snapshots reconciled to completion.
    pub snapshots: usize,
    pub stats: ReconcileStats,
    pub printed_lines: usize,
    /// Snapshots whose bytes matched the previous one.
    pub identical_snapshots: usize,
    /// A stop was requested before all snapshots were processed.
    pub interrupted: bool,
    /// DLTS of the last completed snapshot.
    pub last_dlts: Option<Dlts>,
}

/// Everything kept from the previous snapshot of a bulk run.
struct Previous {
    digest: String,
    document: ConsensusDocument,
}

/// Expand an import pattern into a sorted file list. No match is an error.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("bad filename pattern: {pattern}"))? {
        files.push(entry.with_context(|| format!("reading match of {pattern}"))?);
    }
    if files.is_empty() {
        bail!("bad filename pattern: {pattern} matches no files");
    }
    files.sort();
    Ok(files)
}

pub struct Importer<S: RelayStore> {
    config: ImportConfig,
    engine: Reconciler<S>,
    stop: Arc<AtomicBool>,
}

impl<S: RelayStore> Importer<S> {
    pub fn new(config: ImportConfig, store: S) -> Result<Self> {
        let mut engine = Reconciler::new(store);
        engine.set_refresh_interval(config.reinit_caches_every)?;
        Ok(Self {
            config,
            engine,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that, once set, stops the run before the next snapshot.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Set the stop flag on SIGINT and SIGTERM.
    pub fn register_signal_handlers(&self) -> Result<()> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.stop))
                .with_context(|| format!("registering handler for signal {signal}"))?;
        }
        Ok(())
    }

    pub fn engine(&self) -> &Reconciler<S> {
        &self.engine
    }

    pub fn into_store(self) -> S {
        self.engine.into_store()
    }

    /// Run to completion (or until stopped). Report lines go to `out`.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<RunSummary> {
        match self.config.source.clone() {
            Source::Download { url } => self.run_download(&url, out),
            Source::Files { pattern } => self.run_files(&pattern, out),
        }
    }

    fn run_download(&mut self, url: &str, out: &mut dyn Write) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let dlts = DltsResolver::system_clock().resolve("")?;
        let data = acquire::download(url)?;
        self.process_snapshot(0, &data, &dlts, None, &mut summary, out)?;
        Ok(summary)
    }

    fn run_files(&mut self, pattern: &str, out: &mut dyn Write) -> Result<RunSummary> {
        let files = expand_pattern(pattern)?;
        let total = files.len();

        let mut dlts_options = self.config.dlts.clone();
        if total > 1 {
            tracing::info!("bulk import detected ({}): {} files", pattern, total);
            if dlts_options.override_value.is_some() {
                bail!("bulk import of {total} files cannot use --consensus-download-time");
            }
            if !dlts_options.extract_from_filename {
                tracing::warn!("bulk mode without --extract-consensus-download-time-from-filename; turning it on");
                dlts_options.extract_from_filename = true;
            }
        }
        let resolver = dlts_options.resolver()?;

        let bulk_start = Instant::now();
        let mut summary = RunSummary::default();
        let mut previous: Option<Previous> = None;

        for (index, path) in files.iter().enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                tracing::warn!(
                    "stop requested; {} of {} snapshots imported, last DLTS {}",
                    summary.snapshots,
                    total,
                    summary.last_dlts.as_ref().map_or("none", |d| d.as_str())
                );
                summary.interrupted = true;
                break;
            }

            let file_start = Instant::now();
            let dlts = resolver
                .resolve(&file_name(path))
                .with_context(|| format!("determining download time of {}", path.display()))?;
            tracing::info!("importing {}/{}: {} (DLTS {})", index + 1, total, path.display(), dlts);

            let data = acquire::read_snapshot_file(path)?;
            previous = Some(
                self.process_snapshot(index, &data, &dlts, previous.take(), &mut summary, out)
                    .with_context(|| format!("importing {}", path.display()))?,
            );
            tracing::info!("snapshot {} added in {:?}", path.display(), file_start.elapsed());
        }

        if total > 1 {
            tracing::info!("bulk import of {} files in {:?}", summary.snapshots, bulk_start.elapsed());
        }
        Ok(summary)
    }

    /// Back up, decode, log, delta, filter, print and reconcile one
    /// snapshot. Returns what the next snapshot needs for its delta.
    fn process_snapshot(
        &mut self,
        index: usize,
        data: &[u8],
        dlts: &Dlts,
        previous: Option<Previous>,
        summary: &mut RunSummary,
        out: &mut dyn Write,
    ) -> Result<Previous> {
        if let Some(backup) = &self.config.backup {
            acquire::backup_snapshot(data, backup, Utc::now())?;
        }

        let digest = acquire::digest(data);
        let identical = previous.as_ref().map_or(false, |p| p.digest == digest);

        let (document, candidates): (ConsensusDocument, Vec<RelayDetails>) = match previous {
            Some(prev) if identical => {
                tracing::info!("snapshot identical to the previous one; nothing new to reconcile");
                summary.identical_snapshots += 1;
                summary.stats.skipped_by_delta += prev.document.relays.len();
                (prev.document, Vec::new())
            }
            Some(prev) => {
                let document = acquire::decode(data)?;
                let delta = extract_new_and_updated(&prev.document.relays, &document.relays);
                tracing::info!("bulk mode: {} new or updated relays in this batch", delta.len());
                summary.stats.skipped_by_delta += document.relays.len() - delta.len();
                (document, delta)
            }
            None => {
                let document = acquire::decode(data)?;
                let relays = document.relays.clone();
                (document, relays)
            }
        };

        tracing::info!(
            "consensus version {}, build revision {}, relays published {} (DLTS {})",
            document.version,
            document.build_revision,
            document.relays_published,
            dlts
        );
        self.engine.store_mut().record_import(&ImportRecord {
            protocol_version: document.version.clone(),
            relays_published: document.relays_published.clone(),
            bridges_published: document.bridges_published.clone(),
            dlts: dlts.clone(),
            digest: digest.clone(),
        })?;

        let batch = apply_flag_filter(candidates, &self.config.filter);
        summary.printed_lines += print_relays(&self.config.print, &batch, out)?;

        let stats = self.engine.reconcile(&batch, dlts, index == 0)?;
        summary.stats.merge(&stats);
        summary.snapshots += 1;
        summary.last_dlts = Some(dlts.clone());

        Ok(Previous { digest, document })
    }
}

/// Final path component, where the timestamp lives.
fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
