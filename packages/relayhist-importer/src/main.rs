use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use relayhist::{MemoryStore, RelayStore, SqliteStore};
use relayhist_importer::{logging, Args, ImportConfig, Importer};

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match ImportConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relayhist-importer: {e:#}");
            return ExitCode::from(2);
        }
    };
    logging::init(&config);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: ImportConfig) -> Result<()> {
    match config.database.clone() {
        Some(path) => {
            tracing::info!("reconciling into {}", path.display());
            let store = SqliteStore::open(&path).with_context(|| format!("opening database {}", path.display()))?;
            import(config, store)
        }
        None => {
            tracing::info!("no database configured; nothing will be persisted");
            import(config, MemoryStore::new())
        }
    }
}

fn import<S: RelayStore>(config: ImportConfig, store: S) -> Result<()> {
    let mut importer = Importer::new(config, store)?;
    importer.register_signal_handlers()?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let summary = importer.run(&mut out)?;
    out.flush()?;

    let s = &summary.stats;
    tracing::info!(
        "{} snapshots ({} identical): {} new, {} changed, {} refreshed, {} unchanged, {} skipped by delta; {} address rows added",
        summary.snapshots,
        summary.identical_snapshots,
        s.new,
        s.changed,
        s.refreshed,
        s.unchanged_fresh + s.unchanged_stale,
        s.skipped_by_delta,
        s.addresses.inserted
    );
    if summary.interrupted {
        tracing::warn!(
            "interrupted after snapshot {}",
            summary.last_dlts.as_ref().map_or("none", |d| d.as_str())
        );
    }
    Ok(())
}
