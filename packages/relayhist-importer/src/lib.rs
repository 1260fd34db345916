//! Importer for relay consensus snapshots.
//!
//! Downloads the current consensus details document, or bulk-loads saved
//! snapshots matched by a glob, prints the selected relay fields and
//! reconciles every snapshot into the relayhist ledger.

pub mod acquire;
pub mod config;
pub mod filter;
pub mod logging;
pub mod report;
pub mod run;

pub use config::{Args, ImportConfig, Source};
pub use report::PrintOptions;
pub use run::{Importer, RunSummary};
