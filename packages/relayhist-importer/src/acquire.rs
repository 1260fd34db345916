//! Snapshot acquisition: download, file read, backup.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use relayhist::ConsensusDocument;

use crate::config::BackupConfig;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetch the raw consensus details document from `url`.
pub fn download(url: &str) -> Result<Vec<u8>> {
    tracing::info!("downloading consensus details from {}", url);
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| anyhow!("failed to build http client: {e}"))?;

    let resp = client
        .get(url)
        .send()
        .map_err(|e| anyhow!("failed to reach {url}: {e}"))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("download from {url} failed with status {status}"));
    }
    let body = resp.bytes().with_context(|| format!("reading response body from {url}"))?;
    tracing::debug!("downloaded {} bytes", body.len());
    Ok(body.to_vec())
}

/// Read a snapshot file, gunzipping it when the name ends in `.gz`.
pub fn read_snapshot_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).with_context(|| format!("opening consensus data file {}", path.display()))?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        tracing::debug!("decompressing {}", path.display());
        let mut out = Vec::with_capacity(data.len() * 8);
        GzDecoder::new(data.as_slice())
            .read_to_end(&mut out)
            .with_context(|| format!("decompressing {}", path.display()))?;
        return Ok(out);
    }
    Ok(data)
}

/// Backup file name: `<prefix>-<UTC yyyymmddhhmmss>[.gz]`.
pub fn backup_path(backup: &BackupConfig, at: DateTime<Utc>) -> PathBuf {
    let mut name = format!("{}-{}", backup.prefix, at.format("%Y%m%d%H%M%S"));
    if backup.gzip {
        name.push_str(".gz");
    }
    PathBuf::from(name)
}

/// Write `data` to a timestamped backup file and return its path.
pub fn backup_snapshot(data: &[u8], backup: &BackupConfig, at: DateTime<Utc>) -> Result<PathBuf> {
    let path = backup_path(backup, at);
    tracing::info!("creating backup file {}", path.display());
    let file = File::create(&path).with_context(|| format!("creating backup file {}", path.display()))?;

    if backup.gzip {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut encoder = GzBuilder::new()
            .filename(name)
            .comment("relayhist")
            .mtime(at.timestamp().max(0) as u32)
            .write(file, Compression::default());
        encoder.write_all(data)?;
        encoder.finish().with_context(|| format!("finishing {}", path.display()))?;
    } else {
        let mut file = file;
        file.write_all(data)?;
    }
    Ok(path)
}

/// Decode a consensus details document.
pub fn decode(data: &[u8]) -> Result<ConsensusDocument> {
    ConsensusDocument::from_slice(data).context("parsing consensus document")
}

/// Hex blake3 digest of the raw snapshot bytes.
pub fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
