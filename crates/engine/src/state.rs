//! On-disk snapshots of the vector store and result caches
//!
//! Each file is written to a temporary sibling first and renamed into
//! place, so a crash never leaves a truncated snapshot behind.

use medparse_common::{AppError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::debug;

pub(crate) const INDEX_FILE: &str = "index.json";
pub(crate) const EXTRACTION_CACHE_FILE: &str = "extraction_cache.json";
pub(crate) const NOTES_CACHE_FILE: &str = "notes_cache.json";

/// Entries written and read by one save or load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateSummary {
    pub corpora: usize,
    pub extractions: usize,
    pub notes: usize,
}

pub(crate) async fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(name);
    let temp = dir.join(format!(".{}.tmp", name));

    let bytes = serde_json::to_vec(value)?;
    tokio::fs::write(&temp, &bytes).await?;
    tokio::fs::rename(&temp, &target).await?;

    debug!(path = %target.display(), bytes = bytes.len(), "Snapshot written");
    Ok(())
}

/// Read a snapshot; `None` when the file does not exist
pub(crate) async fn read_json<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Option<T>> {
    let path = dir.join(name);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&bytes).map(Some).map_err(|e| AppError::Configuration {
        message: format!("corrupt snapshot {}: {}", path.display(), e),
    })
}
