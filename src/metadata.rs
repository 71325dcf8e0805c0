//! Run fingerprints for reproducibility.
//!
//! Exported run records carry a hash of the configuration and a checksum of
//! the data they were computed from, so two exports can be compared without
//! rerunning anything.

use crate::types::Bar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// Metadata about a data file used in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileMetadata {
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// SHA256 checksum of the file contents.
    pub checksum: String,
}

/// Identity of one optimization or walk-forward run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub config_hash: String,
    /// Checksum of the bars actually used, after any start/end slicing.
    pub bars_checksum: String,
    pub n_bars: usize,
    pub first_bar: Option<DateTime<Utc>>,
    pub last_bar: Option<DateTime<Utc>>,
    pub data_file: Option<DataFileMetadata>,
    pub version: String,
}

impl RunMetadata {
    pub fn new<T: Serialize>(run_id: Uuid, config: &T, bars: &[Bar]) -> Self {
        Self {
            run_id,
            created_at: Utc::now(),
            config_hash: compute_config_hash(config),
            bars_checksum: compute_bars_checksum(bars),
            n_bars: bars.len(),
            first_bar: bars.first().map(|b| b.timestamp),
            last_bar: bars.last().map(|b| b.timestamp),
            data_file: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Attach the source file's checksum. A file that cannot be read is
    /// logged and left out.
    pub fn with_data_file(mut self, path: impl AsRef<Path>) -> Self {
        match track_data_file(path.as_ref()) {
            Ok(meta) => self.data_file = Some(meta),
            Err(e) => warn!("Could not checksum {}: {}", path.as_ref().display(), e),
        }
        self
    }
}

/// Compute SHA256 checksum of a file.
pub fn compute_file_checksum(path: impl AsRef<Path>) -> std::io::Result<String> {
    let data = std::fs::read(path.as_ref())?;
    Ok(compute_hash(&data))
}

/// Compute SHA256 hash of arbitrary bytes.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute configuration hash from JSON serialization.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    match serde_json::to_vec(config) {
        Ok(bytes) => compute_hash(&bytes),
        Err(e) => {
            warn!("Failed to serialize config for hashing: {}", e);
            String::new()
        }
    }
}

/// Hash of the bar contents, independent of the file they came from.
pub fn compute_bars_checksum(bars: &[Bar]) -> String {
    let mut hasher = Sha256::new();
    for bar in bars {
        hasher.update(bar.timestamp.timestamp_millis().to_le_bytes());
        for v in [bar.open, bar.high, bar.low, bar.close, bar.volume] {
            hasher.update(v.to_bits().to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Track data file metadata.
pub fn track_data_file(path: impl AsRef<Path>) -> std::io::Result<DataFileMetadata> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    let checksum = compute_file_checksum(path)?;
    Ok(DataFileMetadata {
        path: path.display().to_string(),
        size,
        checksum,
    })
}
