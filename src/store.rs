//! Durable per-test metadata records.
//!
//! Phases run in separate processes and the test phase may die with the
//! machine, so the only channel between them is this directory of small JSON
//! records. Each write goes temp file -> fsync -> rename -> fsync(dir) so a
//! record is either absent or complete after a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::baseline::BaselineMetadata;
use crate::error::{IoResultExt as _, ProbeError, Result};

/// Name of the metadata directory under the workspace root.
pub const META_DIR_NAME: &str = ".crashprobe";

const BASELINE_SUFFIX: &str = ".baseline.json";
const RUN_SUFFIX: &str = ".run.json";

const GIB: u64 = 1024 * 1024 * 1024;

/// Identity of one crash test: filesystem label plus file size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestId {
    label: String,
    size_bytes: u64,
}

impl TestId {
    /// Test identity with a size in bytes.
    #[must_use]
    pub fn new(label: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            label: label.into(),
            size_bytes,
        }
    }

    /// Test identity with a size in whole GiB.
    #[must_use]
    pub fn gigabytes(label: impl Into<String>, size_gb: u32) -> Self {
        Self::new(label, u64::from(size_gb) * GIB)
    }

    /// Filesystem label as given by the operator.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Intended baseline size.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Size tag used in file names: `2gb` for whole GiB, `1000b` otherwise.
    #[must_use]
    pub fn size_tag(&self) -> String {
        if self.size_bytes > 0 && self.size_bytes % GIB == 0 {
            format!("{}gb", self.size_bytes / GIB)
        } else {
            format!("{}b", self.size_bytes)
        }
    }

    /// Label in a form safe for file names, distinct for distinct labels.
    ///
    /// A label made only of ASCII alphanumerics, `-` and `_` is used as is.
    /// Anything else is sanitised and suffixed with `.` plus 16 hex digits
    /// of the raw label's BLAKE3 hash; `.` never survives sanitising, so the
    /// two forms cannot meet.
    #[must_use]
    pub fn file_label(&self) -> String {
        let safe: String = self
            .label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if !safe.is_empty() && safe == self.label {
            return safe;
        }
        let base = if safe.is_empty() { "unlabelled" } else { &safe };
        let digest = blake3::hash(self.label.as_bytes()).to_hex();
        format!("{base}.{}", &digest[..16])
    }

    /// Record key: `<file label>-<size tag>`.
    ///
    /// The size tag never contains `-`, so the key splits back into its
    /// parts at the last `-`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}-{}", self.file_label(), self.size_tag())
    }
}

/// What the test phase committed to before copying its first byte.
///
/// Written durably so the verify phase knows a test was actually started and
/// where the destination lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Absolute destination path of the copy.
    pub destination: PathBuf,
    /// When the copy started.
    pub started_at: DateTime<Utc>,
    /// Copy chunk size in bytes.
    pub chunk_size: usize,
    /// Artificial pause between chunks, if any.
    pub delay_ms: Option<u64>,
    /// Lower edge of the danger band.
    pub band_low: f64,
    /// Upper edge of the danger band.
    pub band_high: f64,
}

/// Directory of durable metadata records.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    /// Store rooted at `dir`. Nothing is created until the first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the baseline record for `id`.
    #[must_use]
    pub fn baseline_path(&self, id: &TestId) -> PathBuf {
        self.dir.join(format!("{}{BASELINE_SUFFIX}", id.key()))
    }

    /// Path of the run record for `id`.
    #[must_use]
    pub fn run_path(&self, id: &TestId) -> PathBuf {
        self.dir.join(format!("{}{RUN_SUFFIX}", id.key()))
    }

    /// Durably persist the baseline record.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if any step of the atomic write fails.
    pub fn save_baseline(&self, id: &TestId, meta: &BaselineMetadata) -> Result<PathBuf> {
        let path = self.baseline_path(id);
        self.write_record(&path, meta)?;
        Ok(path)
    }

    /// Load the baseline record.
    ///
    /// # Errors
    ///
    /// [`ProbeError::MissingPrecondition`] if no record exists,
    /// [`ProbeError::Metadata`] if it cannot be decoded.
    pub fn load_baseline(&self, id: &TestId) -> Result<BaselineMetadata> {
        let path = self.baseline_path(id);
        self.read_record(&path)?.ok_or_else(|| {
            ProbeError::MissingPrecondition(format!(
                "baseline metadata not found at {} (run create and test first)",
                path.display()
            ))
        })
    }

    /// Durably persist the run record.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if any step of the atomic write fails.
    pub fn save_run(&self, id: &TestId, run: &RunRecord) -> Result<PathBuf> {
        let path = self.run_path(id);
        self.write_record(&path, run)?;
        Ok(path)
    }

    /// Load the run record.
    ///
    /// # Errors
    ///
    /// [`ProbeError::MissingPrecondition`] if no record exists,
    /// [`ProbeError::Metadata`] if it cannot be decoded.
    pub fn load_run(&self, id: &TestId) -> Result<RunRecord> {
        let path = self.run_path(id);
        self.read_record(&path)?.ok_or_else(|| {
            ProbeError::MissingPrecondition(format!(
                "test run record not found at {} (run the test phase before verify)",
                path.display()
            ))
        })
    }

    fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        fs::create_dir_all(&self.dir).at_path(&self.dir)?;

        let bytes = serde_json::to_vec_pretty(record).map_err(|source| ProbeError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp_path = path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .at_path(&tmp_path)?;
        file.write_all(&bytes).at_path(&tmp_path)?;
        file.sync_all().at_path(&tmp_path)?;
        drop(file);

        fs::rename(&tmp_path, path).at_path(path)?;
        sync_dir(&self.dir).at_path(&self.dir)?;

        debug!(record = %path.display(), bytes = bytes.len(), "metadata record persisted");
        Ok(())
    }

    fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).at_path(path),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ProbeError::Metadata {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Flush a directory entry update (rename, create) to stable storage.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Directory handles cannot be synced on this platform; the rename itself
/// is the best available guarantee.
#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
