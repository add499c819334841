//! Baseline file generation.
//!
//! The create phase writes a file of an exact size filled with a seeded
//! [`Pattern`], syncs it, and describes it with a [`BaselineMetadata`]
//! record. If a file of the right size is already in place it is kept, but
//! its fingerprint is always re-derived from what is actually on disk.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IoResultExt as _, ProbeError, Result};
use crate::fingerprint::{Fingerprint, FingerprintEngine, HASH_ALGORITHM};
use crate::pattern::Pattern;
use crate::store::sync_dir;

/// Current metadata schema version.
pub const METADATA_VERSION: u32 = 1;

/// Durable description of the baseline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineMetadata {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Absolute path of the baseline file.
    pub path: PathBuf,
    /// Exact intended size.
    pub size_bytes: u64,
    /// Fingerprint of the full content.
    pub fingerprint: Fingerprint,
    /// Digest algorithm that produced `fingerprint`.
    pub hash_algorithm: String,
    /// Seed of the content pattern, when the content is known to be that
    /// pattern's output. `None` for an adopted file with other content.
    pub pattern_seed: Option<u64>,
    /// Last modification time of the content, after the final sync.
    pub created_at: DateTime<Utc>,
}

/// Source of free-space figures for the preflight check.
pub trait SpaceProbe {
    /// Bytes available to this process on the filesystem holding `dir`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the figure cannot be obtained.
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Check that `required` bytes fit in `dir`, crediting `reclaimable` bytes
/// that will be freed first.
///
/// # Errors
///
/// [`ProbeError::InsufficientSpace`] when they do not fit,
/// [`ProbeError::Io`] if the free-space query fails.
pub fn ensure_space<S: SpaceProbe + ?Sized>(
    probe: &S,
    dir: &Path,
    required: u64,
    reclaimable: u64,
) -> Result<()> {
    let available = probe.available_bytes(dir).at_path(dir)?;
    let effective = available.saturating_add(reclaimable);
    if effective < required {
        return Err(ProbeError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available: effective,
        });
    }
    Ok(())
}

/// Writes reproducible baseline files.
#[derive(Debug, Clone)]
pub struct BaselineGenerator<S = FsSpaceProbe> {
    pattern: Pattern,
    chunk_size: usize,
    space: S,
}

impl BaselineGenerator<FsSpaceProbe> {
    /// Generator with the default pattern, 4 MiB chunks and OS space checks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pattern: Pattern::default(),
            chunk_size: FingerprintEngine::default().chunk_size(),
            space: FsSpaceProbe,
        }
    }
}

impl Default for BaselineGenerator<FsSpaceProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SpaceProbe> BaselineGenerator<S> {
    /// Replace the free-space source.
    #[must_use]
    pub fn with_space_probe<T: SpaceProbe>(self, space: T) -> BaselineGenerator<T> {
        BaselineGenerator {
            pattern: self.pattern,
            chunk_size: self.chunk_size,
            space,
        }
    }

    /// Use a different content pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Use a different write/read chunk size.
    ///
    /// # Errors
    ///
    /// [`ProbeError::InvalidChunkSize`] outside 4 KiB - 16 MiB.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        self.chunk_size = FingerprintEngine::new(chunk_size)?.chunk_size();
        Ok(self)
    }

    /// Create (or adopt) the baseline file at `path`.
    ///
    /// The returned metadata is not persisted here; the caller owns the
    /// metadata store.
    ///
    /// # Errors
    ///
    /// - [`ProbeError::InvalidSize`] if `size_bytes` is zero
    /// - [`ProbeError::InsufficientSpace`] if the file cannot fit
    /// - [`ProbeError::Io`] on any read, write or sync failure
    pub fn create(&self, path: &Path, size_bytes: u64) -> Result<BaselineMetadata> {
        if size_bytes == 0 {
            return Err(ProbeError::InvalidSize(size_bytes));
        }
        let engine = FingerprintEngine::new(self.chunk_size)?;

        let existing = match fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).at_path(path),
        };

        if existing == Some(size_bytes) {
            info!(path = %path.display(), size_bytes, "baseline already present with correct size, re-fingerprinting");
            let (fingerprint, _) = engine.fingerprint_file(path)?;
            let seed = if fingerprint == self.pattern_fingerprint(path, size_bytes)? {
                Some(self.pattern.seed())
            } else {
                warn!(path = %path.display(), "existing baseline is not this pattern's output; seed unknown");
                None
            };
            return self.describe(path, size_bytes, fingerprint, seed);
        }

        let dir = parent_dir(path);
        fs::create_dir_all(&dir).at_path(&dir)?;
        ensure_space(&self.space, &dir, size_bytes, existing.unwrap_or(0))?;

        if let Some(len) = existing {
            warn!(path = %path.display(), found = len, wanted = size_bytes, "baseline has wrong size, recreating");
            fs::remove_file(path).at_path(path)?;
        }

        let fingerprint = self.write_pattern(path, size_bytes)?;
        sync_dir(&dir).at_path(&dir)?;
        info!(path = %path.display(), size_bytes, %fingerprint, "baseline written");
        self.describe(path, size_bytes, fingerprint, Some(self.pattern.seed()))
    }

    /// Stream the pattern into a new file, folding the digest as it goes.
    fn write_pattern(&self, path: &Path, size_bytes: u64) -> Result<Fingerprint> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .at_path(path)?;

        let mut source = self.pattern.reader(size_bytes);
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        let mut last_percent = 0;

        while written < size_bytes {
            let n = source.read(&mut buffer).at_offset(path, written)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).at_offset(path, written)?;
            hasher.update(&buffer[..n]);
            written += n as u64;

            let percent = written * 100 / size_bytes;
            if percent / 10 > last_percent / 10 {
                debug!(percent, written, "baseline progress");
            }
            last_percent = percent;
        }

        file.sync_all().at_offset(path, written)?;
        Ok(hasher.finalize().into())
    }

    /// Digest the pattern would produce for `size_bytes`, without touching disk.
    fn pattern_fingerprint(&self, path: &Path, size_bytes: u64) -> Result<Fingerprint> {
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut self.pattern.reader(size_bytes), &mut hasher).at_path(path)?;
        Ok(hasher.finalize().into())
    }

    fn describe(
        &self,
        path: &Path,
        size_bytes: u64,
        fingerprint: Fingerprint,
        pattern_seed: Option<u64>,
    ) -> Result<BaselineMetadata> {
        let absolute = fs::canonicalize(path).at_path(path)?;
        let modified = fs::metadata(&absolute)
            .and_then(|m| m.modified())
            .at_path(&absolute)?;
        Ok(BaselineMetadata {
            version: METADATA_VERSION,
            path: absolute,
            size_bytes,
            fingerprint,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            pattern_seed,
            created_at: modified.into(),
        })
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
