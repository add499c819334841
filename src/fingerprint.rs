//! Streaming content fingerprints.
//!
//! A [`Fingerprint`] is the BLAKE3 digest of a file's full content. The
//! [`FingerprintEngine`] folds a byte stream into a running hasher one
//! fixed-size chunk at a time, so multi-gigabyte files are fingerprinted in
//! bounded memory. A stream that fails part way never yields a fingerprint:
//! the caller gets a [`ReadFailure`] recording how far the read got.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::error::{IoResultExt as _, ProbeError, Result};

/// Name of the digest algorithm, recorded alongside persisted fingerprints.
pub const HASH_ALGORITHM: &str = "BLAKE3";

/// Default read chunk for fingerprinting (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Smallest accepted chunk size (4 KiB).
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// 256-bit digest of a complete byte stream.
///
/// Serialized as 64 lowercase hex characters so metadata records stay
/// readable by a human auditor.
///
/// # Example
///
/// ```rust
/// use crashprobe::Fingerprint;
///
/// let a = Fingerprint::compute(b"hello world");
/// let b = Fingerprint::compute(b"hello world");
/// assert_eq!(a, b);
/// assert_ne!(a, Fingerprint::compute(b"hello there"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint an in-memory buffer.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create a `Fingerprint` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 16 hex characters, for compact console output.
    #[must_use]
    pub fn short(&self) -> String {
        self.to_string()[..16].to_string()
    }
}

impl From<blake3::Hash> for Fingerprint {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Error parsing a hex fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid fingerprint {input:?}: expected 64 hex characters")]
pub struct ParseFingerprintError {
    input: String,
}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ParseFingerprintError {
            input: s.to_string(),
        };
        if s.len() != 64 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A byte stream stopped yielding data before it reached its end.
///
/// Carries the number of bytes that were folded in before the failure. The
/// partial digest is deliberately discarded.
#[derive(Error, Debug)]
#[error("read failed after {bytes_read} bytes: {source}")]
pub struct ReadFailure {
    /// Bytes successfully consumed before the failure.
    pub bytes_read: u64,
    /// Underlying I/O error.
    #[source]
    pub source: io::Error,
}

/// Chunked streaming fingerprinter.
///
/// The digest depends only on the bytes read, never on the chunk size.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintEngine {
    chunk_size: usize,
}

impl FingerprintEngine {
    /// Create an engine with a custom chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidChunkSize`] outside 4 KiB - 16 MiB.
    pub fn new(chunk_size: usize) -> Result<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(ProbeError::InvalidChunkSize(chunk_size));
        }
        Ok(Self { chunk_size })
    }

    /// Configured chunk size.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Fingerprint a reader to its end.
    ///
    /// Returns the digest and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ReadFailure`] if the reader fails mid-stream.
    pub fn fingerprint<R: Read>(
        &self,
        mut reader: R,
    ) -> std::result::Result<(Fingerprint, u64), ReadFailure> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes_read = 0u64;

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(ReadFailure { bytes_read, source }),
            };
            hasher.update(&buffer[..n]);
            bytes_read += n as u64;
        }

        Ok((hasher.finalize().into(), bytes_read))
    }

    /// Fingerprint the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if the file cannot be opened, or if reading
    /// fails; in the latter case the error carries the offset reached.
    pub fn fingerprint_file(&self, path: &Path) -> Result<(Fingerprint, u64)> {
        let file = File::open(path).at_path(path)?;
        self.fingerprint(file).map_err(|e| ProbeError::Io {
            path: path.to_path_buf(),
            offset: Some(e.bytes_read),
            source: e.source,
        })
    }
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}
