//! Error types for crashprobe operations.
//!
//! Every variant here is fatal to the phase that raised it. An abrupt power
//! loss during the test phase produces no error at all; it is only observed
//! later through what the verify phase finds on disk.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur during crashprobe operations.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Not enough free space to write the requested file.
    #[error(
        "Insufficient space in {}: need {required} bytes, only {available} available",
        .path.display()
    )]
    InsufficientSpace {
        /// Directory that was checked
        path: PathBuf,
        /// Bytes the operation needs
        required: u64,
        /// Bytes reported free
        available: u64,
    },

    /// I/O failure with the file and byte offset it happened at.
    #[error("I/O error on {}{}: {source}", .path.display(), fmt_offset(.offset))]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Byte offset reached when the failure occurred, if meaningful
        offset: Option<u64>,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A phase was started without the durable state an earlier phase writes.
    #[error("Missing precondition: {0}")]
    MissingPrecondition(String),

    /// Requested baseline size is zero.
    #[error("Invalid size: {0} bytes (must be greater than zero)")]
    InvalidSize(u64),

    /// Chunk size outside the accepted range.
    #[error("Invalid chunk size: {0} bytes (must be 4 KiB - 16 MiB)")]
    InvalidChunkSize(usize),

    /// Danger band is not an ordered pair of fractions in `[0, 1]`.
    #[error("Invalid danger band: {low}..{high} (need 0 <= low <= high <= 1)")]
    InvalidDangerBand {
        /// Lower fraction
        low: f64,
        /// Upper fraction
        high: f64,
    },

    /// A metadata record could not be encoded or decoded.
    #[error("Corrupt metadata record {}: {source}", .path.display())]
    Metadata {
        /// Record path
        path: PathBuf,
        /// Decoder error
        #[source]
        source: serde_json::Error,
    },
}

fn fmt_offset(offset: &Option<u64>) -> String {
    offset.map_or_else(String::new, |o| format!(" at offset {o}"))
}

/// Result type for crashprobe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Attaches path (and optionally offset) context to `io::Result`s.
pub trait IoResultExt<T> {
    /// Tag an I/O failure with the path it concerns.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if `self` is an error.
    fn at_path(self, path: &Path) -> Result<T>;

    /// Tag an I/O failure with the path and byte offset it concerns.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Io`] if `self` is an error.
    fn at_offset(self, path: &Path, offset: u64) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| ProbeError::Io {
            path: path.to_path_buf(),
            offset: None,
            source,
        })
    }

    fn at_offset(self, path: &Path, offset: u64) -> Result<T> {
        self.map_err(|source| ProbeError::Io {
            path: path.to_path_buf(),
            offset: Some(offset),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_insufficient_space() {
        let err = ProbeError::InsufficientSpace {
            path: PathBuf::from("/mnt/test"),
            required: 2048,
            available: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("/mnt/test"));
        assert!(msg.contains("need 2048"));
        assert!(msg.contains("1024 available"));
    }

    #[test]
    fn error_display_io_with_offset() {
        let err: Result<()> = Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
            .at_offset(Path::new("/data/large.dat"), 4096);
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("/data/large.dat"));
        assert!(msg.contains("at offset 4096"));
        assert!(msg.contains("disk gone"));
    }

    #[test]
    fn error_display_io_without_offset() {
        let err: Result<()> =
            Err(io::Error::new(io::ErrorKind::NotFound, "nope")).at_path(Path::new("/x"));
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("/x"));
        assert!(!msg.contains("offset"));
    }

    #[test]
    fn error_display_missing_precondition() {
        let err = ProbeError::MissingPrecondition("run create first".to_string());
        assert!(err.to_string().contains("Missing precondition"));
        assert!(err.to_string().contains("run create first"));
    }

    #[test]
    fn error_display_invalid_size() {
        assert!(ProbeError::InvalidSize(0).to_string().contains("Invalid size: 0"));
    }

    #[test]
    fn error_display_invalid_band() {
        let err = ProbeError::InvalidDangerBand { low: 0.7, high: 0.2 };
        assert!(err.to_string().contains("0.7..0.2"));
    }

    #[test]
    fn io_source_is_preserved() {
        use std::error::Error as _;

        let err: Result<()> = Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            .at_path(Path::new("/secret"));
        let err = err.unwrap_err();
        let source = err.source().expect("io source");
        assert!(source.to_string().contains("denied"));
    }
}
