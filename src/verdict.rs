//! Post-crash observation and classification.
//!
//! [`observe`] looks at the source and destination exactly as they are after
//! the restart, using nothing but the durable [`BaselineMetadata`]. Read
//! failures become part of the observation instead of aborting it, so verify
//! always reaches a verdict. [`classify`] is a pure function from that
//! observation to a [`Verdict`].

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::baseline::BaselineMetadata;
use crate::error::ProbeError;
use crate::fingerprint::{Fingerprint, FingerprintEngine};

/// What was found at one path after the restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    /// No directory entry.
    Missing,
    /// An entry exists but its content could not be fully read.
    Unreadable {
        /// Size from the directory entry, if even that was readable.
        size_bytes: Option<u64>,
        /// Offset the read reached before failing, if it started.
        offset: Option<u64>,
        /// Error text.
        reason: String,
    },
    /// Fully read and fingerprinted.
    Present {
        /// Bytes read.
        size_bytes: u64,
        /// Fingerprint of everything read.
        fingerprint: Fingerprint,
    },
}

/// One file's post-crash state, compared against the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObservation {
    /// Path that was examined.
    pub path: PathBuf,
    /// What was found there.
    pub state: FileState,
}

impl FileObservation {
    /// Observation from parts.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, state: FileState) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }

    /// Whether a directory entry exists.
    #[must_use]
    pub const fn exists(&self) -> bool {
        !matches!(self.state, FileState::Missing)
    }

    /// Observed size, when known.
    #[must_use]
    pub const fn size_bytes(&self) -> Option<u64> {
        match self.state {
            FileState::Missing => None,
            FileState::Unreadable { size_bytes, .. } => size_bytes,
            FileState::Present { size_bytes, .. } => Some(size_bytes),
        }
    }

    /// Observed fingerprint; only a complete read yields one.
    #[must_use]
    pub const fn fingerprint(&self) -> Option<&Fingerprint> {
        match &self.state {
            FileState::Present { fingerprint, .. } => Some(fingerprint),
            _ => None,
        }
    }

    /// Whether the content could not be read.
    #[must_use]
    pub const fn is_unreadable(&self) -> bool {
        matches!(self.state, FileState::Unreadable { .. })
    }

    /// Size and fingerprint both equal the baseline.
    #[must_use]
    pub fn matches(&self, baseline: &BaselineMetadata) -> bool {
        matches!(
            &self.state,
            FileState::Present { size_bytes, fingerprint }
                if *size_bytes == baseline.size_bytes && *fingerprint == baseline.fingerprint
        )
    }

    /// Size is known and differs from the baseline.
    #[must_use]
    pub fn size_differs(&self, baseline: &BaselineMetadata) -> bool {
        self.size_bytes().is_some_and(|s| s != baseline.size_bytes)
    }

    /// One-line description for reports.
    #[must_use]
    pub fn describe(&self, baseline: &BaselineMetadata) -> String {
        match &self.state {
            FileState::Missing => "missing".to_string(),
            FileState::Unreadable {
                size_bytes,
                offset,
                reason,
            } => {
                let size = size_bytes.map_or_else(|| "unknown size".to_string(), |s| format!("{s} bytes"));
                let at = offset.map_or_else(String::new, |o| format!(" at offset {o}"));
                format!("present ({size}) but unreadable{at}: {reason}")
            }
            FileState::Present {
                size_bytes,
                fingerprint,
            } => {
                let verdict = if self.matches(baseline) {
                    "matches baseline"
                } else if *size_bytes != baseline.size_bytes {
                    "size differs from baseline"
                } else {
                    "content differs from baseline"
                };
                format!("{size_bytes} bytes, {} ({verdict})", fingerprint.short())
            }
        }
    }
}

/// Post-crash state of both files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationObservation {
    /// The baseline file the operator trusted to survive.
    pub source: FileObservation,
    /// The copy that was in flight when the power went.
    pub destination: FileObservation,
}

/// Journaling assessment grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Grade {
    /// Clean rollback or clean completion, source intact.
    Excellent,
    /// Source intact, destination incomplete.
    Good,
    /// The source itself lost data.
    Poor,
    /// Evidence is ambiguous; needs a human.
    Undefined,
}

impl Grade {
    /// Upper-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "EXCELLENT",
            Self::Good => "GOOD",
            Self::Poor => "POOR",
            Self::Undefined => "UNDEFINED",
        }
    }

    /// Whether the grade indicates effective journaling.
    #[must_use]
    pub const fn is_effective(self) -> bool {
        matches!(self, Self::Excellent | Self::Good)
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rule produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finding {
    /// Destination never materialised, source intact.
    RolledBack,
    /// Destination complete and identical, source intact.
    Completed,
    /// Source intact, destination partial or corrupt.
    DestinationIncomplete,
    /// Source missing.
    SourceLost,
    /// Source present with the wrong size or content.
    SourceCorrupted,
    /// Some file could not be read; nothing can be concluded.
    Unreadable,
}

impl Finding {
    /// Grade this finding maps to.
    #[must_use]
    pub const fn grade(self) -> Grade {
        match self {
            Self::RolledBack | Self::Completed => Grade::Excellent,
            Self::DestinationIncomplete => Grade::Good,
            Self::SourceLost | Self::SourceCorrupted => Grade::Poor,
            Self::Unreadable => Grade::Undefined,
        }
    }

    /// Human explanation.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::RolledBack => {
                "Journaling worked perfectly! Operation completely rolled back with source intact."
            }
            Self::Completed => {
                "Journaling worked perfectly! Operation completed successfully despite crash."
            }
            Self::DestinationIncomplete => {
                "Journaling worked well! Source preserved, but destination incomplete."
            }
            Self::SourceLost => "Journaling failed! The source file was lost.",
            Self::SourceCorrupted => "Journaling failed! The source file is truncated or corrupted.",
            Self::Unreadable => {
                "Unexpected state: a file exists but could not be read. Review result details."
            }
        }
    }
}

/// Immutable classification of one verify run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Overall grade.
    pub grade: Grade,
    /// Rule that decided it.
    pub finding: Finding,
    /// Evidence.
    pub observation: VerificationObservation,
}

impl Verdict {
    /// Human explanation of the finding.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        self.finding.description()
    }
}

/// Classify a post-crash observation. Rules are tried in order.
///
/// 1. destination missing, source exact: EXCELLENT (rolled back)
/// 2. destination exact, source exact: EXCELLENT (completed)
/// 3. source exact, destination present but not exact: GOOD
/// 4. source missing, wrong size or wrong content: POOR
/// 5. anything else (unreadable evidence): UNDEFINED
#[must_use]
pub fn classify(baseline: &BaselineMetadata, observation: &VerificationObservation) -> Verdict {
    let source = &observation.source;
    let destination = &observation.destination;
    let source_exact = source.matches(baseline);

    let finding = if source_exact && !destination.exists() {
        Finding::RolledBack
    } else if source_exact && destination.matches(baseline) {
        Finding::Completed
    } else if source_exact && !destination.is_unreadable() {
        Finding::DestinationIncomplete
    } else if !source.exists() {
        Finding::SourceLost
    } else if source.size_differs(baseline) || (source.fingerprint().is_some() && !source_exact) {
        Finding::SourceCorrupted
    } else {
        Finding::Unreadable
    };

    Verdict {
        grade: finding.grade(),
        finding,
        observation: observation.clone(),
    }
}

/// Examine one path. Never fails: every problem becomes part of the state.
#[must_use]
pub fn observe_file(engine: &FingerprintEngine, path: &Path) -> FileObservation {
    let size_bytes = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return FileObservation::new(path, FileState::Missing)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat file");
            return FileObservation::new(
                path,
                FileState::Unreadable {
                    size_bytes: None,
                    offset: None,
                    reason: e.to_string(),
                },
            );
        }
    };

    let state = match engine.fingerprint_file(path) {
        Ok((fingerprint, read)) => FileState::Present {
            size_bytes: read,
            fingerprint,
        },
        // Vanished between stat and open.
        Err(ProbeError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            FileState::Missing
        }
        Err(ProbeError::Io { offset, source, .. }) => {
            warn!(path = %path.display(), error = %source, ?offset, "cannot read file");
            FileState::Unreadable {
                size_bytes: Some(size_bytes),
                offset,
                reason: source.to_string(),
            }
        }
        Err(other) => FileState::Unreadable {
            size_bytes: Some(size_bytes),
            offset: None,
            reason: other.to_string(),
        },
    };
    FileObservation::new(path, state)
}

/// Observe source and destination.
#[must_use]
pub fn observe(
    engine: &FingerprintEngine,
    baseline: &BaselineMetadata,
    destination: &Path,
) -> VerificationObservation {
    info!(path = %baseline.path.display(), "checking source integrity");
    let source = observe_file(engine, &baseline.path);
    info!(path = %destination.display(), "checking destination integrity");
    let destination = observe_file(engine, destination);
    VerificationObservation {
        source,
        destination,
    }
}
