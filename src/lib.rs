//! # crashprobe
//!
//! Measures what a filesystem's journal actually protects when power is cut
//! in the middle of a large copy.
//!
//! A test runs in three separate invocations with a forced power-off
//! between the second and third:
//!
//! - **create**: write a reproducible baseline file and durably record its
//!   size and BLAKE3 fingerprint
//! - **test**: copy the baseline chunk by chunk, syncing each chunk, and
//!   signal a danger window partway through when the operator cuts power
//! - **verify**: after the restart, fingerprint whatever survived and grade
//!   the outcome EXCELLENT, GOOD, POOR or UNDEFINED
//!
//! ## Example
//!
//! ```rust
//! use crashprobe::{classify, FileObservation, FileState, Grade, VerificationObservation};
//! # use crashprobe::{BaselineMetadata, Fingerprint, METADATA_VERSION};
//! # let baseline = BaselineMetadata {
//! #     version: METADATA_VERSION,
//! #     path: "/mnt/t/source_test/large_file_2gb.dat".into(),
//! #     size_bytes: 1 << 31,
//! #     fingerprint: Fingerprint::compute(b"baseline"),
//! #     hash_algorithm: "BLAKE3".into(),
//! #     pattern_seed: Some(0),
//! #     created_at: chrono::Utc::now(),
//! # };
//!
//! // Source untouched, destination never reached the disk.
//! let observation = VerificationObservation {
//!     source: FileObservation::new(
//!         &baseline.path,
//!         FileState::Present {
//!             size_bytes: baseline.size_bytes,
//!             fingerprint: baseline.fingerprint,
//!         },
//!     ),
//!     destination: FileObservation::new("/mnt/t/destination_test/large_file_2gb.dat", FileState::Missing),
//! };
//! assert_eq!(classify(&baseline, &observation).grade, Grade::Excellent);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod baseline;
mod copier;
mod error;
mod fingerprint;
pub mod logging;
mod pattern;
mod probe;
mod report;
mod store;
mod verdict;

pub use baseline::{
    ensure_space, BaselineGenerator, BaselineMetadata, FsSpaceProbe, SpaceProbe, METADATA_VERSION,
};
pub use copier::{
    remove_stale_destination, CopyBuilder, CopyConfig, CopyObserver, CopyOutcome, CopyState,
    DangerBand, DurableWrite, InstrumentedCopier, SilentObserver, StreamFailure,
    DEFAULT_COPY_CHUNK, DEFAULT_INTER_CHUNK_DELAY,
};
pub use error::{IoResultExt, ProbeError, Result};
pub use fingerprint::{
    Fingerprint, FingerprintEngine, ParseFingerprintError, ReadFailure, DEFAULT_CHUNK_SIZE,
    HASH_ALGORITHM, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use pattern::{Pattern, DEFAULT_SEED};
pub use probe::{
    Probe, Workspace, DEST_DIR_NAME, LOGS_DIR_NAME, RESULTS_DIR_NAME, SOURCE_DIR_NAME,
};
pub use report::{render_report, Report, ReportContext, ReportEmitter};
pub use store::{MetadataStore, RunRecord, TestId, META_DIR_NAME};
pub use verdict::{
    classify, observe, observe_file, FileObservation, FileState, Finding, Grade, Verdict,
    VerificationObservation,
};
