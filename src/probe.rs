//! The three phases glued to an on-disk workspace.
//!
//! Each phase is a separate process invocation; a power cut sits between
//! test and verify. Everything verify needs is therefore read back from the
//! [`MetadataStore`], never carried in memory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::baseline::{ensure_space, BaselineGenerator, BaselineMetadata, FsSpaceProbe, SpaceProbe};
use crate::copier::{remove_stale_destination, CopyObserver, CopyOutcome, InstrumentedCopier};
use crate::error::{IoResultExt as _, ProbeError, Result};
use crate::fingerprint::FingerprintEngine;
use crate::pattern::Pattern;
use crate::report::{ReportContext, ReportEmitter};
use crate::store::{MetadataStore, RunRecord, TestId, META_DIR_NAME};
use crate::verdict::{classify, observe, Verdict};

/// Directory holding the baseline file.
pub const SOURCE_DIR_NAME: &str = "source_test";
/// Directory receiving the copy.
pub const DEST_DIR_NAME: &str = "destination_test";
/// Directory receiving reports.
pub const RESULTS_DIR_NAME: &str = "fs_test_results";
/// Directory receiving log files.
pub const LOGS_DIR_NAME: &str = "logs";

/// Free space the create phase would like, as a multiple of the test size.
const RECOMMENDED_SPACE_FACTOR: u64 = 2;

/// Layout of a test directory on the filesystem under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Workspace rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of baseline files.
    #[must_use]
    pub fn source_dir(&self) -> PathBuf {
        self.root.join(SOURCE_DIR_NAME)
    }

    /// Directory of copy destinations.
    #[must_use]
    pub fn dest_dir(&self) -> PathBuf {
        self.root.join(DEST_DIR_NAME)
    }

    /// Directory of reports.
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR_NAME)
    }

    /// Directory of metadata records.
    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR_NAME)
    }

    /// Directory of log files.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR_NAME)
    }

    /// Baseline file for `id`.
    #[must_use]
    pub fn source_file(&self, id: &TestId) -> PathBuf {
        self.source_dir().join(data_file_name(id))
    }

    /// Copy destination for `id`.
    #[must_use]
    pub fn dest_file(&self, id: &TestId) -> PathBuf {
        self.dest_dir().join(data_file_name(id))
    }
}

fn data_file_name(id: &TestId) -> String {
    format!("large_file_{}.dat", id.key())
}

/// Runs the create, test and verify phases in one workspace.
///
/// ```rust,no_run
/// use crashprobe::{Probe, SilentObserver, TestId, Workspace, InstrumentedCopier};
///
/// let probe = Probe::new(Workspace::new("/mnt/usb"));
/// let id = TestId::gigabytes("exfat", 1);
/// probe.create(&id)?;
/// probe.test(&id, &InstrumentedCopier::default(), &mut SilentObserver)?;
/// // ... power is cut, machine restarts ...
/// let verdict = probe.verify(&id)?;
/// println!("{}", verdict.grade);
/// # Ok::<(), crashprobe::ProbeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Probe<S = FsSpaceProbe> {
    workspace: Workspace,
    store: MetadataStore,
    engine: FingerprintEngine,
    pattern: Pattern,
    space: S,
}

impl Probe<FsSpaceProbe> {
    /// Probe with default pattern, 4 MiB hashing chunks and OS space checks.
    #[must_use]
    pub fn new(workspace: Workspace) -> Self {
        Self {
            store: MetadataStore::new(workspace.meta_dir()),
            workspace,
            engine: FingerprintEngine::default(),
            pattern: Pattern::default(),
            space: FsSpaceProbe,
        }
    }
}

impl<S: SpaceProbe + Clone> Probe<S> {
    /// Replace the free-space source.
    #[must_use]
    pub fn with_space_probe<T: SpaceProbe + Clone>(self, space: T) -> Probe<T> {
        Probe {
            workspace: self.workspace,
            store: self.store,
            engine: self.engine,
            pattern: self.pattern,
            space,
        }
    }

    /// Use a different content pattern for new baselines.
    #[must_use]
    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Use a different hashing engine.
    #[must_use]
    pub fn with_engine(mut self, engine: FingerprintEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Workspace layout.
    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Metadata store.
    #[must_use]
    pub const fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Create phase: write the baseline and persist its metadata.
    ///
    /// # Errors
    ///
    /// Anything [`BaselineGenerator::create`] or the store can return.
    pub fn create(&self, id: &TestId) -> Result<BaselineMetadata> {
        let source_dir = self.workspace.source_dir();
        fs::create_dir_all(&source_dir).at_path(&source_dir)?;
        self.warn_if_tight(&source_dir, id.size_bytes());

        let generator = BaselineGenerator::new()
            .with_space_probe(self.space.clone())
            .with_pattern(self.pattern)
            .with_chunk_size(self.engine.chunk_size())?;
        let meta = generator.create(&self.workspace.source_file(id), id.size_bytes())?;
        let record = self.store.save_baseline(id, &meta)?;
        info!(
            key = %id.key(),
            record = %record.display(),
            fingerprint = %meta.fingerprint,
            "baseline ready"
        );
        Ok(meta)
    }

    /// Test phase: check the baseline, commit a run record, then copy.
    ///
    /// # Errors
    ///
    /// - [`ProbeError::MissingPrecondition`] if create has not run or the
    ///   baseline no longer matches its metadata
    /// - [`ProbeError::InsufficientSpace`] if the copy cannot fit
    /// - [`ProbeError::Io`] on any copy failure
    pub fn test<O: CopyObserver + ?Sized>(
        &self,
        id: &TestId,
        copier: &InstrumentedCopier,
        observer: &mut O,
    ) -> Result<CopyOutcome> {
        let baseline = self.store.load_baseline(id).map_err(|e| match e {
            ProbeError::MissingPrecondition(_) => {
                ProbeError::MissingPrecondition("no baseline found; run create first".to_string())
            }
            other => other,
        })?;
        self.check_source(&baseline)?;

        let dest_dir = self.workspace.dest_dir();
        fs::create_dir_all(&dest_dir).at_path(&dest_dir)?;
        let destination = fs::canonicalize(&dest_dir)
            .at_path(&dest_dir)?
            .join(data_file_name(id));
        if remove_stale_destination(&destination)? {
            debug!(path = %destination.display(), "removed destination from earlier run");
        }
        ensure_space(&self.space, &dest_dir, baseline.size_bytes, 0)?;

        let config = copier.config();
        let run = RunRecord {
            destination: destination.clone(),
            started_at: Utc::now(),
            chunk_size: config.chunk_size,
            delay_ms: config
                .inter_chunk_delay
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            band_low: config.danger_band.low(),
            band_high: config.danger_band.high(),
        };
        self.store.save_run(id, &run)?;

        copier.copy(&baseline.path, &destination, observer)
    }

    /// Verify phase: observe both files and classify.
    ///
    /// # Errors
    ///
    /// [`ProbeError::MissingPrecondition`] if create or test has not run,
    /// [`ProbeError::Metadata`] if a record is unreadable.
    pub fn verify(&self, id: &TestId) -> Result<Verdict> {
        let baseline = self.store.load_baseline(id)?;
        let run = self.store.load_run(id)?;
        let observation = observe(&self.engine, &baseline, &run.destination);
        let verdict = classify(&baseline, &observation);
        info!(
            grade = %verdict.grade,
            finding = ?verdict.finding,
            "verification complete"
        );
        Ok(verdict)
    }

    /// Write a report for `verdict` into the results directory.
    ///
    /// # Errors
    ///
    /// Missing or unreadable records, or a failed report write.
    pub fn emit_report(&self, id: &TestId, verdict: &Verdict) -> Result<PathBuf> {
        let baseline = self.store.load_baseline(id)?;
        let run = self.store.load_run(id)?;
        let ctx = ReportContext {
            id,
            filesystem: id.label(),
            baseline: &baseline,
            run: &run,
            generated_at: Utc::now(),
        };
        ReportEmitter::new(self.workspace.results_dir()).emit(&ctx, verdict)
    }

    fn check_source(&self, baseline: &BaselineMetadata) -> Result<()> {
        let stale = |what: &str| {
            ProbeError::MissingPrecondition(format!(
                "baseline {} {what}; run create again",
                baseline.path.display()
            ))
        };
        match self.engine.fingerprint_file(&baseline.path) {
            Ok((fp, size)) if fp == baseline.fingerprint && size == baseline.size_bytes => Ok(()),
            Ok(_) => Err(stale("no longer matches its metadata")),
            Err(ProbeError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Err(stale("is missing"))
            }
            Err(e) => Err(e),
        }
    }

    fn warn_if_tight(&self, dir: &Path, size_bytes: u64) {
        let wanted = size_bytes.saturating_mul(RECOMMENDED_SPACE_FACTOR);
        match self.space.available_bytes(dir) {
            Ok(available) if available < wanted => warn!(
                available,
                recommended = wanted,
                "less free space than recommended for baseline plus copy"
            ),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "free-space query failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::{CopyBuilder, CopyState, DangerBand, SilentObserver};
    use crate::verdict::{Finding, Grade};
    use std::fs::OpenOptions;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy)]
    struct FixedSpace(u64);

    impl SpaceProbe for FixedSpace {
        fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    const SIZE: u64 = 64 * 1024;

    fn setup() -> (TempDir, Probe<FixedSpace>, TestId) {
        let dir = TempDir::new().unwrap();
        let probe = Probe::new(Workspace::new(dir.path())).with_space_probe(FixedSpace(u64::MAX));
        (dir, probe, TestId::new("testfs", SIZE))
    }

    fn fast_copier() -> InstrumentedCopier {
        CopyBuilder::new().chunk_size(4096).no_delay().build().unwrap()
    }

    // ==========================================================================
    // WORKSPACE
    // ==========================================================================

    #[test]
    fn workspace_layout() {
        let ws = Workspace::new("/mnt/t");
        let id = TestId::gigabytes("ext4", 2);
        assert_eq!(ws.source_file(&id), Path::new("/mnt/t/source_test/large_file_ext4-2gb.dat"));
        assert_eq!(ws.dest_file(&id), Path::new("/mnt/t/destination_test/large_file_ext4-2gb.dat"));
        assert_eq!(ws.results_dir(), Path::new("/mnt/t/fs_test_results"));
        assert_eq!(ws.meta_dir(), Path::new("/mnt/t/.crashprobe"));
        assert_eq!(ws.logs_dir(), Path::new("/mnt/t/logs"));
    }

    // ==========================================================================
    // PHASES
    // ==========================================================================

    #[test]
    fn create_persists_metadata() {
        let (_dir, probe, id) = setup();
        let meta = probe.create(&id).unwrap();
        assert_eq!(meta.size_bytes, SIZE);
        assert_eq!(probe.store().load_baseline(&id).unwrap(), meta);
        assert_eq!(fs::metadata(probe.workspace().source_file(&id)).unwrap().len(), SIZE);
    }

    #[test]
    fn test_requires_create() {
        let (_dir, probe, id) = setup();
        let err = probe.test(&id, &fast_copier(), &mut SilentObserver).unwrap_err();
        assert!(matches!(err, ProbeError::MissingPrecondition(ref m) if m.contains("create")));
        assert!(!probe.store().run_path(&id).exists());
    }

    #[test]
    fn test_rejects_modified_baseline() {
        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        let mut f = OpenOptions::new()
            .write(true)
            .open(probe.workspace().source_file(&id))
            .unwrap();
        f.write_all(b"tampered").unwrap();
        drop(f);

        let err = probe.test(&id, &fast_copier(), &mut SilentObserver).unwrap_err();
        assert!(matches!(err, ProbeError::MissingPrecondition(_)));
    }

    #[test]
    fn test_rejects_deleted_baseline() {
        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        fs::remove_file(probe.workspace().source_file(&id)).unwrap();
        let err = probe.test(&id, &fast_copier(), &mut SilentObserver).unwrap_err();
        assert!(matches!(err, ProbeError::MissingPrecondition(ref m) if m.contains("missing")));
    }

    #[test]
    fn test_checks_destination_space() {
        let (dir, probe, id) = setup();
        probe.create(&id).unwrap();
        let tight = Probe::new(Workspace::new(dir.path())).with_space_probe(FixedSpace(SIZE - 1));

        let err = tight.test(&id, &fast_copier(), &mut SilentObserver).unwrap_err();
        assert!(matches!(err, ProbeError::InsufficientSpace { .. }));
        assert!(!tight.store().run_path(&id).exists());
    }

    #[test]
    fn test_records_run_before_copying() {
        struct Peek<'a> {
            store: &'a MetadataStore,
            id: &'a TestId,
            seen: bool,
        }
        impl CopyObserver for Peek<'_> {
            fn on_progress(&mut self, _: &CopyState) {
                if !self.seen {
                    self.seen = self.store.load_run(self.id).is_ok();
                }
            }
            fn on_danger_window(&mut self, _: &CopyState) {}
        }

        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        let copier = CopyBuilder::new()
            .chunk_size(4096)
            .no_delay()
            .danger_band(DangerBand::new(0.25, 0.75).unwrap())
            .build()
            .unwrap();
        let mut peek = Peek {
            store: probe.store(),
            id: &id,
            seen: false,
        };
        probe.test(&id, &copier, &mut peek).unwrap();
        assert!(peek.seen);

        let run = probe.store().load_run(&id).unwrap();
        assert_eq!(run.chunk_size, 4096);
        assert_eq!(run.delay_ms, None);
        assert!((run.band_low - 0.25).abs() < f64::EPSILON);
        assert!(run.destination.is_absolute());
    }

    #[test]
    fn verify_requires_test() {
        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        let err = probe.verify(&id).unwrap_err();
        assert!(matches!(err, ProbeError::MissingPrecondition(ref m) if m.contains("test")));
    }

    #[test]
    fn uninterrupted_cycle_is_excellent_completed() {
        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        let outcome = probe.test(&id, &fast_copier(), &mut SilentObserver).unwrap();
        assert_eq!(outcome.bytes_copied, SIZE);
        assert!(outcome.danger_window_fired);

        let verdict = probe.verify(&id).unwrap();
        assert_eq!(verdict.grade, Grade::Excellent);
        assert_eq!(verdict.finding, Finding::Completed);
    }

    #[test]
    fn rerun_replaces_destination() {
        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        let dest = probe.workspace().dest_file(&id);
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, vec![0u8; (SIZE * 2) as usize]).unwrap();

        probe.test(&id, &fast_copier(), &mut SilentObserver).unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().len(), SIZE);
    }

    #[test]
    fn report_lands_in_results_dir() {
        let (_dir, probe, id) = setup();
        probe.create(&id).unwrap();
        probe.test(&id, &fast_copier(), &mut SilentObserver).unwrap();
        let verdict = probe.verify(&id).unwrap();

        let path = probe.emit_report(&id, &verdict).unwrap();
        assert_eq!(path.parent().unwrap(), probe.workspace().results_dir());
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("Filesystem: testfs"));
        assert!(text.contains("Assessment: EXCELLENT"));
    }
}
