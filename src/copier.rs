//! Instrumented chunked copy with a danger window.
//!
//! Each chunk is written and then pushed toward stable storage before the
//! next one is read, so the bytes on disk never run far ahead of what the
//! filesystem has been asked to commit. Once cumulative progress first lands
//! inside the configured [`DangerBand`], the observer's
//! [`CopyObserver::on_danger_window`] hook runs exactly once; that is when
//! the operator cuts the power.
//!
//! Nothing held here survives a crash, and nothing here is needed to
//! classify one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{IoResultExt as _, ProbeError, Result};
use crate::fingerprint::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Default copy chunk (1 MiB).
pub const DEFAULT_COPY_CHUNK: usize = 1024 * 1024;

/// Default pause between chunks, giving a human time to react.
pub const DEFAULT_INTER_CHUNK_DELAY: Duration = Duration::from_millis(200);

/// Closed range of progress fractions in which the power should be cut.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DangerBand {
    low: f64,
    high: f64,
}

impl DangerBand {
    /// Band `[low, high]`.
    ///
    /// # Errors
    ///
    /// [`ProbeError::InvalidDangerBand`] unless `0 <= low <= high <= 1`.
    pub fn new(low: f64, high: f64) -> Result<Self> {
        let ordered = low.is_finite() && high.is_finite() && 0.0 <= low && low <= high && high <= 1.0;
        if !ordered {
            return Err(ProbeError::InvalidDangerBand { low, high });
        }
        Ok(Self { low, high })
    }

    /// Lower edge.
    #[must_use]
    pub const fn low(&self) -> f64 {
        self.low
    }

    /// Upper edge.
    #[must_use]
    pub const fn high(&self) -> f64 {
        self.high
    }

    /// Whether `fraction` lies inside the band, edges included.
    #[must_use]
    pub fn contains(&self, fraction: f64) -> bool {
        (self.low..=self.high).contains(&fraction)
    }
}

impl Default for DangerBand {
    fn default() -> Self {
        Self {
            low: 0.40,
            high: 0.60,
        }
    }
}

/// Configuration for an instrumented copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyConfig {
    /// Bytes per read/write/sync cycle.
    pub chunk_size: usize,
    /// Pause after each durable chunk; `None` copies at full speed.
    pub inter_chunk_delay: Option<Duration>,
    /// Progress band that opens the danger window.
    pub danger_band: DangerBand,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_COPY_CHUNK,
            inter_chunk_delay: Some(DEFAULT_INTER_CHUNK_DELAY),
            danger_band: DangerBand::default(),
        }
    }
}

/// Builder for [`InstrumentedCopier`].
///
/// # Example
///
/// ```rust
/// use crashprobe::{CopyBuilder, DangerBand};
///
/// let copier = CopyBuilder::new()
///     .chunk_size(64 * 1024)
///     .no_delay()
///     .danger_band(DangerBand::new(0.3, 0.7).unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(copier.config().chunk_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CopyBuilder {
    config: CopyConfig,
}

impl CopyBuilder {
    /// Builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the pause between chunks.
    #[must_use]
    pub fn inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.config.inter_chunk_delay = Some(delay);
        self
    }

    /// Copy at full speed.
    #[must_use]
    pub fn no_delay(mut self) -> Self {
        self.config.inter_chunk_delay = None;
        self
    }

    /// Set the danger band.
    #[must_use]
    pub fn danger_band(mut self, band: DangerBand) -> Self {
        self.config.danger_band = band;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`ProbeError::InvalidChunkSize`] outside 4 KiB - 16 MiB.
    pub fn build(self) -> Result<InstrumentedCopier> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.config.chunk_size) {
            return Err(ProbeError::InvalidChunkSize(self.config.chunk_size));
        }
        Ok(InstrumentedCopier {
            config: self.config,
        })
    }
}

/// Live progress of one copy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyState {
    /// Bytes written and synced so far.
    pub bytes_copied: u64,
    /// Bytes the copy will write in total.
    pub total_bytes: u64,
    /// Whether the danger window has already opened.
    pub danger_window_fired: bool,
}

impl CopyState {
    const fn new(total_bytes: u64) -> Self {
        Self {
            bytes_copied: 0,
            total_bytes,
            danger_window_fired: false,
        }
    }

    /// `bytes_copied / total_bytes`; an empty copy counts as complete.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_copied as f64 / self.total_bytes as f64
        }
    }
}

/// Receives progress notifications from the copy loop.
pub trait CopyObserver {
    /// Called after every chunk has been written and synced.
    fn on_progress(&mut self, _state: &CopyState) {}

    /// Called once, the first time progress lands inside the danger band.
    ///
    /// The copy loop blocks until this returns.
    fn on_danger_window(&mut self, state: &CopyState);
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl CopyObserver for SilentObserver {
    fn on_danger_window(&mut self, _state: &CopyState) {}
}

/// A writer that can push what it has written toward stable storage.
pub trait DurableWrite: Write {
    /// Flush buffers and ask the device to commit the written data.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the sync fails.
    fn sync(&mut self) -> io::Result<()>;
}

impl DurableWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

impl<W: DurableWrite + ?Sized> DurableWrite for &mut W {
    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}

/// Summary of a copy that ran to completion.
///
/// An interrupted copy never produces one: the process is simply gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Bytes written; equals `total_bytes`.
    pub bytes_copied: u64,
    /// Size of the source.
    pub total_bytes: u64,
    /// Number of write+sync cycles.
    pub chunks: u64,
    /// Whether the danger window opened during the run.
    pub danger_window_fired: bool,
    /// Wall-clock duration of the copy loop.
    pub elapsed: Duration,
}

/// Chunked copier with per-chunk sync and a one-shot danger window.
#[derive(Debug, Clone)]
pub struct InstrumentedCopier {
    config: CopyConfig,
}

impl InstrumentedCopier {
    /// Copier with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CopyConfig::default(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CopyConfig {
        &self.config
    }

    /// Copy `source` to `destination`, truncating any existing destination.
    ///
    /// # Errors
    ///
    /// [`ProbeError::Io`] with path and offset if the source cannot be read
    /// or the destination cannot be written or synced.
    pub fn copy<O: CopyObserver + ?Sized>(
        &self,
        source: &Path,
        destination: &Path,
        observer: &mut O,
    ) -> Result<CopyOutcome> {
        let reader = File::open(source).at_path(source)?;
        let total_bytes = reader.metadata().at_path(source)?.len();

        let mut writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .at_path(destination)?;
        if let Some(dir) = destination.parent().filter(|d| !d.as_os_str().is_empty()) {
            crate::store::sync_dir(dir).at_path(dir)?;
        }

        info!(
            source = %source.display(),
            destination = %destination.display(),
            total_bytes,
            chunk_size = self.config.chunk_size,
            "starting instrumented copy"
        );

        self.copy_stream(reader, &mut writer, total_bytes, observer)
            .map_err(|failure| failure.into_probe_error(source, destination))
    }

    /// Copy `total_bytes` from `reader` into `writer`.
    ///
    /// A source that ends early completes with fewer bytes; progress then
    /// never reaches 1.0.
    ///
    /// # Errors
    ///
    /// [`StreamFailure`] naming which side failed and at what offset.
    pub fn copy_stream<R, W, O>(
        &self,
        mut reader: R,
        mut writer: W,
        total_bytes: u64,
        observer: &mut O,
    ) -> std::result::Result<CopyOutcome, StreamFailure>
    where
        R: Read,
        W: DurableWrite,
        O: CopyObserver + ?Sized,
    {
        warn_if_band_skippable(&self.config, total_bytes);

        let started = Instant::now();
        let mut state = CopyState::new(total_bytes);
        let mut buffer = vec![0u8; self.config.chunk_size];
        let mut chunks = 0u64;

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(StreamFailure::Read {
                        offset: state.bytes_copied,
                        source,
                    })
                }
            };

            let offset = state.bytes_copied;
            writer
                .write_all(&buffer[..n])
                .and_then(|()| writer.sync())
                .map_err(|source| StreamFailure::Write { offset, source })?;

            state.bytes_copied += n as u64;
            chunks += 1;
            debug!(bytes_copied = state.bytes_copied, total_bytes, "chunk synced");

            observer.on_progress(&state);
            if !state.danger_window_fired && self.config.danger_band.contains(state.fraction()) {
                state.danger_window_fired = true;
                info!(
                    bytes_copied = state.bytes_copied,
                    fraction = state.fraction(),
                    "danger window open"
                );
                observer.on_danger_window(&state);
            }

            if let Some(delay) = self.config.inter_chunk_delay {
                thread::sleep(delay);
            }
        }

        let outcome = CopyOutcome {
            bytes_copied: state.bytes_copied,
            total_bytes,
            chunks,
            danger_window_fired: state.danger_window_fired,
            elapsed: started.elapsed(),
        };
        info!(
            bytes_copied = outcome.bytes_copied,
            chunks,
            danger_window_fired = outcome.danger_window_fired,
            elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            "copy completed"
        );
        Ok(outcome)
    }
}

impl Default for InstrumentedCopier {
    fn default() -> Self {
        Self::new()
    }
}

/// Controlled failure of a stream copy.
#[derive(Debug, thiserror::Error)]
pub enum StreamFailure {
    /// The source could not be read.
    #[error("read failed at offset {offset}: {source}")]
    Read {
        /// Bytes copied before the failure
        offset: u64,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The destination could not be written or synced.
    #[error("write failed at offset {offset}: {source}")]
    Write {
        /// Offset of the chunk that failed
        offset: u64,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl StreamFailure {
    fn into_probe_error(self, source_path: &Path, destination: &Path) -> ProbeError {
        match self {
            Self::Read { offset, source } => ProbeError::Io {
                path: source_path.to_path_buf(),
                offset: Some(offset),
                source,
            },
            Self::Write { offset, source } => ProbeError::Io {
                path: destination.to_path_buf(),
                offset: Some(offset),
                source,
            },
        }
    }
}

/// Log when one chunk spans more than the whole band, since progress can
/// then step over it without ever landing inside.
#[allow(clippy::cast_precision_loss)]
fn warn_if_band_skippable(config: &CopyConfig, total_bytes: u64) {
    if total_bytes == 0 {
        return;
    }
    let step = config.chunk_size as f64 / total_bytes as f64;
    let width = config.danger_band.high() - config.danger_band.low();
    if step > width {
        warn!(
            chunk_fraction = step,
            band_width = width,
            "chunk size exceeds danger band width; the window may not open"
        );
    }
}

/// Remove a stale destination left by an earlier run.
///
/// # Errors
///
/// [`ProbeError::Io`] if it exists and cannot be removed.
pub fn remove_stale_destination(destination: &Path) -> Result<bool> {
    match fs::remove_file(destination) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).at_path(destination),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    /// In-memory durable writer that counts syncs and can fail on demand.
    #[derive(Default)]
    struct MemSink {
        data: Vec<u8>,
        syncs: usize,
        fail_after: Option<usize>,
        interrupt_next: bool,
    }

    impl Write for MemSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.interrupt_next {
                self.interrupt_next = false;
                return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
            }
            if let Some(limit) = self.fail_after {
                if self.data.len() + buf.len() > limit {
                    return Err(io::Error::new(io::ErrorKind::Other, "device full"));
                }
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl DurableWrite for MemSink {
        fn sync(&mut self) -> io::Result<()> {
            self.syncs += 1;
            // Interrupt the first write of the following chunk.
            self.interrupt_next = self.syncs == 1;
            Ok(())
        }
    }

    /// Records every notification.
    #[derive(Default)]
    struct Recorder {
        progress: Vec<CopyState>,
        windows: Vec<CopyState>,
    }

    impl CopyObserver for Recorder {
        fn on_progress(&mut self, state: &CopyState) {
            self.progress.push(*state);
        }

        fn on_danger_window(&mut self, state: &CopyState) {
            self.windows.push(*state);
        }
    }

    fn fast_copier(chunk: usize) -> InstrumentedCopier {
        CopyBuilder::new().chunk_size(chunk).no_delay().build().unwrap()
    }

    // ==========================================================================
    // DANGER BAND
    // ==========================================================================

    #[test]
    fn band_default_is_forty_to_sixty() {
        let band = DangerBand::default();
        assert!((band.low() - 0.40).abs() < f64::EPSILON);
        assert!((band.high() - 0.60).abs() < f64::EPSILON);
    }

    #[test]
    fn band_contains_edges() {
        let band = DangerBand::default();
        assert!(band.contains(0.40));
        assert!(band.contains(0.60));
        assert!(band.contains(0.5));
        assert!(!band.contains(0.39));
        assert!(!band.contains(0.61));
    }

    #[test]
    fn band_rejects_invalid() {
        assert!(DangerBand::new(0.6, 0.4).is_err());
        assert!(DangerBand::new(-0.1, 0.4).is_err());
        assert!(DangerBand::new(0.1, 1.1).is_err());
        assert!(DangerBand::new(f64::NAN, 0.5).is_err());
        assert!(DangerBand::new(0.5, 0.5).is_ok());
    }

    // ==========================================================================
    // BUILDER
    // ==========================================================================

    #[test]
    fn builder_defaults() {
        let copier = CopyBuilder::new().build().unwrap();
        assert_eq!(copier.config(), &CopyConfig::default());
        assert_eq!(copier.config().chunk_size, DEFAULT_COPY_CHUNK);
        assert_eq!(
            copier.config().inter_chunk_delay,
            Some(DEFAULT_INTER_CHUNK_DELAY)
        );
    }

    #[test]
    fn builder_no_delay() {
        let copier = CopyBuilder::new().no_delay().build().unwrap();
        assert_eq!(copier.config().inter_chunk_delay, None);
    }

    #[test]
    fn builder_rejects_bad_chunk() {
        assert!(matches!(
            CopyBuilder::new().chunk_size(100).build(),
            Err(ProbeError::InvalidChunkSize(100))
        ));
    }

    // ==========================================================================
    // COPY STATE
    // ==========================================================================

    #[test]
    fn fraction_of_empty_copy_is_one() {
        assert!((CopyState::new(0).fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fraction_halfway() {
        let state = CopyState {
            bytes_copied: 50,
            total_bytes: 100,
            danger_window_fired: false,
        };
        assert!((state.fraction() - 0.5).abs() < f64::EPSILON);
    }

    // ==========================================================================
    // STREAM COPY
    // ==========================================================================

    #[test]
    fn copies_all_bytes_and_syncs_every_chunk() {
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let mut sink = MemSink::default();
        let mut recorder = Recorder::default();

        let outcome = fast_copier(4096)
            .copy_stream(Cursor::new(&data), &mut sink, data.len() as u64, &mut recorder)
            .unwrap();

        assert_eq!(sink.data, data);
        assert_eq!(outcome.bytes_copied, data.len() as u64);
        assert_eq!(outcome.chunks, 10);
        assert_eq!(sink.syncs, 10);
        assert_eq!(recorder.progress.len(), 10);
    }

    #[test]
    fn progress_is_monotonic_from_zero_to_total() {
        let data = vec![5u8; 100 * 4096];
        let mut recorder = Recorder::default();

        fast_copier(4096)
            .copy_stream(
                Cursor::new(&data),
                &mut MemSink::default(),
                data.len() as u64,
                &mut recorder,
            )
            .unwrap();

        let mut last = 0u64;
        let mut last_fraction = 0.0;
        for state in &recorder.progress {
            assert!(state.bytes_copied > last);
            assert!(state.fraction() >= last_fraction);
            last = state.bytes_copied;
            last_fraction = state.fraction();
        }
        assert_eq!(last, data.len() as u64);
    }

    #[test]
    fn danger_window_fires_once_inside_band() {
        let data = vec![1u8; 100 * 4096];
        let mut recorder = Recorder::default();

        let outcome = fast_copier(4096)
            .copy_stream(
                Cursor::new(&data),
                &mut MemSink::default(),
                data.len() as u64,
                &mut recorder,
            )
            .unwrap();

        assert!(outcome.danger_window_fired);
        assert_eq!(recorder.windows.len(), 1);
        let window = recorder.windows[0];
        assert!(DangerBand::default().contains(window.fraction()));
        assert!(window.danger_window_fired);
        // First chunk at or past 40%: 40 of 100 chunks.
        assert_eq!(window.bytes_copied, 40 * 4096);
        assert!(recorder
            .progress
            .iter()
            .filter(|s| s.bytes_copied < window.bytes_copied)
            .all(|s| !s.danger_window_fired));
    }

    #[test]
    fn danger_window_not_fired_when_band_is_stepped_over() {
        // Two chunks land at 0.5 and 1.0, both outside 0.6-0.9.
        let data = vec![1u8; 2 * 4096];
        let mut recorder = Recorder::default();
        let copier = CopyBuilder::new()
            .chunk_size(4096)
            .no_delay()
            .danger_band(DangerBand::new(0.6, 0.9).unwrap())
            .build()
            .unwrap();

        let outcome = copier
            .copy_stream(
                Cursor::new(&data),
                &mut MemSink::default(),
                data.len() as u64,
                &mut recorder,
            )
            .unwrap();

        assert!(!outcome.danger_window_fired);
        assert!(recorder.windows.is_empty());
    }

    #[test]
    fn interrupted_write_is_retried_without_double_counting() {
        let data = vec![9u8; 10 * 4096];
        let mut sink = MemSink::default();
        let mut recorder = Recorder::default();

        let outcome = fast_copier(4096)
            .copy_stream(Cursor::new(&data), &mut sink, data.len() as u64, &mut recorder)
            .unwrap();

        assert_eq!(sink.data, data);
        assert_eq!(outcome.bytes_copied, data.len() as u64);
        assert_eq!(recorder.windows.len(), 1);
    }

    #[test]
    fn write_failure_reports_offset() {
        let data = vec![2u8; 5 * 4096];
        let mut sink = MemSink {
            fail_after: Some(3 * 4096),
            ..MemSink::default()
        };

        let err = fast_copier(4096)
            .copy_stream(
                Cursor::new(&data),
                &mut sink,
                data.len() as u64,
                &mut SilentObserver,
            )
            .unwrap_err();

        assert!(matches!(err, StreamFailure::Write { offset, .. } if offset == 3 * 4096));
    }

    // ==========================================================================
    // FILE COPY
    // ==========================================================================

    #[test]
    fn copy_file_to_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.dat");
        let dst = dir.path().join("dst.dat");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&src, &data).unwrap();

        let outcome = fast_copier(4096)
            .copy(&src, &dst, &mut SilentObserver)
            .unwrap();

        assert_eq!(fs::read(&dst).unwrap(), data);
        assert_eq!(outcome.total_bytes, 50_000);
    }

    #[test]
    fn copy_truncates_existing_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.dat");
        let dst = dir.path().join("dst.dat");
        fs::write(&src, b"short").unwrap();
        fs::write(&dst, vec![0u8; 10_000]).unwrap();

        fast_copier(4096).copy(&src, &dst, &mut SilentObserver).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"short");
    }

    #[test]
    fn copy_missing_source_is_io_error_on_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("missing.dat");
        let err = fast_copier(4096)
            .copy(&src, &dir.path().join("dst"), &mut SilentObserver)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Io { ref path, .. } if path == &src));
    }

    #[test]
    fn remove_stale_destination_reports_presence() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.dat");
        assert!(!remove_stale_destination(&dst).unwrap());
        fs::write(&dst, b"old").unwrap();
        assert!(remove_stale_destination(&dst).unwrap());
        assert!(!dst.exists());
    }
}
