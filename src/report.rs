//! Plain-text result reports.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::baseline::BaselineMetadata;
use crate::error::{IoResultExt as _, Result};
use crate::store::{sync_dir, RunRecord, TestId};
use crate::verdict::Verdict;

/// Everything a report needs besides the verdict.
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    /// Which test.
    pub id: &'a TestId,
    /// Filesystem label shown to the reader.
    pub filesystem: &'a str,
    /// Baseline the verdict was measured against.
    pub baseline: &'a BaselineMetadata,
    /// Test-phase parameters.
    pub run: &'a RunRecord,
    /// Report timestamp.
    pub generated_at: DateTime<Utc>,
}

/// A verdict laid out as a plain-text report.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    /// Surrounding facts.
    pub ctx: &'a ReportContext<'a>,
    /// The classification being reported.
    pub verdict: &'a Verdict,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = self.ctx;
        let verdict = self.verdict;
        let obs = &verdict.observation;
        let baseline = ctx.baseline;

        writeln!(f, "Filesystem Journaling Test Results")?;
        writeln!(f, "==================================")?;
        writeln!(f, "Date: {}", ctx.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "OS: {} ({})", std::env::consts::OS, std::env::consts::ARCH)?;
        writeln!(f, "Filesystem: {}", ctx.filesystem)?;
        writeln!(f, "Test size: {} bytes ({})", ctx.id.size_bytes(), ctx.id.size_tag())?;
        writeln!(f, "Copy started: {}", ctx.run.started_at.to_rfc3339())?;
        writeln!(f, "Chunk size: {} bytes", ctx.run.chunk_size)?;
        match ctx.run.delay_ms {
            Some(ms) => writeln!(f, "Delay used: {ms} ms")?,
            None => writeln!(f, "Delay used: none")?,
        }
        writeln!(
            f,
            "Danger window: {:.0}%-{:.0}%",
            ctx.run.band_low * 100.0,
            ctx.run.band_high * 100.0
        )?;
        writeln!(f)?;
        writeln!(f, "Baseline: {}", baseline.path.display())?;
        writeln!(
            f,
            "Expected: {} bytes, {} {}",
            baseline.size_bytes, baseline.hash_algorithm, baseline.fingerprint
        )?;
        writeln!(f)?;
        writeln!(f, "Source exists: {}", obs.source.exists())?;
        writeln!(f, "Source intact: {}", obs.source.matches(baseline))?;
        writeln!(f, "Source: {}", obs.source.describe(baseline))?;
        writeln!(f, "Destination exists: {}", obs.destination.exists())?;
        writeln!(f, "Destination intact: {}", obs.destination.matches(baseline))?;
        writeln!(f, "Destination: {}", obs.destination.describe(baseline))?;
        writeln!(f)?;
        writeln!(f, "Assessment: {}", verdict.grade)?;
        writeln!(f, "Description: {}", verdict.description())?;
        writeln!(f)?;
        let journaling = if verdict.grade.is_effective() {
            "effective"
        } else {
            "limited or ineffective"
        };
        writeln!(
            f,
            "Summary: The {} filesystem has {journaling} journaling.",
            ctx.filesystem
        )
    }
}

/// Render the report body.
#[must_use]
pub fn render_report(ctx: &ReportContext<'_>, verdict: &Verdict) -> String {
    Report { ctx, verdict }.to_string()
}

/// Writes reports into a results directory.
#[derive(Debug, Clone)]
pub struct ReportEmitter {
    dir: PathBuf,
}

impl ReportEmitter {
    /// Emitter writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write and sync a new report, never overwriting an older one.
    ///
    /// # Errors
    ///
    /// [`crate::ProbeError::Io`] if the directory or file cannot be written.
    pub fn emit(&self, ctx: &ReportContext<'_>, verdict: &Verdict) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).at_path(&self.dir)?;
        let body = render_report(ctx, verdict);
        let stem = format!(
            "{}_journaling_{}",
            ctx.id.file_label(),
            ctx.generated_at.format("%Y%m%d_%H%M%S")
        );

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.txt")
            } else {
                format!("{stem}-{attempt}.txt")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(body.as_bytes()).at_path(&path)?;
                    file.sync_all().at_path(&path)?;
                    sync_dir(&self.dir).at_path(&self.dir)?;
                    info!(path = %path.display(), grade = %verdict.grade, "report written");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e).at_path(&path),
            }
        }
    }
}
