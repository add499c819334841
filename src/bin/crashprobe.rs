//! crashprobe CLI - filesystem crash-consistency tester.

use std::io::{self, BufRead as _, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};

use crashprobe::logging::{self, LogConfig};
use crashprobe::{
    CopyBuilder, CopyObserver, CopyState, DangerBand, Grade, Probe, SpaceProbe, TestId, Verdict,
    Workspace,
};

/// crashprobe - measure how a filesystem survives a power cut mid-copy
#[derive(Parser)]
#[command(name = "crashprobe")]
#[command(version)]
#[command(about = "Filesystem journaling test: create, test (cut power), verify")]
#[command(long_about = None)]
struct Cli {
    /// Show debug output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write logs to <dir>/logs
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Filesystem label, e.g. NTFS, ext4, exFAT
    #[arg(long = "type", value_name = "FS")]
    fs_type: String,

    /// Test file size in GiB
    #[arg(long, default_value = "2", value_parser = clap::value_parser!(u32).range(1..))]
    size: u32,

    /// Test directory on the filesystem under test
    #[arg(long, env = "CRASHPROBE_DIR", default_value = ".")]
    dir: PathBuf,
}

impl Target {
    fn id(&self) -> TestId {
        TestId::gigabytes(self.fs_type.clone(), self.size)
    }

    fn workspace(&self) -> Workspace {
        Workspace::new(self.dir.clone())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the baseline file and record its fingerprint
    Create {
        #[command(flatten)]
        target: Target,
    },

    /// Copy the baseline and prompt for a forced power-off mid-copy
    Test {
        #[command(flatten)]
        target: Target,

        /// Copy chunk size in MiB (1-16)
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..=16))]
        chunk_mib: u32,

        /// Pause after each chunk, in milliseconds
        #[arg(long, default_value = "200", conflicts_with = "no_delay")]
        delay_ms: u64,

        /// Copy at full speed
        #[arg(long)]
        no_delay: bool,

        /// Start of the power-off window, as a fraction of the file
        #[arg(long, default_value = "0.4")]
        band_low: f64,

        /// End of the power-off window, as a fraction of the file
        #[arg(long, default_value = "0.6")]
        band_high: f64,

        /// Seconds the copy pauses once the window opens
        #[arg(long, default_value = "30")]
        grace_secs: u64,

        /// Do not wait for Enter before starting
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect both files after the restart and grade the filesystem
    Verify {
        #[command(flatten)]
        target: Target,
    },
}

impl Commands {
    fn target(&self) -> &Target {
        match self {
            Self::Create { target } | Self::Test { target, .. } | Self::Verify { target } => target,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig {
        verbosity: cli.verbose,
        log_dir: cli
            .log_file
            .then(|| cli.command.target().workspace().logs_dir()),
    };
    match logging::init(&log_config) {
        Ok(()) => {
            if let Some(dir) = &log_config.log_dir {
                eprintln!("Logging to {}", logging::current_log_path(dir).display());
            }
        }
        Err(e) => eprintln!("Warning: logging unavailable: {e:#}"),
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Create { target } => run_create(&target),
        Commands::Test {
            target,
            chunk_mib,
            delay_ms,
            no_delay,
            band_low,
            band_high,
            grace_secs,
            yes,
        } => {
            let mut builder = CopyBuilder::new()
                .chunk_size(chunk_mib as usize * 1024 * 1024)
                .danger_band(DangerBand::new(band_low, band_high)?);
            builder = if no_delay {
                builder.no_delay()
            } else {
                builder.inter_chunk_delay(Duration::from_millis(delay_ms))
            };
            run_test(&target, builder, Duration::from_secs(grace_secs), yes)
        }
        Commands::Verify { target } => run_verify(&target),
    }
}

fn run_create(target: &Target) -> Result<()> {
    let id = target.id();
    let probe = Probe::new(target.workspace());
    println!(
        "Creating {} GiB baseline in {}",
        target.size,
        probe.workspace().source_dir().display()
    );

    let meta = probe.create(&id)?;
    println!("Baseline: {}", meta.path.display());
    println!("{}: {}", meta.hash_algorithm, meta.fingerprint);
    println!();
    println!("Next step:");
    println!(
        "  crashprobe test --type {} --size {} --dir {}",
        target.fs_type,
        target.size,
        target.dir.display()
    );
    Ok(())
}

fn run_test(target: &Target, builder: CopyBuilder, grace: Duration, yes: bool) -> Result<()> {
    let id = target.id();
    let probe = Probe::new(target.workspace());
    let copier = builder.build()?;
    let config = copier.config();

    println!("{}", "=".repeat(60));
    println!("{:=^60}", " JOURNALING TEST ");
    println!("{}", "=".repeat(60));
    println!();
    println!(
        "When the copy reaches {:.0}%-{:.0}% you will be asked to cut power.",
        config.danger_band.low() * 100.0,
        config.danger_band.high() * 100.0
    );
    println!("Hold the power button or pull the cable. Do NOT shut down normally.");
    match config.inter_chunk_delay {
        Some(d) => println!("Copy slowed by {} ms per chunk.", d.as_millis()),
        None => println!("Copy runs at full speed; the window will be short."),
    }
    println!();

    if !yes {
        print!("Press Enter when ready to start...");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read confirmation")?;
    }

    let mut observer = ConsoleObserver { grace };
    let outcome = probe.test(&id, &copier, &mut observer)?;

    println!();
    println!();
    println!("File copy completed ({} bytes).", outcome.bytes_copied);
    if !outcome.danger_window_fired {
        println!("Warning: the power-off window never opened; use a smaller --chunk-mib.");
    }
    println!("If you cut power during the window, reboot and run:");
    println!(
        "  crashprobe verify --type {} --size {} --dir {}",
        target.fs_type,
        target.size,
        target.dir.display()
    );
    Ok(())
}

fn run_verify(target: &Target) -> Result<()> {
    let probe = Probe::new(target.workspace());
    let path = verify_and_report(&probe, &target.id())?;
    println!("\nReport saved to {}", path.display());
    Ok(())
}

/// Print the verdict, then persist it; a failed write is an error.
fn verify_and_report<S: SpaceProbe + Clone>(probe: &Probe<S>, id: &TestId) -> Result<PathBuf> {
    let verdict = probe.verify(id)?;
    print_verdict(&verdict);
    probe
        .emit_report(id, &verdict)
        .context("verdict computed but report could not be written")
}

fn print_verdict(verdict: &Verdict) {
    let obs = &verdict.observation;
    println!("{}", "=".repeat(60));
    println!("Source exists:      {}", obs.source.exists());
    println!("Destination exists: {}", obs.destination.exists());
    println!("{}", "=".repeat(60));
    println!("Assessment: {}", verdict.grade);
    println!("{}", verdict.description());
    match verdict.grade {
        Grade::Excellent | Grade::Good => println!("This filesystem has effective journaling."),
        Grade::Poor => println!("This filesystem has limited or ineffective journaling."),
        Grade::Undefined => println!("Inspect the files manually before drawing conclusions."),
    }
}

/// Progress line plus the power-off prompt.
struct ConsoleObserver {
    grace: Duration,
}

impl CopyObserver for ConsoleObserver {
    fn on_progress(&mut self, state: &CopyState) {
        print!("\rProgress: {:5.1}%", state.fraction() * 100.0);
        let _ = io::stdout().flush();
    }

    fn on_danger_window(&mut self, _state: &CopyState) {
        println!();
        println!("{}", "=".repeat(60));
        println!("{:=^60}", " CRASH POINT REACHED! ");
        println!("{}", "=".repeat(60));
        println!();
        println!("   CUT POWER NOW!");
        println!("   Hold the power button until the machine turns off");
        println!("   or disconnect the power cable.");
        println!();

        let secs = self.grace.as_secs();
        for remaining in (1..=secs).rev() {
            print!("\r   CUT POWER NOW! {remaining:>3} seconds remaining...");
            let _ = io::stdout().flush();
            thread::sleep(Duration::from_secs(1));
        }
        if secs > 0 {
            println!();
            println!();
            println!("Window passed. Copy continuing...");
        }
    }
}
