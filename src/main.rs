use clap::{Args, Parser, Subcommand};
use fuse_supervisor::config::HarnessConfig;
use fuse_supervisor::memcheck::MemoryCheckReport;
use fuse_supervisor::report::{LifecycleReport, ReportFile, RunReport};
use fuse_supervisor::runner;
use fuse_supervisor::supervisor::ProcessSupervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Drive a FUSE filesystem through supervised mount/unmount cycles and
/// classify how each run ended.
#[derive(Parser, Debug)]
#[command(name = "fuse-supervisor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file path
    #[arg(short, long, default_value = "harness.toml", global = true)]
    config: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (service output lines, state transitions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only errors and the final summary
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount, unmount and verify, one fresh supervisor per cycle
    Cycle(CycleArgs),
    /// Check whether the service binary was built with FUSE support
    Probe,
    /// Parse a memory-checker log and report its error summary
    CheckLog {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CycleArgs {
    /// Device or image file handed to the service
    device: PathBuf,

    /// Mount path
    mountpoint: PathBuf,

    /// Number of lifecycles to run
    #[arg(long, default_value_t = 1)]
    cycles: u32,

    /// How long to keep the filesystem mounted before unmounting
    #[arg(long, value_name = "MS", default_value_t = 0)]
    hold_ms: u64,

    /// Readiness timeout in seconds (overrides config)
    #[arg(long)]
    ready_timeout: Option<u64>,

    /// Teardown timeout in seconds (overrides config)
    #[arg(long)]
    stop_timeout: Option<u64>,

    /// Write a JSON lifecycle report here
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    config.apply_env();

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("# config: {}", cli.config.display());
                print!("{rendered}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render configuration");
                return ExitCode::FAILURE;
            }
        }
    }

    match cli.command {
        Command::Cycle(args) => run_cycles(config, args).await,
        Command::Probe => probe(&config).await,
        Command::CheckLog { file } => check_log(&file),
    }
}

async fn run_cycles(mut config: HarnessConfig, args: CycleArgs) -> ExitCode {
    if let Some(secs) = args.ready_timeout {
        config.readiness.timeout_secs = secs;
    }
    if let Some(secs) = args.stop_timeout {
        config.shutdown.timeout_secs = secs;
    }
    let ready_timeout = Duration::from_secs(config.readiness.timeout_secs);
    let stop_timeout = Duration::from_secs(config.shutdown.timeout_secs);
    let hold = Duration::from_millis(args.hold_ms);

    let run_started = chrono::Utc::now();
    let mut cycles = Vec::new();

    for cycle in 1..=args.cycles {
        tracing::info!(cycle, total = args.cycles, "starting lifecycle");

        let mut sup = match ProcessSupervisor::new(&config, &args.device, &args.mountpoint) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "invalid supervisor configuration");
                return ExitCode::FAILURE;
            }
        };

        let error = match sup.mount(ready_timeout).await {
            Ok(()) => {
                if !hold.is_zero() {
                    tokio::time::sleep(hold).await;
                }
                sup.stop(stop_timeout).await.err().map(|e| e.to_string())
            }
            Err(e) => Some(e.to_string()),
        };

        let report = LifecycleReport::from_supervisor(cycle, &sup, error);
        match report.error {
            None => tracing::info!(cycle, duration_ms = ?report.duration_ms, "lifecycle passed"),
            Some(ref e) => tracing::error!(cycle, error = %e, "lifecycle failed"),
        }
        cycles.push(report);
    }

    let run = RunReport::new(run_started, cycles);
    let failed = run.cycles.iter().filter(|c| !c.passed).count();

    if let Some(path) = args.report {
        if let Err(e) = ReportFile::new(path).write(&run) {
            tracing::error!(error = %e, "failed to write lifecycle report");
            return ExitCode::FAILURE;
        }
    }

    println!(
        "{} of {} cycles passed",
        run.cycles.len() - failed,
        run.cycles.len()
    );
    if run.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn probe(config: &HarnessConfig) -> ExitCode {
    match runner::probe_fuse_support(&config.service).await {
        Ok(true) => {
            println!("{}: fuse support present", config.service.command);
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("{}: built without fuse support", config.service.command);
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "probe failed");
            ExitCode::FAILURE
        }
    }
}

fn check_log(file: &std::path::Path) -> ExitCode {
    let log = match std::fs::read_to_string(file) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(path = %file.display(), error = %e, "failed to read log");
            return ExitCode::FAILURE;
        }
    };
    match MemoryCheckReport::parse(&log).and_then(MemoryCheckReport::check) {
        Ok(report) => {
            println!("clean: 0 errors from {} contexts", report.context_count);
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{e}");
            ExitCode::FAILURE
        }
    }
}
