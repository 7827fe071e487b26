//! Hyscript CLI - runs the scripting host against an in-memory server.
//!
//! Useful for developing scripts without a game server: registrations are
//! recorded, tick systems are driven on a fixed interval, and timers and
//! promise jobs are pumped each tick.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hyscript::{RecordingHost, ScriptHost, ScriptPaths, ScriptingConfig};

#[derive(Parser)]
#[command(name = "hyscript")]
#[command(version, about = "Hot-reloadable ECMAScript scripting host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the data directory's scripts and drive ticks until Ctrl-C
    Run {
        /// Data directory (default: HYSCRIPT_DATA_DIR or the platform data dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
        /// Milliseconds between ticks
        #[arg(long, default_value = "50")]
        tick_ms: u64,
        /// Disable hot reload for this run
        #[arg(long)]
        no_watch: bool,
    },
    /// Evaluate script files in a throwaway runtime and print diagnostics
    Check {
        /// Files to evaluate
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Seed declarations and example scripts into the data directory
    Init {
        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn paths_for(data_dir: Option<PathBuf>) -> ScriptPaths {
    data_dir.map_or_else(ScriptPaths::resolve, ScriptPaths::new)
}

fn run(data_dir: Option<PathBuf>, ticks: Option<u64>, tick_ms: u64, no_watch: bool) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).context("Failed to install Ctrl-C handler")?;

    let recorder = Arc::new(RecordingHost::default());
    let tokio = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("hyscript-deferred")
        .build()
        .context("Failed to start tokio runtime")?;
    let host = ScriptHost::builder(paths_for(data_dir), Arc::clone(&recorder) as Arc<dyn hyscript::ExtensionHost>)
        .tokio_handle(tokio.handle().clone())
        .build()?;
    if no_watch {
        host.config().write().unwrap_or_else(PoisonError::into_inner).is_hot_reload_enabled = false;
    }

    let report = host.setup()?;
    for (level, line) in report.messages() {
        log::log!(level, "{line}");
    }
    log::info!("Commands: {:?}", recorder.command_names());

    let interval = Duration::from_millis(tick_ms.max(1));
    let dt = interval.as_secs_f32();
    let mut tick = 0u64;
    while !shutdown.load(Ordering::SeqCst) && ticks.map_or(true, |limit| tick < limit) {
        host.pump();
        recorder.tick_all(dt);
        tick += 1;
        std::thread::sleep(interval);
    }

    log::info!("Stopping after {tick} tick(s)");
    host.shutdown();
    Ok(())
}

fn check(files: Vec<PathBuf>) -> Result<()> {
    let config = ScriptingConfig {
        is_hot_reload_enabled: false,
        ..ScriptingConfig::default()
    };
    let host = ScriptHost::builder(ScriptPaths::resolve(), Arc::new(RecordingHost::default()))
        .config(config)
        .admin_command(false)
        .build()?;
    let report = host.check(&files)?;
    for (level, line) in report.messages() {
        if level <= log::Level::Warn {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
    if !report.failures.is_empty() {
        bail!("{} file(s) failed", report.failures.len());
    }
    Ok(())
}

fn init(data_dir: Option<PathBuf>) -> Result<()> {
    let paths = paths_for(data_dir);
    let host = ScriptHost::builder(paths.clone(), Arc::new(RecordingHost::default()))
        .admin_command(false)
        .build()?;
    let copied = host.seed()?;
    println!("Seeded {copied} file(s) into {}", paths.root.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            data_dir,
            ticks,
            tick_ms,
            no_watch,
        } => run(data_dir, ticks, tick_ms, no_watch),
        Commands::Check { files } => check(files),
        Commands::Init { data_dir } => init(data_dir),
    }
}
