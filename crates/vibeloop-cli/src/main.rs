//! vibeloop CLI - The `vibeloop` command.
//!
//! Hosts the loop engine from a TOML configuration:
//!
//! - `vibeloop run` - start the engine and play until interrupted
//! - `vibeloop check` - validate a configuration and show the pipeline order
//! - `vibeloop init` - write a commented configuration template

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vibeloop_core::{panic_message, CaptureSink, Engine, EngineConfig, ExtensionRegistry, Sink};

/// vibeloop - live-coding loop engine
#[derive(Parser, Debug)]
#[command(name = "vibeloop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drift-free step loop with an extension pipeline, for SuperDirt and MIDI", long_about = None)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the engine and play until interrupted
    Run {
        /// Capture messages instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Interval between metrics summaries
        #[arg(long, value_name = "DURATION", default_value = "10s", value_parser = humantime::parse_duration)]
        report_every: Duration,
    },

    /// Validate the configuration and print the pipeline order
    Check,

    /// Write a configuration template
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
    install_panic_hook();

    let path = match args.config {
        Some(path) => path,
        None => EngineConfig::config_path().context("Failed to determine config path")?,
    };

    match args.command {
        Commands::Run {
            dry_run,
            report_every,
        } => run(&path, dry_run, report_every),
        Commands::Check => check(&path),
        Commands::Init { force } => init(&path, force),
    }
}

/// Log panics as a single line instead of printing a backtrace.
///
/// Extension panics are caught by the pipeline, but the hook still runs on
/// the timing thread first.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));
        log::error!("{}", panic_line(&panic_message(info.payload()), location.as_deref()));
    }));
}

fn panic_line(message: &str, location: Option<&str>) -> String {
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    match location {
        Some(location) => format!("thread '{}' panicked at {}: {}", thread, location, message),
        None => format!("thread '{}' panicked: {}", thread, message),
    }
}

fn load(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        anyhow::bail!(
            "Config file not found at {} (create one with `vibeloop init`)",
            path.display()
        );
    }
    let config = EngineConfig::load_from(path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    Ok(config)
}

fn run(path: &Path, dry_run: bool, report_every: Duration) -> Result<()> {
    let config = load(path)?;
    log::info!("Loaded {}", path.display());

    let registry = ExtensionRegistry::with_builtins();
    let pipeline = config
        .build_pipeline(&registry)
        .context("Failed to build extension pipeline")?;
    let store = config.build_store().context("Failed to build tracks")?;

    let capture = CaptureSink::new();
    let sinks: Vec<Box<dyn Sink>> = if dry_run {
        log::info!("Dry run: messages are captured, nothing is sent");
        vec![Box::new(capture.clone())]
    } else {
        config.build_sinks().context("Failed to open outputs")?
    };

    let engine = Engine::start(config.engine_options(), store, pipeline, sinks)
        .context("Failed to start engine")?;
    let handle = engine.handle().clone();

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("Failed to install SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))
        .context("Failed to install SIGTERM handler")?;

    handle.play().context("Failed to start transport")?;
    log::info!("Playing at {} BPM (Ctrl+C to stop)", config.transport.bpm);

    let mut last_report = Instant::now();
    while !interrupted.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(50));
        if last_report.elapsed() >= report_every {
            last_report = Instant::now();
            report(&handle.snapshot());
            if dry_run {
                log::info!(
                    "Captured {} batches ({} messages)",
                    capture.len(),
                    capture.messages().len()
                );
                capture.clear();
            }
        }
    }

    log::info!("Interrupted, stopping...");
    handle.stop()?;
    let snapshot = handle.snapshot();
    engine.shutdown();
    report(&snapshot);
    Ok(())
}

fn report(snapshot: &vibeloop_core::EngineSnapshot) {
    let metrics = &snapshot.metrics;
    log::info!(
        "step {} | tick p99 {:.1}us | hook p50 {:.1}us p99 {:.1}us | jitter stddev {:.1}us | {} ticks, {} sent, {} failed, {} dropped",
        snapshot.step_index,
        metrics.tick_duration.p99_us,
        metrics.hook_latency.p50_us,
        metrics.hook_latency.p99_us,
        metrics.jitter.stddev_us,
        metrics.counters.ticks,
        metrics.counters.messages_dispatched,
        metrics.counters.dispatch_failures,
        metrics.counters.dropped_batches
    );
    match serde_json::to_string(snapshot) {
        Ok(json) => log::debug!("snapshot: {}", json),
        Err(e) => log::warn!("Failed to serialize snapshot: {}", e),
    }
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    let pipeline = config.build_pipeline(&ExtensionRegistry::with_builtins())?;

    println!("{}: OK", path.display());
    println!(
        "transport: {} BPM, {} steps per beat, stop policy {:?}",
        config.transport.bpm, config.transport.subdivision, config.transport.stop_policy
    );
    println!("pipeline ({} extensions):", pipeline.registrations().len());
    for (index, registration) in pipeline.registrations().iter().enumerate() {
        let mut stages = Vec::new();
        if registration.capabilities.transform {
            stages.push("transform");
        }
        if registration.capabilities.before_send {
            stages.push("before_send");
        }
        println!(
            "  {}. {} (priority {}) [{}]",
            index + 1,
            registration.name,
            registration.priority,
            stages.join(", ")
        );
    }
    println!("tracks: {}, scenes: {}", config.tracks.len(), config.scenes.len());
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    EngineConfig::write_template(path, force)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
