//! `posefuse` – pose fusion command line interface
//!
//! This binary runs the fusion engine end to end. It:
//!
//! 1. Resolves the configuration (`--config`, else `~/.posefuse/config.toml`,
//!    else built-in defaults) and applies `POSEFUSE_*` overrides.
//! 2. Builds the [`FusionEngine`] and spawns the [`FusionScheduler`] on the
//!    topic bus.
//! 3. Feeds sensor events from a recorded JSON-lines file (`--replay`) or
//!    from stdin, one serialized `Event` per line.
//! 4. Intercepts **Ctrl-C** to stop the scheduler, which drains queued
//!    readings before reporting its counters.

mod config;
mod replay;

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use posefuse_middleware::{EventBus, TopicReceiver};
use posefuse_runtime::{FusionConfig, FusionEngine, FusionScheduler, FusionStats, init_tracing};
use posefuse_types::EventPayload;

#[derive(Debug, Parser)]
#[command(name = "posefuse", version, about = "Kalman pose fusion for mobile robots")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay a JSON-lines event recording instead of reading stdin.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Replay speed multiplier; 0 replays as fast as possible.
    #[arg(long, default_value_t = 1.0)]
    replay_speed: f64,

    /// Print every fused pose to stdout as JSON.
    #[arg(long)]
    print_poses: bool,

    /// Write the effective configuration to this path and exit.
    #[arg(long)]
    init_config: Option<PathBuf>,
}

fn main() {
    // Hold the guard until exit so pending spans are flushed.
    let _tracing = init_tracing("posefuse");
    let cli = Cli::parse();

    let (cfg, source) = match config::resolve(cli.config.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };

    if let Some(path) = &cli.init_config {
        match config::save_to(&cfg, path) {
            Ok(()) => println!(
                "  {} Config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            ),
            Err(e) => {
                eprintln!("{}: {}", "Error saving config".red(), e);
                std::process::exit(1);
            }
        }
        return;
    }

    print_banner();
    match &source {
        Some(path) => eprintln!("  Config loaded from {}", path.display().to_string().bold()),
        None => eprintln!(
            "  No config at {}; using defaults.",
            config::config_path().display().to_string().dimmed()
        ),
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start Tokio runtime".red(), e);
            std::process::exit(1);
        }
    };

    let outcome = runtime.block_on(run(cli, cfg));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_background();
    match outcome {
        Ok(stats) => print_summary(&stats),
        Err(e) => {
            error!(error = %e, "posefuse stopped");
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, cfg: FusionConfig) -> Result<FusionStats, String> {
    let engine = FusionEngine::from_config(&cfg).map_err(|e| e.to_string())?;
    let events = match &cli.replay {
        Some(path) => Some(replay::read_events(path)?),
        None => None,
    };

    let bus = EventBus::new(cfg.scheduler.queue_capacity);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let ctrlc_tx = stop_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – stopping fusion …".yellow().bold());
        ctrlc_tx.send_replace(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let (printed_tx, printed_rx) = watch::channel(false);
    let printer = cli.print_poses.then(|| {
        let rx = bus.subscribe_to(&cfg.topics.robot_position_output);
        tokio::spawn(print_poses(rx, printed_rx))
    });

    let scheduler = FusionScheduler::new(engine, &bus, &cfg);
    let fusion = tokio::spawn(scheduler.run(stop_rx.clone()));

    let mut interrupted = stop_rx.clone();
    let feed = async {
        match events {
            Some(events) => {
                info!(events = events.len(), speed = cli.replay_speed, "replaying recording");
                replay::replay(&bus, &cfg.topics, events, cli.replay_speed).await
            }
            None => {
                info!("reading events from stdin");
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                replay::feed_lines(&bus, &cfg.topics, stdin).await
            }
        }
    };
    tokio::select! {
        delivered = feed => info!(delivered, "input finished"),
        _ = interrupted.wait_for(|stop| *stop) => {}
    }

    stop_tx.send_replace(true);
    let stats = fusion.await.map_err(|e| format!("fusion task failed: {e}"))?;
    printed_tx.send_replace(true);
    if let Some(printer) = printer
        && let Err(e) = printer.await
    {
        warn!(error = %e, "pose printer task failed");
    }
    Ok(stats)
}

async fn print_poses(mut rx: TopicReceiver, mut stop: watch::Receiver<bool>) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = stop.wait_for(|stop| *stop) => break,
        };
        match event {
            Ok(event) => {
                if let EventPayload::RobotPosition(pose) = event.payload {
                    match serde_json::to_string(&pose) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "failed to encode pose"),
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "pose printer fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    // The scheduler has returned, so whatever is buffered is final.
    while let Ok(event) = rx.try_recv() {
        if let EventPayload::RobotPosition(pose) = event.payload
            && let Ok(line) = serde_json::to_string(&pose)
        {
            println!("{line}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(stats: &FusionStats) {
    eprintln!();
    eprintln!("{}", "  Fusion summary".bold().cyan());
    eprintln!("    accepted          {}", stats.accepted.to_string().green());
    eprintln!("    skipped           {}", stats.total_skipped().to_string().yellow());
    for (reason, count) in &stats.skipped {
        eprintln!("      {:<16}{}", reason, count);
    }
    eprintln!("    dropped (lag)     {}", stats.dropped);
    eprintln!("    resets            {}", stats.resets);
    eprintln!("    idle predictions  {}", stats.idle_predictions);
}

fn print_banner() {
    eprintln!();
    eprintln!("{}", r#"   ___  ____  ________ ______  _____ ____"#.bold().cyan());
    eprintln!("{}", r#"  / _ \/ __ \/ __/ __// __/ / / / __/ __/"#.bold().cyan());
    eprintln!("{}", r#" / ___/ /_/ /\ \/ _/ / _// /_/ /\ \/ _/  "#.bold().cyan());
    eprintln!("{}", r#"/_/   \____/___/___//_/  \____/___/___/  "#.bold().cyan());
    eprintln!();
}
