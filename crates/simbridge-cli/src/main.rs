//! `simbridge-cli` – SimBridge command line interface
//!
//! Runs the publishing pipeline against the simulated sources:
//!
//! 1. Loads `~/.simbridge/config.toml` (or `--config <path>`), writing the
//!    default configuration on first run.
//! 2. Connects to rosbridge and starts one capture stream per `[[streams]]`
//!    table.  With `--dry-run` frames go to an in-memory transport instead.
//! 3. On **Ctrl-C** stops the streams, unadvertises every topic and closes
//!    the connection before exiting.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use simbridge_hal::RenderTargetPool;
use simbridge_hal::sim::{SimFrameSource, SimPattern, SimScene};
use simbridge_middleware::transport::memory::MemoryConnector;
use simbridge_middleware::{Connector, EventKind, Lane, PipelineEvent, WsConnector};
use simbridge_runtime::scheduler::StreamKind;
use simbridge_runtime::telemetry;
use simbridge_runtime::{Collaborators, Pipeline, PipelineReport};
use simbridge_types::{ConnectionState, PixelFormat, SystemClock};
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};

use crate::config::Config;

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    dry_run: bool,
    help: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Args::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    let path = args.next().ok_or("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--dry-run" => parsed.dry_run = true,
                "--help" | "-h" => parsed.help = true,
                other => return Err(format!("unknown argument '{other}'")),
            }
        }
        Ok(parsed)
    }
}

fn main() -> ExitCode {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            print_usage();
            return ExitCode::from(2);
        }
    };
    if args.help {
        print_usage();
        return ExitCode::SUCCESS;
    }

    // Before the runtime exists; see `telemetry::init_tracing`.
    let _guard = telemetry::init_tracing("simbridge");
    print_banner();

    let path = args.config.unwrap_or_else(config::config_path);
    let cfg = load_or_init(&path);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_tx.send_replace(true);
    }) {
        warn!(
            error = %e,
            "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available"
        );
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cfg, args.dry_run, shutdown_rx))
}

fn load_or_init(path: &std::path::Path) -> Config {
    match config::load_from(path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save_to(&cfg, path) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

async fn run(cfg: Config, dry_run: bool, mut shutdown: watch::Receiver<bool>) -> ExitCode {
    let pool = Arc::new(match cfg.pool_max_per_key {
        Some(max) => RenderTargetPool::new().with_max_per_key(max),
        None => RenderTargetPool::new(),
    });
    let connector: Arc<dyn Connector> = if dry_run {
        Arc::new(MemoryConnector::new())
    } else {
        Arc::new(WsConnector)
    };
    let collaborators = Collaborators {
        connector,
        frames: Arc::new(sim_frames(&cfg, Arc::clone(&pool))),
        scene: Arc::new(sim_scene(&cfg)),
        pool,
        clock: Arc::new(SystemClock),
    };

    let mut pipeline = match Pipeline::new(cfg.pipeline_config(), collaborators) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            println!("{}: {}", "Invalid stream configuration".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let target = if dry_run { "in-memory transport (dry run)" } else { cfg.endpoint.as_str() };
    println!("\n  Publishing to {}", target.bold());
    for entry in &cfg.streams {
        println!(
            "    • {} → {} @ {} Hz",
            entry.stream.name.bold(),
            entry.stream.topic.cyan(),
            entry.stream.rate_hz
        );
    }
    println!("\n  Press {} to stop.\n", "Ctrl-C".bold().cyan());

    let status =
        tokio::spawn(print_connection_states(pipeline.bus().subscribe_to(Lane::Connection)));
    pipeline.start();
    let _ = shutdown.wait_for(|stop| *stop).await;

    let report = pipeline.shutdown().await;
    status.abort();
    print_report(&report);
    ExitCode::SUCCESS
}

/// Simulated frame source with one stream per capture entry.
fn sim_frames(cfg: &Config, pool: Arc<RenderTargetPool>) -> SimFrameSource {
    cfg.streams
        .iter()
        .fold(SimFrameSource::new(pool), |frames, entry| match entry.stream.kind {
            StreamKind::Camera { .. } => frames.with_stream(
                &entry.stream.name,
                entry.width,
                entry.height,
                PixelFormat::Rgba8,
            ),
            StreamKind::Depth { .. } => frames.with_pattern(
                &entry.stream.name,
                entry.width,
                entry.height,
                PixelFormat::RFloat,
                SimPattern::Sweep,
            ),
            StreamKind::Objects { .. } => frames,
        })
}

fn sim_scene(cfg: &Config) -> SimScene {
    cfg.objects.iter().fold(SimScene::new(), |scene, object| {
        scene.with_moving_object(&object.name, object.position, object.velocity)
    })
}

async fn print_connection_states(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let EventKind::ConnectionState { state, generation } = event.kind {
                    let label = match state {
                        ConnectionState::Open => state.to_string().green().bold(),
                        ConnectionState::Faulted => state.to_string().red().bold(),
                        _ => state.to_string().yellow(),
                    };
                    println!("  connection {} (generation {})", label, generation);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_report(report: &PipelineReport) {
    println!();
    println!("{}", "  Stream summary".bold());
    for stream in &report.streams {
        println!(
            "    • {:<14} ticks {:>6}  sent {:>6}  dropped {:>6}  skipped {:>6}  failed {:>4}",
            stream.name.bold(),
            stream.stats.ticks,
            stream.sent,
            stream.dropped,
            stream.stats.skipped,
            stream.stats.failed
        );
    }
    println!(
        "  Render targets: {} allocated, {} reused",
        report.pool.allocations, report.pool.reuses
    );
    println!("  {} Unadvertised {} topic(s). Bye.", "✓".green().bold(), report.unadvertised);
}

fn print_usage() {
    println!("Usage: simbridge [--config <path>] [--dry-run]");
    println!();
    println!("  -c, --config <path>  Config file (default ~/.simbridge/config.toml)");
    println!("      --dry-run        Publish to an in-memory transport instead of rosbridge");
    println!("  -h, --help           Show this help");
}

fn print_banner() {
    println!();
    println!("{}", r#"   _____ _           ____       _     __"#.bold().cyan());
    println!("{}", r#"  / ___/(_)___ ___  / __ )_____(_)___/ /___ ____"#.bold().cyan());
    println!("{}", r#"  \__ \/ / __ `__ \/ __  / ___/ / __  / __ `/ _ \"#.bold().cyan());
    println!("{}", r#" ___/ / / / / / / / /_/ / /  / / /_/ / /_/ /  __/"#.bold().cyan());
    println!("{}", r#"/____/_/_/ /_/ /_/_____/_/  /_/\__,_/\__, /\___/"#.bold().cyan());
    println!("{}", r#"                                    /____/"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "SimBridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Simulation to rosbridge publisher");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, String> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_config_and_dry_run() {
        let parsed = args(&["--config", "/tmp/sb.toml", "--dry-run"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/sb.toml")));
        assert!(parsed.dry_run);
        assert!(!parsed.help);
        assert_eq!(args(&[]).unwrap(), Args::default());
    }

    #[test]
    fn rejects_unknown_and_incomplete_arguments() {
        assert!(args(&["--verbose"]).is_err());
        assert!(args(&["--config"]).is_err());
    }

    #[tokio::test]
    async fn sim_sources_cover_image_streams() {
        use simbridge_hal::{FrameSource, SceneSource};

        let cfg = Config::default();
        let frames = sim_frames(&cfg, Arc::new(RenderTargetPool::new()));
        let mut ids = frames.stream_ids();
        ids.sort();
        assert_eq!(ids, vec!["front_depth", "front_rgb"]);

        let depth = frames.request_frame("front_depth").await.unwrap();
        assert_eq!(depth.format, PixelFormat::RFloat);
        assert_eq!((depth.width, depth.height), (640, 480));

        let objects = sim_scene(&cfg).sample_objects().await.unwrap();
        assert_eq!(objects[0].name, "Cube");
    }
}
