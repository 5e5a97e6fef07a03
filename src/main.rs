use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use stream_preview::cli::Args;
use stream_preview::config::{CONFIG_FILE, LOG_FILE, PathConfig, PreviewConfig};
use stream_preview::core::decode::ImageCrateDecoder;
use stream_preview::replay::{self, HeadlessHost, ReplayOptions, ReplayScript};
use stream_preview::PreviewTracker;

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let config_path = path_config.config_file(CONFIG_FILE);
    info!("Config path: {}", config_path.display());
    let mut config = PreviewConfig::load(&config_path)?;
    if let Some(n) = args.workers {
        config.worker_threads = n;
    }
    if let Some(ms) = args.poll_ms {
        config.liveness_poll_ms = Some(ms);
    }

    // Off the wall clock a background pool would never catch up with the simulated time
    let inline = args.inline_decode || !args.realtime;
    let mut tracker = if inline {
        PreviewTracker::inline(&config, Arc::new(ImageCrateDecoder))
    } else {
        PreviewTracker::new(&config).context("Failed to start decode workers")?
    };
    info!(
        "Decoding {}",
        if inline { "inline".to_string() } else { format!("on {} workers", config.decode_threads()) }
    );

    let script = ReplayScript::load(&args.script)?;
    let base_dir = args.script.parent().unwrap_or(Path::new("."));
    let mut host = HeadlessHost::new(script.targets.clone());

    let options = ReplayOptions {
        host_hz: args.host_hz,
        realtime: args.realtime,
    };
    let summary = replay::run(&script, base_dir, &mut tracker, &mut host, options)?;

    if summary.stats.dropped() > 0 {
        warn!("{} payloads dropped", summary.stats.dropped());
    }

    if let Some(dir) = &args.out_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let written = host.write_last_frames(dir)?;
        info!("Wrote {} frames to {}", written, dir.display());
    }

    let json = serde_json::to_string_pretty(&summary)?;
    match &args.summary {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write summary: {}", path.display()))?;
            info!("Summary written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

/// 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = match log_path_opt {
            Some(p) => p.clone(),
            None => {
                if let Err(e) = path_config.ensure_dirs() {
                    eprintln!("Warning: {}", e);
                }
                path_config.config_file(LOG_FILE)
            }
        };
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level.as_str()))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}
