use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Wire:   24-byte header, big-endian\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Replay a recorded preview event script through the preview tracker
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Replay script (JSON)
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,

    /// Directory for the last drawn frame of each key (PNG)
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Simulated host update rate in Hz
    #[arg(long = "hz", value_name = "HZ", default_value_t = 60.0)]
    pub host_hz: f32,

    /// Pace updates on the wall clock and decode on the worker pool
    #[arg(long = "realtime")]
    pub realtime: bool,

    /// Decode on the replay thread even with --realtime
    #[arg(long = "inline")]
    pub inline_decode: bool,

    /// Decode worker threads (overrides config)
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Liveness poll interval in ms (overrides config)
    #[arg(long = "poll-ms", value_name = "MS")]
    pub poll_ms: Option<u64>,

    /// Write the JSON summary here instead of stdout
    #[arg(short = 's', long = "summary", value_name = "FILE")]
    pub summary: Option<PathBuf>,

    /// Enable debug logging to file (default: stream-preview.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}
