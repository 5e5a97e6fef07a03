//! Preview configuration and config-file location.
//!
//! `PreviewConfig` is stored as JSON (`preview.json`). Directory priority:
//! 1. CLI `--config-dir`
//! 2. `STREAM_PREVIEW_CONFIG_DIR` environment variable
//! 3. Current folder, if it already holds a config or log file
//! 4. Platform config dir from dirs-next (`~/.config/stream-preview` on Linux)

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::workers::Workers;

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "preview.json";
/// Default log file name (`--log` without a path)
pub const LOG_FILE: &str = "stream-preview.log";
const CONFIG_DIR_ENV: &str = "STREAM_PREVIEW_CONFIG_DIR";
const APP_DIR: &str = "stream-preview";

/// Tunables of the preview pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Decode threads (0 = 75% of cores)
    pub worker_threads: usize,
    /// Liveness poll interval between redraw ticks (None = poll on each tick)
    pub liveness_poll_ms: Option<u64>,
    /// Upper bound for announced redraw rates
    pub max_rate_hz: f32,
    /// Upper bound for announced frame counts
    pub max_frame_count: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            liveness_poll_ms: None,
            max_rate_hz: 240.0,
            max_frame_count: 4096,
        }
    }
}

impl PreviewConfig {
    pub fn liveness_poll(&self) -> Option<Duration> {
        self.liveness_poll_ms.filter(|&ms| ms > 0).map(Duration::from_millis)
    }

    /// Resolved decode thread count
    pub fn decode_threads(&self) -> usize {
        if self.worker_threads == 0 {
            Workers::default_threads()
        } else {
            self.worker_threads
        }
    }

    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

/// Overrides for default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }

        if let Ok(current_dir) = std::env::current_dir()
            && has_local_config_files(&current_dir)
        {
            return current_dir;
        }

        if let Some(dir) = dirs_next::config_dir() {
            return dir.join(APP_DIR);
        }

        PathBuf::from(".")
    }

    /// Path to a file in the config directory
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config_dir().join(name)
    }

    /// Create the config directory if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = self.config_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn has_local_config_files(dir: &Path) -> bool {
    [CONFIG_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}
