//! Headless replay of a recorded preview event script.
//!
//! Script format (JSON):
//!
//! ```json
//! {
//!   "targets": ["12", "12:7"],
//!   "end_ms": 2000,
//!   "steps": [
//!     { "at_ms": 0,   "event": { "type": "start", "key": "12:7", "frame_count": 4, "rate": 8 } },
//!     { "at_ms": 10,  "event": { "type": "frame", "key": "12:7", "index": 0, "image": "f0.png" } },
//!     { "at_ms": 20,  "event": { "type": "frame", "key": "12:7", "index": 1, "color": [255, 0, 0, 255] } },
//!     { "at_ms": 900, "event": { "type": "remove_target", "key": "12:7" } },
//!     { "at_ms": 1500, "event": { "type": "stopped" } }
//!   ]
//! }
//! ```
//!
//! Frame events are encoded into the binary wire format and pushed through the
//! event bus, so a replay exercises the same path as a live backend.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::decode::{encode_png, PreviewImage};
use crate::core::event_bus::EventBus;
use crate::core::host::{PreviewAffordances, PreviewHost};
use crate::core::preview_events::{CleanupEvent, ExecutionStoppedEvent, FramePayloadEvent, StartPreviewEvent};
use crate::core::session_key::SessionKey;
use crate::core::stats::StatsSnapshot;
use crate::core::tracker::PreviewTracker;
use crate::core::wire::encode_frame_update;

/// Widget descriptor the headless host inserts for a running preview
pub const PREVIEW_WIDGET: &str = "preview";
/// Default solid-colour frame size
const DEFAULT_FRAME_SIZE: (u32, u32) = (8, 8);
/// Message type word written into replayed frame updates
const FRAME_MESSAGE_TYPE: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    /// Keys whose nodes exist at start
    #[serde(default)]
    pub targets: Vec<String>,
    pub steps: Vec<ReplayStep>,
    /// Simulation end (default: last step + 1s)
    #[serde(default)]
    pub end_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayStep {
    pub at_ms: u64,
    pub event: ReplayEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    Start { key: String, frame_count: usize, rate: f32 },
    Frame {
        key: String,
        index: u32,
        /// Image file, relative to the script
        #[serde(default)]
        image: Option<PathBuf>,
        /// Solid colour frame instead of a file
        #[serde(default)]
        color: Option<[u8; 4]>,
    },
    /// Raw wire bytes, passed through untouched
    Raw { bytes: Vec<u8> },
    Cleanup { key: String },
    Stopped,
    AddTarget { key: String },
    RemoveTarget { key: String },
}

impl ReplayScript {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay script: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse replay script: {}", path.display()))
    }

    fn end_ms(&self) -> u64 {
        self.end_ms
            .unwrap_or_else(|| self.steps.iter().map(|s| s.at_ms).max().unwrap_or(0) + 1000)
    }
}

/// Step with frame payloads already encoded
#[derive(Debug)]
enum Action {
    Start(StartPreviewEvent),
    Payload(Vec<u8>),
    Cleanup(String),
    Stopped,
    AddTarget(String),
    RemoveTarget(String),
}

fn prepare(script: &ReplayScript, base_dir: &Path) -> Result<Vec<(u64, Action)>> {
    let mut actions = Vec::with_capacity(script.steps.len());
    for step in &script.steps {
        let action = match &step.event {
            ReplayEvent::Start { key, frame_count, rate } => Action::Start(StartPreviewEvent {
                key: key.clone(),
                frame_count: *frame_count,
                rate: *rate,
            }),
            ReplayEvent::Frame { key, index, image, color } => {
                let payload = match (image, color) {
                    (Some(path), _) => {
                        let path = base_dir.join(path);
                        std::fs::read(&path).with_context(|| format!("Failed to read frame image: {}", path.display()))?
                    }
                    (None, Some(rgba)) => encode_png(DEFAULT_FRAME_SIZE.0, DEFAULT_FRAME_SIZE.1, *rgba),
                    (None, None) => anyhow::bail!("Frame step at {}ms has neither image nor color", step.at_ms),
                };
                let key = SessionKey::parse(key).with_context(|| format!("Bad key in frame step at {}ms", step.at_ms))?;
                let msg = encode_frame_update(FRAME_MESSAGE_TYPE, *index, &key, &payload)
                    .with_context(|| format!("Cannot encode frame step at {}ms", step.at_ms))?;
                Action::Payload(msg)
            }
            ReplayEvent::Raw { bytes } => Action::Payload(bytes.clone()),
            ReplayEvent::Cleanup { key } => Action::Cleanup(key.clone()),
            ReplayEvent::Stopped => Action::Stopped,
            ReplayEvent::AddTarget { key } => Action::AddTarget(key.clone()),
            ReplayEvent::RemoveTarget { key } => Action::RemoveTarget(key.clone()),
        };
        actions.push((step.at_ms, action));
    }
    actions.sort_by_key(|(at, _)| *at);
    Ok(actions)
}

/// Host without a UI: node widget lists are plain vectors.
#[derive(Debug, Default)]
pub struct HeadlessHost {
    live: HashSet<String>,
    widgets: HashMap<String, Vec<String>>,
    affordances: PreviewAffordances<String, String>,
    last_frames: HashMap<String, PreviewImage>,
    draws: BTreeMap<String, usize>,
    removed: Vec<String>,
}

impl HeadlessHost {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut host = Self::default();
        for key in targets {
            host.add_target(key.into());
        }
        host
    }

    pub fn add_target(&mut self, key: String) {
        self.widgets.entry(key.clone()).or_default();
        self.live.insert(key);
    }

    /// Node deleted by the user: no cleanup event follows
    pub fn remove_target(&mut self, key: &str) {
        self.live.remove(key);
        if let Some(mut widgets) = self.widgets.remove(key) {
            self.affordances.remove(&mut widgets, &key.to_string());
        }
    }

    pub fn widgets(&self, key: &str) -> Option<&[String]> {
        self.widgets.get(key).map(Vec::as_slice)
    }

    pub fn draws(&self, key: &str) -> usize {
        self.draws.get(key).copied().unwrap_or(0)
    }

    pub fn last_frame(&self, key: &str) -> Option<&PreviewImage> {
        self.last_frames.get(key)
    }

    /// Save the last drawn frame per key as `<key with ':' → '_'>.png`
    pub fn write_last_frames(&self, dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        for (key, image) in &self.last_frames {
            let path = dir.join(format!("{}.png", key.replace(':', "_")));
            image
                .rgba()
                .save(&path)
                .with_context(|| format!("Failed to write frame: {}", path.display()))?;
        }
        Ok(self.last_frames.len())
    }
}

impl PreviewHost for HeadlessHost {
    type Target = String;

    fn resolve_target(&mut self, key: &SessionKey) -> Option<String> {
        self.live.get(key.as_str()).cloned()
    }

    fn draw_frame(&mut self, target: &String, image: &PreviewImage) {
        if let Some(widgets) = self.widgets.get_mut(target) {
            self.affordances.ensure(widgets, target, PREVIEW_WIDGET.to_string());
        }
        self.last_frames.insert(target.clone(), image.clone());
        *self.draws.entry(target.clone()).or_default() += 1;
    }

    fn remove_render_target(&mut self, target: String) {
        if let Some(widgets) = self.widgets.get_mut(&target) {
            self.affordances.remove(widgets, &target);
        }
        self.last_frames.remove(&target);
        self.removed.push(target);
    }
}

/// Outcome of a replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub stats: StatsSnapshot,
    pub updates: u64,
    pub draws: BTreeMap<String, usize>,
    pub active_at_end: Vec<String>,
    pub expired: Vec<String>,
    pub removed: Vec<String>,
}

/// Replay options
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Simulated host update rate
    pub host_hz: f32,
    /// Sleep between updates so background decodes keep pace
    pub realtime: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self { host_hz: 60.0, realtime: false }
    }
}

/// Drive `tracker` through `script` on a simulated clock.
pub fn run(
    script: &ReplayScript,
    base_dir: &Path,
    tracker: &mut PreviewTracker,
    host: &mut HeadlessHost,
    options: ReplayOptions,
) -> Result<ReplaySummary> {
    if !options.host_hz.is_finite() || options.host_hz <= 0.0 {
        anyhow::bail!("Host update rate must be a positive number, got {}", options.host_hz);
    }
    let actions = prepare(script, base_dir)?;
    let bus = EventBus::new();
    let emitter = bus.emitter();

    let host_hz = options.host_hz.clamp(1.0, 1000.0);
    let step = Duration::from_secs_f64(1.0 / host_hz as f64);
    let end = Duration::from_millis(script.end_ms());
    let t0 = tracker.clock();
    info!("Replaying {} steps over {}ms at {}Hz", actions.len(), end.as_millis(), host_hz);

    let mut pending = actions.into_iter().peekable();
    let mut expired = Vec::new();
    let mut updates = 0u64;
    let mut elapsed = Duration::ZERO;

    loop {
        let now_ms = elapsed.as_millis() as u64;
        while let Some((_, action)) = pending.next_if(|(at, _)| *at <= now_ms) {
            debug!("t={}ms: {:?}", now_ms, action);
            match action {
                Action::Start(e) => emitter.emit(e),
                Action::Payload(bytes) => emitter.emit(FramePayloadEvent::new(bytes)),
                Action::Cleanup(key) => emitter.emit(CleanupEvent { key }),
                Action::Stopped => emitter.emit(ExecutionStoppedEvent),
                Action::AddTarget(key) => host.add_target(key),
                Action::RemoveTarget(key) => host.remove_target(&key),
            }
        }

        for event in bus.poll() {
            tracker.handle_event(&event, host);
        }

        let report = tracker.update(t0 + elapsed, host);
        expired.extend(report.expired.into_iter().map(String::from));
        updates += 1;

        if elapsed >= end {
            break;
        }
        elapsed += step;
        if options.realtime {
            std::thread::sleep(step);
        }
    }

    Ok(ReplaySummary {
        stats: tracker.stats().snapshot(),
        updates,
        draws: host.draws.clone(),
        active_at_end: tracker.active_keys().map(|k| k.to_string()).collect(),
        expired,
        removed: host.removed.clone(),
    })
}
