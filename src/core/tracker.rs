//! Streaming preview tracker: per-key frame buffers and redraw timers.
//!
//! **Architecture**: the tracker does NOT own the host. Calls that need host
//! state (`update`, `end_session`, `handle_event`) receive `&mut impl PreviewHost`.
//! The tracker is an owned registry: construct it when the preview subsystem
//! starts, drop it at shutdown (dropping it joins the decode workers).
//!
//! # Timing Model
//!
//! Each session has a repeating timer with a fixed interval (`1 / rate`).
//! `update(now)` is called by the host loop (typically 60Hz) and fires at most
//! one tick per session per call; a stalled host does not cause a burst of
//! catch-up ticks. The first tick fires one interval after the session starts.
//!
//! # Tick
//!
//! 1. Resolve the render target. Gone → session is dropped (no explicit stop
//!    event ever arrives for deleted or reparented nodes).
//! 2. Draw the frame under the cursor if it has arrived; missing frames are
//!    skipped, never waited for.
//! 3. Advance the cursor modulo frame count, unconditionally.
//!
//! # Decode Flow
//!
//! ```text
//! ingest ──reserve(v)──▶ worker: decode ──channel──▶ pump_decoded ──commit(v)──▶ buffer
//! ```
//!
//! Commits happen on the owner thread only, so a tick never sees a half-applied
//! update. `end_all()` bumps the epoch: queued jobs and undelivered results
//! from before it are discarded.

use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PreviewConfig;

use super::decode::{ImageCrateDecoder, ImageDecoder, PreviewImage};
use super::event_bus::{downcast_event, BoxedEvent};
use super::frame_buffer::{CommitOutcome, FrameBuffer};
use super::host::PreviewHost;
use super::preview_events::{CleanupEvent, ExecutionStoppedEvent, FramePayloadEvent, StartPreviewEvent};
use super::session_key::SessionKey;
use super::stats::PreviewStats;
use super::wire::decode_frame_update;
use super::workers::{InlinePool, WorkerPool, Workers};

/// Slowest accepted redraw rate (one frame per 100s)
pub const MIN_RATE_HZ: f32 = 0.01;

/// Identifies one started timer. A restarted session gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Rejected session starts
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    ZeroFrames,
    TooManyFrames { requested: usize, max: usize },
    InvalidRate(f32),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ZeroFrames => write!(f, "Frame count must be positive"),
            SessionError::TooManyFrames { requested, max } => {
                write!(f, "Frame count {} exceeds limit {}", requested, max)
            }
            SessionError::InvalidRate(r) => write!(f, "Invalid redraw rate: {}", r),
        }
    }
}

impl std::error::Error for SessionError {}

/// What happened to an ingested payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Decode scheduled
    Scheduled,
    /// No buffer for the key (session not started yet, or already ended)
    Untracked,
    OutOfRange,
    Malformed,
}

/// Timer state of one session
#[derive(Debug, Clone)]
pub struct AnimationHandle {
    timer_id: TimerId,
    cursor: usize,
    rate_hz: f32,
    interval: Duration,
    next_tick: Instant,
    next_poll: Option<Instant>,
}

impl AnimationHandle {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn rate_hz(&self) -> f32 {
        self.rate_hz
    }
}

/// Buffer and handle live and die together
#[derive(Debug)]
struct Session {
    buffer: FrameBuffer,
    handle: AnimationHandle,
}

/// Decoded frame on its way back to the owner thread
struct DecodedFrame {
    buffer: FrameBuffer,
    index: usize,
    version: u64,
    epoch: u64,
    image: PreviewImage,
}

/// Result of one `update()` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub committed: usize,
    pub ticks: usize,
    pub draws: usize,
    /// Sessions dropped because their target stopped resolving
    pub expired: Vec<SessionKey>,
}

pub struct PreviewTracker {
    sessions: IndexMap<SessionKey, Session>,
    decoder: Arc<dyn ImageDecoder>,
    pool: Arc<dyn WorkerPool>,
    epoch: Arc<AtomicU64>,
    decoded_tx: Sender<DecodedFrame>,
    decoded_rx: Receiver<DecodedFrame>,
    stats: Arc<PreviewStats>,
    liveness_poll: Option<Duration>,
    max_rate_hz: f32,
    max_frame_count: usize,
    next_timer_id: u64,
    clock: Instant,
}

impl fmt::Debug for PreviewTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewTracker")
            .field("sessions", &self.sessions.len())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("liveness_poll", &self.liveness_poll)
            .finish()
    }
}

impl PreviewTracker {
    /// Tracker with a background decode pool and the `image` crate decoder
    pub fn new(config: &PreviewConfig) -> std::io::Result<Self> {
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = Workers::new(config.decode_threads(), Arc::clone(&epoch))?;
        info!("Preview tracker started ({} decode threads)", workers.num_threads());
        Ok(Self::from_parts(config, Arc::new(ImageCrateDecoder), Arc::new(workers), epoch))
    }

    /// Tracker that decodes synchronously on the calling thread
    pub fn inline(config: &PreviewConfig, decoder: Arc<dyn ImageDecoder>) -> Self {
        let epoch = Arc::new(AtomicU64::new(0));
        let pool = Arc::new(InlinePool::new(Arc::clone(&epoch)));
        Self::from_parts(config, decoder, pool, epoch)
    }

    /// `epoch` must be the same counter `pool` checks its jobs against
    pub fn from_parts(
        config: &PreviewConfig,
        decoder: Arc<dyn ImageDecoder>,
        pool: Arc<dyn WorkerPool>,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        let (decoded_tx, decoded_rx) = crossbeam_channel::unbounded();
        Self {
            sessions: IndexMap::new(),
            decoder,
            pool,
            epoch,
            decoded_tx,
            decoded_rx,
            stats: Arc::new(PreviewStats::new()),
            liveness_poll: config.liveness_poll(),
            max_rate_hz: config.max_rate_hz.max(MIN_RATE_HZ),
            max_frame_count: config.max_frame_count.max(1),
            next_timer_id: 0,
            clock: Instant::now(),
        }
    }

    // ========== Session lifecycle ==========

    /// Start (or restart) the preview for exactly `key`.
    ///
    /// Allocates a fresh buffer of `frame_count` unset slots and replaces any
    /// running timer for `key`.
    pub fn begin_session(&mut self, key: &SessionKey, frame_count: usize, rate_hz: f32) -> Result<TimerId, SessionError> {
        let rate_hz = self.validate(frame_count, rate_hz)?;
        Ok(self.install(key.clone(), FrameBuffer::new(frame_count), rate_hz))
    }

    /// Start the preview for `key` and every enclosing prefix, all sharing one buffer.
    pub fn ingest_hierarchical_start(&mut self, key: &SessionKey, frame_count: usize, rate_hz: f32) -> Result<FrameBuffer, SessionError> {
        let rate_hz = self.validate(frame_count, rate_hz)?;
        let buffer = FrameBuffer::new(frame_count);
        for prefix in key.prefixes() {
            self.install(prefix, buffer.clone(), rate_hz);
        }
        Ok(buffer)
    }

    /// Stop the preview for `key` and remove it from the host. Idempotent.
    pub fn end_session<H: PreviewHost>(&mut self, key: &SessionKey, host: &mut H) -> bool {
        if self.sessions.shift_remove(key).is_none() {
            return false;
        }
        if let Some(target) = host.resolve_target(key) {
            host.remove_render_target(target);
        }
        debug!("Preview session {} ended", key);
        true
    }

    /// Drop every session. In-flight decodes are invalidated.
    pub fn end_all(&mut self) {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let dropped = self.sessions.len();
        self.sessions.clear();
        // Results already queued belong to the old epoch
        for _ in self.decoded_rx.try_iter() {
            self.stats.record_stale_decode();
        }
        if dropped > 0 {
            debug!("All preview sessions ended ({} dropped, epoch {})", dropped, epoch);
        }
    }

    /// Checked rate for a start announcement; refusals are counted
    fn validate(&self, frame_count: usize, rate_hz: f32) -> Result<f32, SessionError> {
        self.check_start(frame_count, rate_hz).inspect_err(|e| {
            self.stats.record_rejected_start();
            debug!("Preview start refused: {}", e);
        })
    }

    fn check_start(&self, frame_count: usize, rate_hz: f32) -> Result<f32, SessionError> {
        if frame_count == 0 {
            return Err(SessionError::ZeroFrames);
        }
        if frame_count > self.max_frame_count {
            return Err(SessionError::TooManyFrames {
                requested: frame_count,
                max: self.max_frame_count,
            });
        }
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(SessionError::InvalidRate(rate_hz));
        }
        let clamped = rate_hz.clamp(MIN_RATE_HZ, self.max_rate_hz);
        if clamped != rate_hz {
            warn!("Redraw rate {} clamped to {}", rate_hz, clamped);
        }
        Ok(clamped)
    }

    fn install(&mut self, key: SessionKey, buffer: FrameBuffer, rate_hz: f32) -> TimerId {
        self.next_timer_id += 1;
        let timer_id = TimerId(self.next_timer_id);
        let interval = Duration::from_secs_f32(1.0 / rate_hz);
        let handle = AnimationHandle {
            timer_id,
            cursor: 0,
            rate_hz,
            interval,
            next_tick: self.clock + interval,
            next_poll: self.liveness_poll.map(|p| self.clock + p),
        };

        let frames = buffer.len();
        if let Some(prev) = self.sessions.insert(key.clone(), Session { buffer, handle }) {
            trace!("Preview {}: timer {:?} replaced by {:?}", key, prev.handle.timer_id, timer_id);
        }
        debug!("Preview session {} started: {} frames @ {} fps", key, frames, rate_hz);
        timer_id
    }

    // ========== Frame ingest ==========

    /// Parse a binary frame update and ingest it. Malformed messages are dropped.
    pub fn ingest_message(&mut self, bytes: &[u8]) -> IngestOutcome {
        // Nothing tracked: skip even the header parse
        if self.sessions.is_empty() {
            self.stats.record_payload();
            self.stats.record_untracked();
            return IngestOutcome::Untracked;
        }
        match decode_frame_update(bytes) {
            Ok(update) => self.ingest_frame_payload(&update.key, update.frame_index as usize, update.payload),
            Err(e) => {
                self.stats.record_payload();
                self.stats.record_malformed();
                debug!("Dropped malformed frame update: {}", e);
                IngestOutcome::Malformed
            }
        }
    }

    /// Decode `bytes` in the background and store it at `frame_index` of `key`'s buffer.
    pub fn ingest_frame_payload(&mut self, key: &SessionKey, frame_index: usize, bytes: Vec<u8>) -> IngestOutcome {
        self.stats.record_payload();

        let Some(session) = self.sessions.get(key) else {
            self.stats.record_untracked();
            trace!("Dropped frame {} for untracked key {}", frame_index, key);
            return IngestOutcome::Untracked;
        };
        let Some(version) = session.buffer.reserve(frame_index) else {
            self.stats.record_out_of_range();
            debug!("Dropped frame {} for {}: buffer has {} slots", frame_index, key, session.buffer.len());
            return IngestOutcome::OutOfRange;
        };

        let epoch = self.epoch.load(Ordering::Relaxed);
        let buffer = session.buffer.clone();
        let decoder = Arc::clone(&self.decoder);
        let stats = Arc::clone(&self.stats);
        let tx = self.decoded_tx.clone();
        let key = key.clone();

        self.pool.execute_with_epoch(epoch, Box::new(move || {
            stats.record_decode();
            match decoder.decode(&bytes) {
                Ok(image) => {
                    let _ = tx.send(DecodedFrame { buffer, index: frame_index, version, epoch, image });
                }
                Err(e) => {
                    stats.record_decode_failure();
                    debug!("Decode failed for {} frame {}: {}", key, frame_index, e);
                }
            }
        }));
        IngestOutcome::Scheduled
    }

    /// Commit finished decodes. Returns how many frames were stored.
    pub fn pump_decoded(&mut self) -> usize {
        let epoch = self.epoch.load(Ordering::Relaxed);
        let mut committed = 0;
        for done in self.decoded_rx.try_iter() {
            if done.epoch != epoch {
                self.stats.record_stale_decode();
                continue;
            }
            match done.buffer.commit(done.index, done.version, done.image) {
                CommitOutcome::Stored => {
                    self.stats.record_commit();
                    committed += 1;
                }
                CommitOutcome::Stale => {
                    self.stats.record_stale_decode();
                    trace!("Discarded stale decode for slot {} (v{})", done.index, done.version);
                }
                CommitOutcome::OutOfRange => self.stats.record_out_of_range(),
            }
        }
        committed
    }

    // ========== Timers ==========

    /// Commit decodes, then fire due ticks and liveness polls.
    pub fn update<H: PreviewHost>(&mut self, now: Instant, host: &mut H) -> UpdateReport {
        if now > self.clock {
            self.clock = now;
        }
        let mut report = UpdateReport {
            committed: self.pump_decoded(),
            ..Default::default()
        };
        if self.sessions.is_empty() {
            return report;
        }

        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            let Some(session) = self.sessions.get_mut(&key) else {
                continue;
            };

            let tick_due = now >= session.handle.next_tick;
            let poll_due = session.handle.next_poll.is_some_and(|at| now >= at);
            if !tick_due && !poll_due {
                continue;
            }

            let target = host.resolve_target(&key);
            if let Some(poll) = self.liveness_poll {
                session.handle.next_poll = Some(now + poll);
            }
            let Some(target) = target else {
                // Node deleted or reparented: nobody will send a cleanup for it
                self.sessions.shift_remove(&key);
                self.stats.record_stale_target();
                debug!("Preview {} target gone, session dropped", key);
                report.expired.push(key);
                continue;
            };

            if !tick_due {
                continue;
            }

            let handle = &mut session.handle;
            handle.next_tick += handle.interval;
            if handle.next_tick <= now {
                // Host stalled: resync instead of bursting
                handle.next_tick = now + handle.interval;
            }

            self.stats.record_tick();
            report.ticks += 1;
            if let Some(image) = session.buffer.get(handle.cursor) {
                host.draw_frame(&target, &image);
                self.stats.record_draw();
                report.draws += 1;
            }
            handle.cursor = (handle.cursor + 1) % session.buffer.len();
        }
        report
    }

    // ========== Events ==========

    /// Dispatch a polled bus event. Returns false for unrelated event types.
    pub fn handle_event<H: PreviewHost>(&mut self, event: &BoxedEvent, host: &mut H) -> bool {
        if let Some(e) = downcast_event::<StartPreviewEvent>(event) {
            match SessionKey::parse(&e.key) {
                Ok(key) => {
                    if let Err(err) = self.ingest_hierarchical_start(&key, e.frame_count, e.rate) {
                        warn!("Ignoring preview start for {}: {}", key, err);
                    }
                }
                Err(err) => warn!("Ignoring preview start: {}", err),
            }
            return true;
        }
        if let Some(e) = downcast_event::<FramePayloadEvent>(event) {
            self.ingest_message(&e.bytes);
            return true;
        }
        if let Some(e) = downcast_event::<CleanupEvent>(event) {
            match SessionKey::parse(&e.key) {
                Ok(key) => {
                    self.end_session(&key, host);
                }
                Err(err) => warn!("Ignoring preview cleanup: {}", err),
            }
            return true;
        }
        if downcast_event::<ExecutionStoppedEvent>(event).is_some() {
            self.end_all();
            return true;
        }
        false
    }

    // ========== Queries ==========

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Active keys in start order
    pub fn active_keys(&self) -> impl Iterator<Item = &SessionKey> {
        self.sessions.keys()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of running timers (one per session)
    pub fn timer_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn buffer(&self, key: &SessionKey) -> Option<&FrameBuffer> {
        self.sessions.get(key).map(|s| &s.buffer)
    }

    pub fn handle(&self, key: &SessionKey) -> Option<&AnimationHandle> {
        self.sessions.get(key).map(|s| &s.handle)
    }

    pub fn cursor(&self, key: &SessionKey) -> Option<usize> {
        self.handle(key).map(|h| h.cursor)
    }

    pub fn stats(&self) -> &PreviewStats {
        &self.stats
    }

    /// Latest time seen by `update` (new timers are scheduled from here)
    pub fn clock(&self) -> Instant {
        self.clock
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decode::{encode_png, DecodeError};
    use crate::core::event_bus::EventBus;
    use crate::core::wire::encode_frame_update;
    use image::RgbaImage;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Host that records every call
    #[derive(Default)]
    struct RecordingHost {
        live: HashSet<String>,
        resolves: Vec<String>,
        draws: Vec<(String, PreviewImage)>,
        removed: Vec<String>,
    }

    impl RecordingHost {
        fn with(keys: &[&str]) -> Self {
            Self {
                live: keys.iter().map(|k| k.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    impl PreviewHost for RecordingHost {
        type Target = String;

        fn resolve_target(&mut self, key: &SessionKey) -> Option<String> {
            self.resolves.push(key.to_string());
            self.live.get(key.as_str()).cloned()
        }

        fn draw_frame(&mut self, target: &String, image: &PreviewImage) {
            self.draws.push((target.clone(), image.clone()));
        }

        fn remove_render_target(&mut self, target: String) {
            self.removed.push(target);
        }
    }

    /// Decoder that counts calls and returns a 1x1 image tagged with the first byte
    #[derive(Default)]
    struct CountingDecoder {
        calls: AtomicUsize,
    }

    impl ImageDecoder for CountingDecoder {
        fn decode(&self, bytes: &[u8]) -> Result<PreviewImage, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match bytes.first() {
                Some(&0xEE) | None => Err(DecodeError::Empty),
                Some(&v) => Ok(PreviewImage::new(RgbaImage::from_pixel(1, 1, image::Rgba([v, 0, 0, 255])))),
            }
        }
    }

    /// Pool that parks jobs until released, to reorder decode completions
    #[derive(Default)]
    struct ParkedPool {
        jobs: Mutex<Vec<(u64, Box<dyn FnOnce() + Send>)>>,
    }

    impl ParkedPool {
        fn run(&self, idx: usize) {
            let (_, job) = self.jobs.lock().unwrap().remove(idx);
            job();
        }
    }

    impl WorkerPool for ParkedPool {
        fn execute_with_epoch(&self, epoch: u64, f: Box<dyn FnOnce() + Send>) {
            self.jobs.lock().unwrap().push((epoch, f));
        }
    }

    fn key(s: &str) -> SessionKey {
        SessionKey::parse(s).unwrap()
    }

    fn tracker() -> (PreviewTracker, Arc<CountingDecoder>) {
        let decoder = Arc::new(CountingDecoder::default());
        let tracker = PreviewTracker::inline(&PreviewConfig::default(), decoder.clone());
        (tracker, decoder)
    }

    /// Advance by one full interval of `rate` and update
    fn step(tracker: &mut PreviewTracker, host: &mut RecordingHost, rate: f32) -> UpdateReport {
        let now = tracker.clock() + Duration::from_secs_f32(1.0 / rate);
        tracker.update(now, host)
    }

    fn pixel(img: &PreviewImage) -> u8 {
        img.rgba().get_pixel(0, 0).0[0]
    }

    #[test]
    fn test_begin_allocates_unset_slots() {
        let (mut t, _) = tracker();
        t.begin_session(&key("x"), 6, 10.0).unwrap();
        let buf = t.buffer(&key("x")).unwrap();
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.filled(), 0);
        assert_eq!(t.cursor(&key("x")), Some(0));
        assert!(t.is_active(&key("x")));
    }

    #[test]
    fn test_begin_rejects_bad_arguments() {
        let (mut t, _) = tracker();
        assert_eq!(t.begin_session(&key("x"), 0, 10.0), Err(SessionError::ZeroFrames));
        assert_eq!(t.begin_session(&key("x"), 2, 0.0), Err(SessionError::InvalidRate(0.0)));
        assert!(matches!(t.begin_session(&key("x"), 2, f32::NAN), Err(SessionError::InvalidRate(_))));
        assert!(matches!(
            t.begin_session(&key("x"), 1_000_000, 10.0),
            Err(SessionError::TooManyFrames { .. })
        ));
        assert_eq!(t.session_count(), 0);
        assert_eq!(t.stats().rejected_starts(), 4);

        // Hierarchical starts are counted once, not per prefix
        assert!(t.ingest_hierarchical_start(&key("a:b"), 0, 10.0).is_err());
        assert_eq!(t.stats().rejected_starts(), 5);
    }

    #[test]
    fn test_rate_clamped_to_max() {
        let (mut t, _) = tracker();
        t.begin_session(&key("x"), 2, 10_000.0).unwrap();
        assert_eq!(t.handle(&key("x")).unwrap().rate_hz(), 240.0);
    }

    #[test]
    fn test_hierarchical_start_shares_buffer() {
        let (mut t, _) = tracker();
        let shared = t.ingest_hierarchical_start(&key("a:b:c"), 3, 5.0).unwrap();

        let keys: Vec<&str> = t.active_keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "a:b", "a:b:c"]);
        for k in ["a", "a:b", "a:b:c"] {
            assert!(t.buffer(&key(k)).unwrap().ptr_eq(&shared));
        }
        // Independent timers per prefix
        let ids: HashSet<TimerId> = ["a", "a:b", "a:b:c"]
            .iter()
            .map(|k| t.handle(&key(k)).unwrap().timer_id())
            .collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_payload_via_leaf_visible_at_every_prefix() {
        let (mut t, _) = tracker();
        t.ingest_hierarchical_start(&key("1:2"), 2, 5.0).unwrap();
        assert_eq!(t.ingest_frame_payload(&key("1:2"), 1, vec![42]), IngestOutcome::Scheduled);
        t.pump_decoded();
        assert_eq!(pixel(&t.buffer(&key("1")).unwrap().get(1).unwrap()), 42);
    }

    #[test]
    fn test_untracked_payload_dropped() {
        let (mut t, decoder) = tracker();
        assert_eq!(t.ingest_frame_payload(&key("nope"), 0, vec![1]), IngestOutcome::Untracked);

        t.begin_session(&key("x"), 2, 5.0).unwrap();
        assert_eq!(t.ingest_frame_payload(&key("y"), 0, vec![1]), IngestOutcome::Untracked);

        assert!(t.buffer(&key("nope")).is_none());
        assert!(t.buffer(&key("y")).is_none());
        assert_eq!(t.stats().dropped_untracked(), 2);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_out_of_range_payload_dropped() {
        let (mut t, decoder) = tracker();
        t.begin_session(&key("x"), 2, 5.0).unwrap();
        assert_eq!(t.ingest_frame_payload(&key("x"), 2, vec![1]), IngestOutcome::OutOfRange);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_keeps_single_timer() {
        let (mut t, _) = tracker();
        let first = t.begin_session(&key("x"), 3, 10.0).unwrap();
        let second = t.begin_session(&key("x"), 5, 10.0).unwrap();

        assert_ne!(first, second);
        assert_eq!(t.timer_count(), 1);
        assert_eq!(t.handle(&key("x")).unwrap().timer_id(), second);
        assert_eq!(t.buffer(&key("x")).unwrap().len(), 5);

        // Only one tick per interval: no leaked duplicate timer
        let mut host = RecordingHost::with(&["x"]);
        let report = step(&mut t, &mut host, 10.0);
        assert_eq!(report.ticks, 1);
        assert_eq!(host.resolves.len(), 1);
    }

    #[test]
    fn test_cursor_wraps() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 3, 10.0).unwrap();

        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(t.cursor(&key("x")).unwrap());
            step(&mut t, &mut host, 10.0);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_no_tick_before_interval() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 3, 10.0).unwrap();

        let report = t.update(t.clock() + Duration::from_millis(50), &mut host);
        assert_eq!(report.ticks, 0);
        assert!(host.resolves.is_empty());
        assert_eq!(t.cursor(&key("x")), Some(0));
    }

    #[test]
    fn test_stalled_host_does_not_burst() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 8, 10.0).unwrap();

        let report = t.update(t.clock() + Duration::from_secs(2), &mut host);
        assert_eq!(report.ticks, 1);
        assert_eq!(t.cursor(&key("x")), Some(1));
    }

    #[test]
    fn test_draws_decoded_frame_at_cursor() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 4, 10.0).unwrap();
        t.ingest_frame_payload(&key("x"), 2, vec![77]);

        // Ticks at cursor 0 and 1 draw nothing
        for _ in 0..2 {
            assert_eq!(step(&mut t, &mut host, 10.0).draws, 0);
        }
        assert_eq!(t.cursor(&key("x")), Some(2));

        let resolves_before = host.resolves.len();
        let report = step(&mut t, &mut host, 10.0);
        assert_eq!(report.draws, 1);
        assert_eq!(host.draws.len(), 1);
        assert_eq!(host.draws[0].0, "x");
        assert_eq!(pixel(&host.draws[0].1), 77);
        assert_eq!(host.resolves.len(), resolves_before + 1);
        assert_eq!(host.resolves.len(), 3);
    }

    #[test]
    fn test_wire_scenario_with_real_png() {
        let mut t = PreviewTracker::inline(&PreviewConfig::default(), Arc::new(ImageCrateDecoder));
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 4, 10.0).unwrap();

        let png = encode_png(2, 2, [0, 255, 0, 255]);
        let msg = encode_frame_update(1, 2, &key("x"), &png).unwrap();
        assert_eq!(t.ingest_message(&msg), IngestOutcome::Scheduled);

        for _ in 0..3 {
            step(&mut t, &mut host, 10.0);
        }
        assert_eq!(host.draws.len(), 1);
        assert_eq!(host.draws[0].1.resolution(), (2, 2));
        assert_eq!(host.draws[0].1.rgba().get_pixel(1, 1).0, [0, 255, 0, 255]);
    }

    #[test]
    fn test_malformed_message_no_mutation() {
        let (mut t, decoder) = tracker();
        t.begin_session(&key("x"), 4, 10.0).unwrap();

        assert_eq!(t.ingest_message(&[0u8; 9]), IngestOutcome::Malformed);
        assert_eq!(t.stats().dropped_malformed(), 1);
        assert_eq!(t.buffer(&key("x")).unwrap().filled(), 0);
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(t.pump_decoded(), 0);
    }

    #[test]
    fn test_decode_failure_leaves_slot_unset() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 1, 10.0).unwrap();
        t.ingest_frame_payload(&key("x"), 0, vec![0xEE]);

        let report = step(&mut t, &mut host, 10.0);
        assert_eq!(report.ticks, 1);
        assert_eq!(report.draws, 0);
        assert_eq!(t.stats().decode_failures(), 1);
    }

    #[test]
    fn test_end_all_silences_everything() {
        let (mut t, decoder) = tracker();
        let mut host = RecordingHost::with(&["a", "a:b"]);
        t.ingest_hierarchical_start(&key("a:b"), 2, 10.0).unwrap();
        t.ingest_frame_payload(&key("a:b"), 0, vec![5]);
        let calls_before = decoder.calls.load(Ordering::SeqCst);

        t.end_all();
        assert_eq!(t.session_count(), 0);

        for _ in 0..10 {
            let report = step(&mut t, &mut host, 10.0);
            assert_eq!(report.draws, 0);
            assert_eq!(report.committed, 0);
        }
        assert!(host.draws.is_empty());
        assert!(host.resolves.is_empty());
        // Payloads after end_all never reach the decoder
        t.ingest_message(&encode_frame_update(0, 0, &key("a:b"), &[5]).unwrap());
        assert_eq!(decoder.calls.load(Ordering::SeqCst), calls_before);
        // Safe when empty
        t.end_all();
    }

    #[test]
    fn test_end_all_cancels_queued_decodes() {
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = Arc::new(Workers::new(1, Arc::clone(&epoch)).unwrap());
        let decoder = Arc::new(CountingDecoder::default());

        // Occupy the only worker so the decode stays queued
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        workers.execute_with_epoch(0, Box::new(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        }));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut t = PreviewTracker::from_parts(&PreviewConfig::default(), decoder.clone(), workers.clone(), epoch);
        t.begin_session(&key("x"), 2, 10.0).unwrap();
        assert_eq!(t.ingest_frame_payload(&key("x"), 0, vec![1]), IngestOutcome::Scheduled);
        t.end_all();
        gate_tx.send(()).unwrap();

        // Jobs run in queue order on one thread: once this fires the decode had its turn
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        workers.execute_with_epoch(t.epoch(), Box::new(move || {
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(t.pump_decoded(), 0);
    }

    #[test]
    fn test_payload_burst_keeps_start_event() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        let bus = EventBus::new();

        bus.emit(StartPreviewEvent { key: "x".into(), frame_count: 4, rate: 10.0 });
        let msg = encode_frame_update(0, 1, &key("x"), &[7]).unwrap();
        for _ in 0..1000 {
            bus.emit(FramePayloadEvent::new(msg.clone()));
        }

        for event in bus.poll() {
            t.handle_event(&event, &mut host);
        }
        assert!(t.is_active(&key("x")));
        assert_eq!(t.stats().dropped_untracked(), 0);
        t.pump_decoded();
        assert_eq!(pixel(&t.buffer(&key("x")).unwrap().get(1).unwrap()), 7);
    }

    #[test]
    fn test_late_result_from_old_epoch_discarded() {
        let epoch = Arc::new(AtomicU64::new(0));
        let pool = Arc::new(ParkedPool::default());
        let mut t = PreviewTracker::from_parts(
            &PreviewConfig::default(),
            Arc::new(CountingDecoder::default()),
            pool.clone(),
            epoch,
        );
        t.begin_session(&key("x"), 2, 10.0).unwrap();
        t.ingest_frame_payload(&key("x"), 0, vec![1]);
        let old_buffer = t.buffer(&key("x")).unwrap().clone();

        t.end_all();
        // Job was already running when end_all hit
        pool.run(0);
        assert_eq!(t.pump_decoded(), 0);
        assert_eq!(old_buffer.filled(), 0);
    }

    #[test]
    fn test_out_of_order_decodes_keep_newest() {
        let epoch = Arc::new(AtomicU64::new(0));
        let pool = Arc::new(ParkedPool::default());
        let mut t = PreviewTracker::from_parts(
            &PreviewConfig::default(),
            Arc::new(CountingDecoder::default()),
            pool.clone(),
            epoch,
        );
        t.begin_session(&key("x"), 1, 10.0).unwrap();
        t.ingest_frame_payload(&key("x"), 0, vec![1]); // older
        t.ingest_frame_payload(&key("x"), 0, vec![2]); // newer

        // Newer finishes first, older straggles in afterwards
        pool.run(1);
        pool.run(0);
        assert_eq!(t.pump_decoded(), 1);
        assert_eq!(pixel(&t.buffer(&key("x")).unwrap().get(0).unwrap()), 2);
        assert_eq!(t.stats().stale_decodes(), 1);
    }

    #[test]
    fn test_end_session_tears_down() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x", "y"]);
        t.begin_session(&key("x"), 2, 10.0).unwrap();
        t.begin_session(&key("y"), 2, 10.0).unwrap();

        assert!(t.end_session(&key("x"), &mut host));
        assert!(!t.is_active(&key("x")));
        assert!(t.buffer(&key("x")).is_none());
        assert_eq!(host.removed, vec!["x"]);
        assert!(t.is_active(&key("y")));

        // Idempotent
        assert!(!t.end_session(&key("x"), &mut host));
        assert_eq!(host.removed.len(), 1);
    }

    #[test]
    fn test_stale_target_self_terminates() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["x"]);
        t.begin_session(&key("x"), 2, 10.0).unwrap();
        t.ingest_frame_payload(&key("x"), 0, vec![9]);

        host.live.clear();
        let report = step(&mut t, &mut host, 10.0);
        assert_eq!(report.expired, vec![key("x")]);
        assert_eq!(report.draws, 0);
        assert!(!t.is_active(&key("x")));
        assert!(t.buffer(&key("x")).is_none());
        // Target was already gone: nothing to remove
        assert!(host.removed.is_empty());
        assert_eq!(t.stats().stale_targets(), 1);
    }

    #[test]
    fn test_liveness_poll_between_ticks() {
        let config = PreviewConfig { liveness_poll_ms: Some(100), ..Default::default() };
        let mut t = PreviewTracker::inline(&config, Arc::new(CountingDecoder::default()));
        let mut host = RecordingHost::with(&["slow"]);
        let start = t.clock();
        t.begin_session(&key("slow"), 2, 1.0).unwrap();

        // Poll while alive: resolves but no tick
        let report = t.update(start + Duration::from_millis(150), &mut host);
        assert_eq!(report.ticks, 0);
        assert_eq!(host.resolves.len(), 1);

        host.live.clear();
        let report = t.update(start + Duration::from_millis(300), &mut host);
        assert_eq!(report.expired, vec![key("slow")]);
        assert_eq!(t.session_count(), 0);
    }

    #[test]
    fn test_handle_event_dispatch() {
        let (mut t, _) = tracker();
        let mut host = RecordingHost::with(&["4", "4:9"]);
        let bus = EventBus::new();

        bus.emit(StartPreviewEvent { key: "4:9".into(), frame_count: 2, rate: 10.0 });
        bus.emit(FramePayloadEvent::new(encode_frame_update(0, 1, &key("4:9"), &[33]).unwrap()));
        bus.emit(StartPreviewEvent { key: "bad::key".into(), frame_count: 2, rate: 10.0 });
        bus.emit(CleanupEvent { key: "4:9".into() });

        for event in bus.poll() {
            assert!(t.handle_event(&event, &mut host));
        }
        assert!(t.is_active(&key("4")));
        assert!(!t.is_active(&key("4:9")));
        assert_eq!(host.removed, vec!["4:9"]);
        t.pump_decoded();
        assert_eq!(pixel(&t.buffer(&key("4")).unwrap().get(1).unwrap()), 33);

        bus.emit(ExecutionStoppedEvent);
        for event in bus.poll() {
            t.handle_event(&event, &mut host);
        }
        assert_eq!(t.session_count(), 0);
        assert_eq!(t.epoch(), 1);

        let unrelated: BoxedEvent = Box::new(42u32);
        assert!(!t.handle_event(&unrelated, &mut host));
    }

    #[test]
    fn test_threaded_pool_commits_eventually() {
        let config = PreviewConfig { worker_threads: 2, ..Default::default() };
        let mut t = PreviewTracker::new(&config).unwrap();
        t.begin_session(&key("x"), 1, 10.0).unwrap();
        t.ingest_frame_payload(&key("x"), 0, encode_png(1, 1, [1, 2, 3, 255]));

        let deadline = Instant::now() + Duration::from_secs(5);
        while t.buffer(&key("x")).unwrap().filled() == 0 && Instant::now() < deadline {
            t.pump_decoded();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(t.buffer(&key("x")).unwrap().get(0).unwrap().rgba().get_pixel(0, 0).0, [1, 2, 3, 255]);
    }
}
