//! Preview pipeline counters.
//!
//! Lock-free so decode workers can bump them without touching the owner
//! thread. Every failure mode in the pipeline degrades to "preview doesn't
//! update"; these counters are the only place such drops become visible.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PreviewStats {
    payloads: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_untracked: AtomicU64,
    dropped_out_of_range: AtomicU64,
    decodes: AtomicU64,
    decode_failures: AtomicU64,
    stale_decodes: AtomicU64,
    frames_committed: AtomicU64,
    ticks: AtomicU64,
    draws: AtomicU64,
    stale_targets: AtomicU64,
    rejected_starts: AtomicU64,
}

/// Plain copy of the counters (for logging and the replay summary)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub payloads: u64,
    pub dropped_malformed: u64,
    pub dropped_untracked: u64,
    pub dropped_out_of_range: u64,
    pub decodes: u64,
    pub decode_failures: u64,
    pub stale_decodes: u64,
    pub frames_committed: u64,
    pub ticks: u64,
    pub draws: u64,
    pub stale_targets: u64,
    /// Start announcements refused (bad frame count or rate)
    pub rejected_starts: u64,
}

impl StatsSnapshot {
    /// Payloads that never reached the decoder
    pub fn dropped(&self) -> u64 {
        self.dropped_malformed + self.dropped_untracked + self.dropped_out_of_range
    }
}

macro_rules! counter {
    ($record:ident, $get:ident) => {
        pub fn $record(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl PreviewStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_payload, payloads);
    counter!(record_malformed, dropped_malformed);
    counter!(record_untracked, dropped_untracked);
    counter!(record_out_of_range, dropped_out_of_range);
    counter!(record_decode, decodes);
    counter!(record_decode_failure, decode_failures);
    counter!(record_stale_decode, stale_decodes);
    counter!(record_commit, frames_committed);
    counter!(record_tick, ticks);
    counter!(record_draw, draws);
    counter!(record_stale_target, stale_targets);
    counter!(record_rejected_start, rejected_starts);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            payloads: self.payloads(),
            dropped_malformed: self.dropped_malformed(),
            dropped_untracked: self.dropped_untracked(),
            dropped_out_of_range: self.dropped_out_of_range(),
            decodes: self.decodes(),
            decode_failures: self.decode_failures(),
            stale_decodes: self.stale_decodes(),
            frames_committed: self.frames_committed(),
            ticks: self.ticks(),
            draws: self.draws(),
            stale_targets: self.stale_targets(),
            rejected_starts: self.rejected_starts(),
        }
    }
}
