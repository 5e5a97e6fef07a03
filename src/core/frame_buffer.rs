//! Fixed-length frame buffer shared by every session on one key path.
//!
//! **Why shared**: a hierarchical start registers the same buffer under
//! `"a"`, `"a:b"` and `"a:b:c"`, so a payload addressed to any of them shows
//! up in all enclosing previews at once.
//!
//! # Version stamps
//!
//! Decodes finish in any order. Each payload reserves the next version for its
//! slot before decoding starts; `commit()` only accepts an image whose version
//! is newer than the one currently shown in that slot. An older decode that
//! finishes late is discarded instead of overwriting newer pixels.

use std::sync::{Arc, Mutex};

use super::decode::PreviewImage;

/// One buffer slot
#[derive(Debug, Clone, Default)]
struct Slot {
    image: Option<PreviewImage>,
    /// Last version handed out by `reserve()`
    reserved: u64,
    /// Version of `image` (0 = never committed)
    committed: u64,
}

/// Outcome of committing a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored,
    /// A newer version already occupies the slot
    Stale,
    OutOfRange,
}

/// Shared slot array (clones point at the same storage)
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    slots: Arc<Mutex<Vec<Slot>>>,
}

impl FrameBuffer {
    /// Create buffer with `len` unset slots
    pub fn new(len: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(vec![Slot::default(); len])),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame at `index`, None if unset or out of range
    pub fn get(&self, index: usize) -> Option<PreviewImage> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(index).and_then(|s| s.image.clone())
    }

    /// Number of slots holding a frame
    pub fn filled(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().filter(|s| s.image.is_some()).count()
    }

    /// Reserve the next version for `index`. None if out of range.
    pub fn reserve(&self, index: usize) -> Option<u64> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get_mut(index)?;
        slot.reserved += 1;
        Some(slot.reserved)
    }

    /// Store `image` at `index` if `version` is newer than what the slot shows
    pub fn commit(&self, index: usize, version: u64, image: PreviewImage) -> CommitOutcome {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get_mut(index) else {
            return CommitOutcome::OutOfRange;
        };
        if version <= slot.committed {
            return CommitOutcome::Stale;
        }
        slot.image = Some(image);
        slot.committed = version;
        CommitOutcome::Stored
    }

    /// True if both handles share storage
    pub fn ptr_eq(&self, other: &FrameBuffer) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}
