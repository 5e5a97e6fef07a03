//! Events delivered by the host to the preview pipeline.
//!
//! Keys arrive as raw strings straight off the wire; the tracker validates
//! them when handling the event.

use std::sync::Arc;

/// Backend announced an animated preview for `key` (and its prefixes)
#[derive(Clone, Debug, PartialEq)]
pub struct StartPreviewEvent {
    pub key: String,
    pub frame_count: usize,
    /// Redraw rate in frames per second
    pub rate: f32,
}

/// Binary frame update (see `core::wire` for the layout)
#[derive(Clone, Debug)]
pub struct FramePayloadEvent {
    pub bytes: Arc<[u8]>,
}

impl FramePayloadEvent {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { bytes: bytes.into() }
    }
}

/// Backend finished with `key`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupEvent {
    pub key: String,
}

/// Nothing is executing any more: drop every preview
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionStoppedEvent;
