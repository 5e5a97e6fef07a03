//! stream-preview - keyed streaming preview pipeline
//!
//! Tracks animated previews for nested execution contexts: binary frame
//! updates are decoded into shared per-key buffers and redrawn at a fixed
//! rate on whatever surface the host resolves for each key.

// Core engine (keys, buffers, codec, decode workers, events, tracker)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod replay;

// Re-export commonly used types from core
pub use core::event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter};
pub use core::host::PreviewHost;
pub use core::session_key::SessionKey;
pub use core::tracker::PreviewTracker;
pub use config::PreviewConfig;
