//! Preview engine: keys, buffers, codec, decoding, events and the tracker.
//!
//! Independent of any host UI; hosts plug in through `host::PreviewHost`.

pub mod decode;
pub mod event_bus;
pub mod frame_buffer;
pub mod host;
pub mod preview_events;
pub mod session_key;
pub mod stats;
pub mod tracker;
pub mod wire;
pub mod workers;

// Re-exports for convenience
pub use decode::{ImageCrateDecoder, ImageDecoder, PreviewImage};
pub use event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter};
pub use frame_buffer::FrameBuffer;
pub use host::{AffordanceList, AffordancePosition, PreviewAffordances, PreviewHost};
pub use session_key::SessionKey;
pub use stats::{PreviewStats, StatsSnapshot};
pub use tracker::{IngestOutcome, PreviewTracker, SessionError, UpdateReport};
pub use workers::{InlinePool, WorkerPool, Workers};
