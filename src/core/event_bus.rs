//! Pub/Sub event bus between the host integration layer and the tracker.
//!
//! - `subscribe()` callbacks fire synchronously inside `emit()`
//! - every emitted event is also queued; the owner loop drains it with `poll()`
//!   and hands each event to `PreviewTracker::handle_event`
//!
//! Network callbacks typically only hold an [`EventEmitter`]; the thread that
//! owns the tracker owns the bus and polls it.
//!
//! Callback order is FIFO within one event type, undefined across types.
//!
//! When the queue is full only frame payloads are evicted (oldest first).
//! Session lifecycle events are never dropped, so the queue may grow past
//! its capacity if nothing but lifecycle events are pending.

use log::warn;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::preview_events::FramePayloadEvent;

/// Queue length at which the oldest half of the queued payloads is evicted
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Marker trait for events. Events must be Send + Sync + 'static.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Boxed event for queue storage
pub type BoxedEvent = Box<dyn Event>;

struct Shared {
    subscribers: RwLock<HashMap<TypeId, Vec<Callback>>>,
    queue: Mutex<Vec<BoxedEvent>>,
    capacity: usize,
}

impl Shared {
    fn dispatch(&self, type_id: TypeId, event: &dyn Any) {
        // Clone the callback list so a callback may subscribe without deadlocking
        let cbs = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
            .cloned();
        for cb in cbs.iter().flatten() {
            cb(event);
        }
    }

    fn enqueue(&self, event: BoxedEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            let payloads = queue.iter().filter(|e| is_evictable(e)).count();
            if payloads > 0 {
                let evict_count = (payloads / 2).max(1);
                warn!(
                    "Preview event queue full ({} events), evicting oldest {} frame payloads",
                    queue.len(),
                    evict_count
                );
                let mut remaining = evict_count;
                queue.retain(|e| {
                    if remaining > 0 && is_evictable(e) {
                        remaining -= 1;
                        false
                    } else {
                        true
                    }
                });
            }
        }
        queue.push(event);
    }

    fn emit<E: Event>(&self, event: E) {
        self.dispatch(TypeId::of::<E>(), &event);
        self.enqueue(Box::new(event));
    }

    fn emit_boxed(&self, event: BoxedEvent) {
        // Deref to dyn Event so the vtable reports the inner type, not Box's
        let type_id = (*event).as_any().type_id();
        self.dispatch(type_id, (*event).as_any());
        self.enqueue(event);
    }
}

/// Frame payloads are superseded by later ones; everything else drives session state
fn is_evictable(event: &BoxedEvent) -> bool {
    (**event).as_any().is::<FramePayloadEvent>()
}

/// Event bus owned by the tracker's thread.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue_len", &self.queue_len())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: RwLock::new(HashMap::new()),
                queue: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe to events of type E (called synchronously on emit)
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    pub fn emit<E: Event>(&self, event: E) {
        self.shared.emit(event);
    }

    pub fn emit_boxed(&self, event: BoxedEvent) {
        self.shared.emit_boxed(event);
    }

    /// Drain all queued events, oldest first
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Cloneable handle for producers (network callbacks, input handlers)
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn unsubscribe_all<E: Event>(&self) {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<E>());
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .is_some_and(|v| !v.is_empty())
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Producer handle: emits into the bus it was created from
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("queue_len", &self.shared.queue.lock().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

impl EventEmitter {
    pub fn emit<E: Event>(&self, event: E) {
        self.shared.emit(event);
    }

    pub fn emit_boxed(&self, event: BoxedEvent) {
        self.shared.emit_boxed(event);
    }
}

/// Downcast a queued event to its concrete type.
///
/// Explicit `(**event)` deref: `Box<dyn Event>` itself satisfies the blanket
/// impl, and calling `as_any()` on the box would report the box's TypeId.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}
