//! Event Bus - central pub/sub router for stream events
//!
//! Listeners are plain callbacks invoked synchronously by `emit`, in
//! registration order: every global listener first, then every listener
//! scoped to the event's type. A listener that returns an error or panics
//! never affects the publisher or the remaining listeners; the failure is
//! reported as a `debug:output` event delivered to global listeners only.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::types::{
    EventFilter, EventType, LogLevel, StreamChunk, StreamError, StreamEvent, StreamMetadata, StreamResult,
};

/// Source tag used for diagnostics produced by the bus itself
pub const BUS_SOURCE: &str = "event-bus";

/// A registered callback
pub type Listener = Arc<dyn Fn(&StreamEvent) -> eyre::Result<()> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    global: Vec<Registration>,
    by_type: HashMap<EventType, Vec<Registration>>,
}

impl Registry {
    fn remove(&mut self, ids: &[u64]) -> usize {
        let before = self.len();
        self.global.retain(|r| !ids.contains(&r.id));
        for regs in self.by_type.values_mut() {
            regs.retain(|r| !ids.contains(&r.id));
        }
        self.by_type.retain(|_, regs| !regs.is_empty());
        before - self.len()
    }

    fn len(&self) -> usize {
        self.global.len() + self.by_type.values().map(Vec::len).sum::<usize>()
    }
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    registry: RwLock<Registry>,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of registered listeners
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ListenerCounts {
    pub global: usize,
    pub by_type: BTreeMap<EventType, usize>,
}

/// Central event bus for stream activity
///
/// Cloning is cheap; all clones share the same listeners. Construct one per
/// process and hand clones to every component that publishes or subscribes.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new event bus with no listeners
    pub fn new() -> Self {
        debug!("EventBus::new: creating event bus");
        Self::default()
    }

    /// Register a listener for every event
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StreamEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.write().global.push(Registration {
            id,
            listener: Arc::new(listener),
        });
        debug!(id, "EventBus::subscribe: global listener registered");
        self.subscription(vec![id])
    }

    /// Register a listener for the given event types only
    ///
    /// One registration is made per type; the returned subscription removes
    /// all of them together.
    pub fn subscribe_to_types<F>(&self, types: impl IntoIterator<Item = EventType>, listener: F) -> Subscription
    where
        F: Fn(&StreamEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let mut ids = Vec::new();
        let mut registry = self.inner.write();
        for event_type in types {
            if ids.iter().any(|(_, t)| *t == event_type) {
                continue;
            }
            let id = self.next_id();
            registry.by_type.entry(event_type).or_default().push(Registration {
                id,
                listener: Arc::clone(&listener),
            });
            ids.push((id, event_type));
        }
        drop(registry);
        debug!(?ids, "EventBus::subscribe_to_types: typed listener registered");
        self.subscription(ids.into_iter().map(|(id, _)| id).collect())
    }

    /// Register a listener that only sees events matching `filter`
    ///
    /// Filters naming event types are registered per type; all other filters
    /// are registered globally and checked on every event.
    pub fn subscribe_with_filter<F>(&self, filter: EventFilter, listener: F) -> Subscription
    where
        F: Fn(&StreamEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        debug!(?filter, "EventBus::subscribe_with_filter: called");
        let types = filter.event_types.clone().filter(|types| !types.is_empty());
        let filtered = move |event: &StreamEvent| {
            if filter.matches(event) {
                listener(event)
            } else {
                Ok(())
            }
        };
        match types {
            Some(types) => self.subscribe_to_types(types, filtered),
            None => self.subscribe(filtered),
        }
    }

    /// Deliver an event to every interested listener
    ///
    /// Listener sets are snapshotted first, so listeners may subscribe or
    /// unsubscribe (including themselves) while the event is being delivered.
    pub fn emit(&self, event: StreamEvent) {
        let event_type = event.event_type();
        debug!(%event_type, stream_id = event.stream_id(), "EventBus::emit");

        let (global, typed) = {
            let registry = self.inner.read();
            (
                registry.global.clone(),
                registry.by_type.get(&event_type).cloned().unwrap_or_default(),
            )
        };

        for registration in global.iter().chain(typed.iter()) {
            if let Err(message) = invoke(&registration.listener, &event) {
                error!(
                    listener_id = registration.id,
                    %event_type,
                    error = %message,
                    "EventBus::emit: listener failed"
                );
                self.report_listener_failure(registration.id, event_type, message);
            }
        }
    }

    /// Create an emitter bound to one stream's metadata
    pub fn emitter_for(&self, metadata: StreamMetadata) -> StreamEmitter {
        debug!(stream_id = %metadata.stream_id, "EventBus::emitter_for: creating emitter");
        StreamEmitter {
            bus: self.clone(),
            metadata,
        }
    }

    /// Get the number of listeners per scope
    pub fn listener_counts(&self) -> ListenerCounts {
        let registry = self.inner.read();
        ListenerCounts {
            global: registry.global.len(),
            by_type: registry
                .by_type
                .iter()
                .map(|(event_type, regs)| (*event_type, regs.len()))
                .collect(),
        }
    }

    /// Get the total number of registrations
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Remove every listener
    pub fn clear_all(&self) {
        let mut registry = self.inner.write();
        let removed = registry.len();
        *registry = Registry::default();
        debug!(removed, "EventBus::clear_all");
    }

    /// Remove every listener scoped to the given types; global listeners stay
    pub fn clear_event_types(&self, types: impl IntoIterator<Item = EventType>) {
        let mut registry = self.inner.write();
        for event_type in types {
            if let Some(regs) = registry.by_type.remove(&event_type) {
                debug!(%event_type, removed = regs.len(), "EventBus::clear_event_types");
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscription(&self, ids: Vec<u64>) -> Subscription {
        Subscription {
            bus: Arc::downgrade(&self.inner),
            ids,
        }
    }

    /// Deliver a listener failure to global listeners, without recursing
    fn report_listener_failure(&self, listener_id: u64, event_type: EventType, message: String) {
        let diagnostic = StreamEvent::debug_output(
            LogLevel::Error,
            BUS_SOURCE,
            format!("Listener failed while handling {}: {}", event_type, message),
            Some(serde_json::json!({
                "listener_id": listener_id,
                "event_type": event_type,
                "error": message,
            })),
        );
        let global = self.inner.read().global.clone();
        for registration in &global {
            if let Err(e) = invoke(&registration.listener, &diagnostic) {
                warn!(
                    listener_id = registration.id,
                    error = %e,
                    "EventBus: listener failed while handling a failure report, dropping"
                );
            }
        }
    }
}

/// Handle returned by every `subscribe*` call
///
/// Dropping the handle does not unsubscribe.
#[must_use = "keep the subscription to be able to unsubscribe later"]
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    ids: Vec<u64>,
}

impl Subscription {
    /// Remove exactly the registrations made by this subscription
    ///
    /// Safe to call more than once and from inside a listener.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            let removed = inner.write().remove(&self.ids);
            debug!(ids = ?self.ids, removed, "Subscription::unsubscribe");
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").field("listeners", &self.read().len()).finish()
    }
}

/// Handle for publishing the events of one stream
///
/// Every event carries the same metadata, cloned from the emitter.
#[derive(Clone)]
pub struct StreamEmitter {
    bus: EventBus,
    metadata: StreamMetadata,
}

impl StreamEmitter {
    /// Emit a stream started event
    pub fn started(&self, prompt: &str) {
        self.bus.emit(StreamEvent::Started {
            stream_id: self.metadata.stream_id.clone(),
            metadata: self.metadata.clone(),
            prompt: prompt.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Emit a chunk event
    pub fn chunk(&self, chunk: StreamChunk) {
        self.bus.emit(StreamEvent::Chunk {
            stream_id: self.metadata.stream_id.clone(),
            metadata: self.metadata.clone(),
            chunk,
        });
    }

    /// Emit a completed event
    pub fn completed(&self, result: StreamResult) {
        self.bus.emit(StreamEvent::Completed { result });
    }

    /// Emit an error event
    pub fn error(&self, error: StreamError) {
        self.bus.emit(StreamEvent::Error {
            stream_id: self.metadata.stream_id.clone(),
            metadata: self.metadata.clone(),
            error,
            timestamp: Utc::now(),
        });
    }

    /// Emit a cancelled event
    pub fn cancelled(&self, reason: Option<&str>) {
        self.bus.emit(StreamEvent::Cancelled {
            stream_id: self.metadata.stream_id.clone(),
            metadata: self.metadata.clone(),
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        });
    }
}

fn invoke(listener: &Listener, event: &StreamEvent) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
