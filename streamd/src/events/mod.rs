//! Event Bus Architecture for stream observability
//!
//! Every stream lifecycle step emits an event. All consumers (UI panels,
//! debug terminal, session log) subscribe to the same bus independently.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EVENT BUS                              │
//! │        (synchronous callbacks, global + per-type)            │
//! │                                                              │
//! │  Every lifecycle step emits an event. Every consumer         │
//! │  subscribes, optionally through a filter.                    │
//! └─────────────────────────────────────────────────────────────┘
//!         ↑                          ↑                 ↑
//!   StreamManager               BusLogger          EventBus itself
//!   emits:                      emits:             emits:
//!   - stream:started            - log:entry        - debug:output
//!   - stream:chunk                                   (listener failures)
//!   - stream:completed
//!   - stream:error
//!   - stream:cancelled
//!
//!         ↓                          ↓                 ↓
//! ┌───────────────┐        ┌───────────────┐   ┌───────────────┐
//! │ UI / CLI      │        │ SessionLogger │   │ Debug format  │
//! │ (filtered)    │        │ (history)     │   │ (records)     │
//! └───────────────┘        └───────────────┘   └───────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use streamd::events::{EventBus, EventFilter, EventType};
//!
//! // Create the event bus once, at startup, and hand out clones
//! let bus = EventBus::new();
//!
//! // Everything
//! let all = bus.subscribe(|event| {
//!     println!("{}", event.event_type());
//!     Ok(())
//! });
//!
//! // One stream's chunks only
//! let chunks = bus.subscribe_with_filter(
//!     EventFilter::for_stream(stream_id).with_types([EventType::StreamChunk]),
//!     |event| Ok(()),
//! );
//!
//! all.unsubscribe();
//! chunks.unsubscribe();
//! ```

mod bus;
pub mod format;
mod log_adapter;
mod session_log;
mod types;

pub use bus::{BUS_SOURCE, EventBus, Listener, ListenerCounts, StreamEmitter, Subscription};
pub use format::{DebugRecord, format_event, format_log_entry, format_raw};
pub use log_adapter::BusLogger;
pub use session_log::{LogExport, LogSession, SessionEntry, SessionLogger, SessionSummary};
pub use types::{
    EventFilter, EventType, LogEntry, LogLevel, StreamChunk, StreamContext, StreamError, StreamEvent, StreamMetadata,
    StreamMetrics, StreamResult, StreamStatus,
};
