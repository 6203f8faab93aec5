//! Event types for stream activity
//!
//! These types are the vocabulary shared by the stream manager, the event bus
//! and every read-side consumer:
//! - Stream lifecycle (started, chunk, completed, error, cancelled)
//! - Diagnostics (debug output produced by the bus itself)
//! - Log entries forwarded from the logging facade

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a stream was started. Fixed for the lifetime of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamContext {
    FormAnalysis,
    UserChat,
    SettingsTest,
    ManualDebug,
}

impl StreamContext {
    pub const ALL: [StreamContext; 4] = [
        StreamContext::FormAnalysis,
        StreamContext::UserChat,
        StreamContext::SettingsTest,
        StreamContext::ManualDebug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamContext::FormAnalysis => "form-analysis",
            StreamContext::UserChat => "user-chat",
            StreamContext::SettingsTest => "settings-test",
            StreamContext::ManualDebug => "manual-debug",
        }
    }
}

impl fmt::Display for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamContext::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown stream context '{}' (expected one of: form-analysis, user-chat, settings-test, manual-debug)",
                    s
                )
            })
    }
}

/// Immutable description of a stream, repeated verbatim in every event for it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub stream_id: String,
    pub context: StreamContext,
    pub model: String,
    pub started_at: DateTime<Utc>,
    /// Prompt text as the user typed it, if different from the rendered prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    /// Opaque caller data, passed through unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One unit of backend output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub content: String,
    /// 0-based, strictly increasing per stream with no gaps
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle status of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Starting,
    Streaming,
    Completed,
    Error,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Completed | StreamStatus::Error | StreamStatus::Cancelled)
    }

    /// Transitions only move forward; nothing leaves a terminal state
    pub fn can_transition_to(&self, next: StreamStatus) -> bool {
        match (self, next) {
            (StreamStatus::Starting, StreamStatus::Streaming) => true,
            (StreamStatus::Starting | StreamStatus::Streaming, StreamStatus::Error | StreamStatus::Cancelled) => true,
            (StreamStatus::Streaming, StreamStatus::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::Starting => "starting",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Completed => "completed",
            StreamStatus::Error => "error",
            StreamStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Performance summary computed at the terminal transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub total_chunks: u64,
    /// Length of the UTF-8 encoded content
    pub total_bytes: u64,
    pub duration_ms: u64,
    /// Approximation: four characters per token
    pub tokens_per_second: f64,
}

/// Error descriptor carried by `stream:error`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Final outcome of a stream, created once
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub stream_id: String,
    pub full_content: String,
    pub status: StreamStatus,
    pub metadata: StreamMetadata,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StreamMetrics>,
}

/// Severity shared by debug output, log entries and formatted records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// An entry produced by the logging facade
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component that produced the entry
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Discriminant of [`StreamEvent`], used for type-scoped subscriptions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "stream:started")]
    StreamStarted,
    #[serde(rename = "stream:chunk")]
    StreamChunk,
    #[serde(rename = "stream:completed")]
    StreamCompleted,
    #[serde(rename = "stream:error")]
    StreamError,
    #[serde(rename = "stream:cancelled")]
    StreamCancelled,
    #[serde(rename = "debug:output")]
    DebugOutput,
    #[serde(rename = "log:entry")]
    LogEntry,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::StreamStarted,
        EventType::StreamChunk,
        EventType::StreamCompleted,
        EventType::StreamError,
        EventType::StreamCancelled,
        EventType::DebugOutput,
        EventType::LogEntry,
    ];

    /// Terminal stream events; exactly one is emitted per stream
    pub const TERMINAL: [EventType; 3] = [
        EventType::StreamCompleted,
        EventType::StreamError,
        EventType::StreamCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StreamStarted => "stream:started",
            EventType::StreamChunk => "stream:chunk",
            EventType::StreamCompleted => "stream:completed",
            EventType::StreamError => "stream:error",
            EventType::StreamCancelled => "stream:cancelled",
            EventType::DebugOutput => "debug:output",
            EventType::LogEntry => "log:entry",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core event enum, tagged by `type` on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A stream was registered and execution is about to begin
    #[serde(rename = "stream:started")]
    Started {
        stream_id: String,
        metadata: StreamMetadata,
        prompt: String,
        timestamp: DateTime<Utc>,
    },
    /// A fragment of backend output
    #[serde(rename = "stream:chunk")]
    Chunk {
        stream_id: String,
        metadata: StreamMetadata,
        chunk: StreamChunk,
    },
    /// The backend finished producing output
    #[serde(rename = "stream:completed")]
    Completed { result: StreamResult },
    /// The backend call failed
    #[serde(rename = "stream:error")]
    Error {
        stream_id: String,
        metadata: StreamMetadata,
        error: StreamError,
        timestamp: DateTime<Utc>,
    },
    /// The stream was cancelled on request
    #[serde(rename = "stream:cancelled")]
    Cancelled {
        stream_id: String,
        metadata: StreamMetadata,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Diagnostic output, e.g. a listener failure reported by the bus
    #[serde(rename = "debug:output")]
    DebugOutput {
        message: String,
        level: LogLevel,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    /// An entry forwarded from the logging facade
    #[serde(rename = "log:entry")]
    Log { entry: LogEntry },
}

impl StreamEvent {
    /// Get the event type
    pub fn event_type(&self) -> EventType {
        match self {
            StreamEvent::Started { .. } => EventType::StreamStarted,
            StreamEvent::Chunk { .. } => EventType::StreamChunk,
            StreamEvent::Completed { .. } => EventType::StreamCompleted,
            StreamEvent::Error { .. } => EventType::StreamError,
            StreamEvent::Cancelled { .. } => EventType::StreamCancelled,
            StreamEvent::DebugOutput { .. } => EventType::DebugOutput,
            StreamEvent::Log { .. } => EventType::LogEntry,
        }
    }

    /// Get the stream ID, if this is a stream lifecycle event
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Started { stream_id, .. }
            | StreamEvent::Chunk { stream_id, .. }
            | StreamEvent::Error { stream_id, .. }
            | StreamEvent::Cancelled { stream_id, .. } => Some(stream_id),
            StreamEvent::Completed { result } => Some(&result.stream_id),
            StreamEvent::DebugOutput { .. } | StreamEvent::Log { .. } => None,
        }
    }

    /// Get the stream metadata, if this is a stream lifecycle event
    pub fn metadata(&self) -> Option<&StreamMetadata> {
        match self {
            StreamEvent::Started { metadata, .. }
            | StreamEvent::Chunk { metadata, .. }
            | StreamEvent::Error { metadata, .. }
            | StreamEvent::Cancelled { metadata, .. } => Some(metadata),
            StreamEvent::Completed { result } => Some(&result.metadata),
            StreamEvent::DebugOutput { .. } | StreamEvent::Log { .. } => None,
        }
    }

    pub fn context(&self) -> Option<StreamContext> {
        self.metadata().map(|m| m.context)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamEvent::Started { timestamp, .. }
            | StreamEvent::Error { timestamp, .. }
            | StreamEvent::Cancelled { timestamp, .. }
            | StreamEvent::DebugOutput { timestamp, .. } => *timestamp,
            StreamEvent::Chunk { chunk, .. } => chunk.timestamp,
            StreamEvent::Completed { result } => result.completed_at,
            StreamEvent::Log { entry } => entry.timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }

    /// Build a diagnostic event stamped with the current time
    pub fn debug_output(
        level: LogLevel,
        source: impl Into<String>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        StreamEvent::DebugOutput {
            message: message.into(),
            level,
            source: source.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Subscription filter; every field that is set must match
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<StreamContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<BTreeSet<EventType>>,
}

impl EventFilter {
    pub fn for_stream(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            ..Default::default()
        }
    }

    pub fn for_context(context: StreamContext) -> Self {
        Self {
            context: Some(context),
            ..Default::default()
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    /// Check an event against the filter
    ///
    /// Events without a stream ID or context never match a filter that
    /// constrains those fields.
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if let Some(types) = &self.event_types
            && !types.contains(&event.event_type())
        {
            return false;
        }
        if let Some(stream_id) = &self.stream_id
            && event.stream_id() != Some(stream_id.as_str())
        {
            return false;
        }
        if let Some(context) = self.context
            && event.context() != Some(context)
        {
            return false;
        }
        true
    }
}
