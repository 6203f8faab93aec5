//! Session Logger - bounded, queryable history of observed events
//!
//! The logger subscribes to the EventBus and keeps every event it sees as a
//! formatted entry. Entries are grouped into sessions; starting a session
//! closes the previous one. Two independent bounds apply, oldest first:
//! total retained entries and number of retained closed sessions.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::bus::{EventBus, Subscription};
use super::format::format_event;
use super::types::{EventType, LogLevel, StreamContext, StreamEvent};
use crate::config::SessionLogConfig;

/// One recorded event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Monotonic per logger
    pub id: u64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<StreamContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Running summary of a session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub contexts: BTreeSet<StreamContext>,
    pub models: BTreeSet<String>,
    pub streams_started: u64,
    pub entry_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: SessionSummary,
}

impl LogSession {
    fn new(name: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name,
            started_at: Utc::now(),
            ended_at: None,
            summary: SessionSummary::default(),
        }
    }
}

/// Serializable snapshot of everything the logger holds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogExport {
    pub sessions: Vec<LogSession>,
    pub current_session: Option<LogSession>,
    pub entries: Vec<SessionEntry>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LogState {
    config: SessionLogConfig,
    entries: VecDeque<SessionEntry>,
    /// Closed sessions, oldest first
    sessions: VecDeque<LogSession>,
    current: Option<LogSession>,
    next_entry_id: u64,
}

impl LogState {
    fn end_current(&mut self) {
        if let Some(mut session) = self.current.take() {
            session.ended_at = Some(Utc::now());
            debug!(session_id = %session.id, entries = session.summary.entry_count, "SessionLogger: session ended");
            self.sessions.push_back(session);
            while self.sessions.len() > self.config.max_sessions {
                self.sessions.pop_front();
            }
        }
    }

    fn start(&mut self, name: Option<String>) -> String {
        self.end_current();
        let session = LogSession::new(name);
        let id = session.id.clone();
        debug!(session_id = %id, "SessionLogger: session started");
        self.current = Some(session);
        id
    }

    fn record(&mut self, event: &StreamEvent) {
        if self.current.is_none() {
            self.start(None);
        }
        let Some(session) = self.current.as_mut() else {
            return;
        };

        let record = format_event(event);
        let metadata = event.metadata();
        if let Some(m) = metadata {
            session.summary.contexts.insert(m.context);
            session.summary.models.insert(m.model.clone());
        }
        if matches!(event, StreamEvent::Started { .. }) {
            session.summary.streams_started += 1;
        }
        session.summary.entry_count += 1;

        let entry = SessionEntry {
            id: self.next_entry_id,
            session_id: session.id.clone(),
            timestamp: record.timestamp,
            level: record.level,
            category: record.category,
            message: record.content,
            event_type: event.event_type(),
            stream_id: event.stream_id().map(str::to_string),
            context: metadata.map(|m| m.context),
            model: metadata.map(|m| m.model.clone()),
            metadata: record.metadata,
        };
        self.next_entry_id += 1;
        self.entries.push_back(entry);
        while self.entries.len() > self.config.max_entries {
            self.entries.pop_front();
        }
    }
}

/// Bounded in-memory event history grouped into sessions
///
/// Cloning is cheap; clones share the same history.
#[derive(Clone, Debug)]
pub struct SessionLogger {
    state: Arc<Mutex<LogState>>,
}

impl SessionLogger {
    /// Create a logger with an initial open session
    pub fn new(config: SessionLogConfig) -> Self {
        debug!(?config, "SessionLogger::new: called");
        let mut state = LogState {
            config,
            entries: VecDeque::new(),
            sessions: VecDeque::new(),
            current: None,
            next_entry_id: 0,
        };
        state.start(None);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Subscribe to every event on the bus
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        debug!("SessionLogger::attach: subscribing to event bus");
        let logger = self.clone();
        bus.subscribe(move |event| {
            logger.record(event);
            Ok(())
        })
    }

    /// Append an event to the current session
    pub fn record(&self, event: &StreamEvent) {
        self.lock().record(event);
    }

    /// End the current session and begin a new one, returning its ID
    pub fn start_session(&self, name: Option<&str>) -> String {
        self.lock().start(name.map(str::to_string))
    }

    /// End the current session without starting another
    ///
    /// The next recorded event opens a fresh session.
    pub fn end_session(&self) {
        self.lock().end_current();
    }

    pub fn current_session(&self) -> Option<LogSession> {
        self.lock().current.clone()
    }

    /// Closed sessions still retained, oldest first
    pub fn sessions(&self) -> Vec<LogSession> {
        self.lock().sessions.iter().cloned().collect()
    }

    /// All retained entries, oldest first
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn by_stream(&self, stream_id: &str) -> Vec<SessionEntry> {
        self.filtered(|e| e.stream_id.as_deref() == Some(stream_id))
    }

    pub fn by_context(&self, context: StreamContext) -> Vec<SessionEntry> {
        self.filtered(|e| e.context == Some(context))
    }

    pub fn by_level(&self, level: LogLevel) -> Vec<SessionEntry> {
        self.filtered(|e| e.level == level)
    }

    /// Entries with `from <= timestamp <= to`
    pub fn in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<SessionEntry> {
        self.filtered(|e| e.timestamp >= from && e.timestamp <= to)
    }

    /// The `count` most recent entries, oldest first
    pub fn recent(&self, count: usize) -> Vec<SessionEntry> {
        let state = self.lock();
        let skip = state.entries.len().saturating_sub(count);
        state.entries.iter().skip(skip).cloned().collect()
    }

    /// Case-insensitive substring search over entry messages
    pub fn search(&self, text: &str) -> Vec<SessionEntry> {
        let needle = text.to_lowercase();
        self.filtered(|e| e.message.to_lowercase().contains(&needle))
    }

    /// Snapshot the whole history
    pub fn export(&self) -> LogExport {
        let state = self.lock();
        LogExport {
            sessions: state.sessions.iter().cloned().collect(),
            current_session: state.current.clone(),
            entries: state.entries.iter().cloned().collect(),
            exported_at: Utc::now(),
        }
    }

    /// Write the export as pretty JSON
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!(?path, "SessionLogger::export_to_file: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).context("Failed to create export directory")?;
        }
        let json = serde_json::to_string_pretty(&self.export())?;
        fs::write(path, json).context(format!("Failed to write log export to {}", path.display()))?;
        Ok(())
    }

    /// Drop all entries and closed sessions; the current session stays open
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.sessions.clear();
        debug!("SessionLogger::clear");
    }

    fn filtered(&self, predicate: impl Fn(&SessionEntry) -> bool) -> Vec<SessionEntry> {
        self.lock().entries.iter().filter(|e| predicate(e)).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionLogger {
    fn default() -> Self {
        Self::new(SessionLogConfig::default())
    }
}
