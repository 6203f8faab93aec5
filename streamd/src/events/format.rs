//! Debug formatter - renders events and log entries as display records
//!
//! Pure functions: no I/O, no clock reads, same input gives the same record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::types::{LogEntry, LogLevel, StreamEvent};

/// Maximum prompt characters echoed into a started record
const PROMPT_PREVIEW_CHARS: usize = 100;

/// A display-ready rendering of one event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DebugRecord {
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub level: LogLevel,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Render a stream event
pub fn format_event(event: &StreamEvent) -> DebugRecord {
    let timestamp = event.timestamp();
    match event {
        StreamEvent::Started {
            stream_id,
            metadata,
            prompt,
            ..
        } => DebugRecord {
            timestamp,
            content: format!(
                "[{}] Stream started ({}, model {}): {}",
                short_id(stream_id),
                metadata.context,
                metadata.model,
                preview(prompt, PROMPT_PREVIEW_CHARS)
            ),
            level: LogLevel::Info,
            category: "stream".to_string(),
            metadata: Some(json!({
                "stream_id": stream_id,
                "context": metadata.context,
                "model": metadata.model,
                "prompt_length": prompt.chars().count(),
            })),
        },
        StreamEvent::Chunk { stream_id, chunk, .. } => DebugRecord {
            timestamp,
            content: chunk.content.clone(),
            level: LogLevel::Debug,
            category: "stream-chunk".to_string(),
            metadata: Some(json!({
                "stream_id": stream_id,
                "sequence": chunk.sequence,
            })),
        },
        StreamEvent::Completed { result } => {
            let summary = match &result.metrics {
                Some(m) => format!(
                    "{} chunks, {} bytes in {}ms ({:.1} tok/s)",
                    m.total_chunks, m.total_bytes, m.duration_ms, m.tokens_per_second
                ),
                None => format!("{} bytes", result.full_content.len()),
            };
            DebugRecord {
                timestamp,
                content: format!("[{}] Stream completed: {}", short_id(&result.stream_id), summary),
                level: LogLevel::Info,
                category: "stream".to_string(),
                metadata: Some(json!({
                    "stream_id": result.stream_id,
                    "context": result.metadata.context,
                    "model": result.metadata.model,
                    "metrics": result.metrics,
                })),
            }
        }
        StreamEvent::Error { stream_id, error, .. } => DebugRecord {
            timestamp,
            content: match &error.code {
                Some(code) => format!("[{}] Stream error ({}): {}", short_id(stream_id), code, error.message),
                None => format!("[{}] Stream error: {}", short_id(stream_id), error.message),
            },
            level: LogLevel::Error,
            category: "stream".to_string(),
            metadata: Some(json!({
                "stream_id": stream_id,
                "code": error.code,
                "details": error.details,
            })),
        },
        StreamEvent::Cancelled { stream_id, reason, .. } => DebugRecord {
            timestamp,
            content: match reason {
                Some(reason) => format!("[{}] Stream cancelled: {}", short_id(stream_id), reason),
                None => format!("[{}] Stream cancelled", short_id(stream_id)),
            },
            level: LogLevel::Warn,
            category: "stream".to_string(),
            metadata: Some(json!({ "stream_id": stream_id, "reason": reason })),
        },
        StreamEvent::DebugOutput {
            message,
            level,
            source,
            data,
            ..
        } => DebugRecord {
            timestamp,
            content: message.clone(),
            level: *level,
            category: source.clone(),
            metadata: data.clone(),
        },
        StreamEvent::Log { entry } => format_log_entry(entry),
    }
}

/// Render an entry produced by the logging facade
pub fn format_log_entry(entry: &LogEntry) -> DebugRecord {
    DebugRecord {
        timestamp: entry.timestamp,
        content: entry.message.clone(),
        level: entry.level,
        category: entry.source.clone(),
        metadata: entry.data.clone(),
    }
}

/// Render an event that arrived as raw JSON
///
/// Anything that does not decode as a known event becomes an "unknown
/// event" record; this never fails.
pub fn format_raw(value: &serde_json::Value) -> DebugRecord {
    if let Ok(event) = serde_json::from_value::<StreamEvent>(value.clone()) {
        return format_event(&event);
    }
    if let Ok(entry) = serde_json::from_value::<LogEntry>(value.clone()) {
        return format_log_entry(&entry);
    }

    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("<untyped>");
    let timestamp = value
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    DebugRecord {
        timestamp,
        content: format!("Unknown event: {}", event_type),
        level: LogLevel::Debug,
        category: "unknown".to_string(),
        metadata: Some(value.clone()),
    }
}

fn short_id(stream_id: &str) -> &str {
    let end = stream_id.char_indices().nth(8).map(|(i, _)| i).unwrap_or(stream_id.len());
    &stream_id[..end]
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() { format!("{}...", head) } else { head }
}
