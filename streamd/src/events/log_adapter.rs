//! Leveled logging facade that also publishes to the event bus
//!
//! Components that want their log lines visible in the debug terminal and
//! the session log use a `BusLogger`: each call goes to `tracing` and is
//! emitted as a `log:entry` event.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::bus::EventBus;
use super::types::{LogEntry, LogLevel, StreamEvent};

#[derive(Clone)]
pub struct BusLogger {
    bus: EventBus,
    source: String,
}

impl BusLogger {
    pub fn new(bus: EventBus, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, None);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message, None);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, None);
    }

    /// Log with optional structured data attached to the forwarded entry
    pub fn log(&self, level: LogLevel, message: &str, data: Option<serde_json::Value>) {
        let source = self.source.as_str();
        match level {
            LogLevel::Debug => debug!(%source, "{}", message),
            LogLevel::Info => info!(%source, "{}", message),
            LogLevel::Warn => warn!(%source, "{}", message),
            LogLevel::Error => error!(%source, "{}", message),
        }
        self.bus.emit(StreamEvent::Log {
            entry: LogEntry {
                timestamp: Utc::now(),
                level,
                source: self.source.clone(),
                message: message.to_string(),
                data,
            },
        });
    }
}
