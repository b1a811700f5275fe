//! Time and Logging Abstractions
//!
//! Injectable time source (session windows and sync scheduling are computed
//! against it) and a sink for forwarding structured logs to the host.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

/// Time source trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::time::Clock;
///
/// fn is_expired(clock: &dyn Clock, last_activity: DateTime<Utc>, window: Duration) -> bool {
///     clock.now() - last_activity > window
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Get current UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Get current Unix timestamp in seconds
    fn unix_timestamp(&self) -> i64 {
        self.now().timestamp()
    }

    /// Get current Unix timestamp in milliseconds
    fn unix_timestamp_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// System clock implementation using actual system time
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
///
/// Used by hosts that replay recorded input and by tests that exercise
/// session windows without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the Unix epoch
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::default())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Target module/component
    pub target: String,
    pub message: String,
    /// Structured fields
    pub fields: HashMap<String, String>,
    /// Name of the innermost span, if any
    pub span_id: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            target: target.into(),
            message: message.into(),
            fields: HashMap::new(),
            span_id: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Logger sink trait
///
/// Mirrors core log events into a host pipeline (journald, a chat-ops
/// channel, a file). Implementations must not log payload bytes or
/// credentials.
#[async_trait::async_trait]
pub trait LoggerSink: Send + Sync {
    /// Forward a log entry to the host logging system
    async fn log(&self, entry: LogEntry) -> Result<()>;

    /// Flush any buffered logs
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Entries below this level are dropped before reaching the sink
    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock;
        let now = clock.now();
        let timestamp = clock.unix_timestamp();

        assert!(timestamp > 0);
        assert!(now.timestamp() <= timestamp);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch();
        assert_eq!(clock.unix_timestamp(), 0);

        clock.advance(Duration::seconds(130));
        assert_eq!(clock.unix_timestamp(), 130);
        assert_eq!(clock.unix_timestamp_millis(), 130_000);
    }

    #[test]
    fn test_log_entry_builder() {
        let entry = LogEntry::new(LogLevel::Warn, "core_pipeline::retry", "Retrying upload")
            .with_field("attempt", "2");

        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.target, "core_pipeline::retry");
        assert_eq!(entry.fields.get("attempt"), Some(&"2".to_string()));
        assert!(entry.span_id.is_none());
    }
}
