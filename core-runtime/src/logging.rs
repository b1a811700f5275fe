//! # Logging & Tracing Infrastructure
//!
//! Provides structured logging with the `tracing` crate, supporting:
//! - JSON, pretty and compact output formats
//! - Per-crate filtering (`EnvFilter`)
//! - Redaction helpers for credentials, originator emails and local paths
//! - Integration with host logging via `LoggerSink`
//! - Span contexts around pipeline runs and reconciliation ticks
//!
//! ## Overview
//!
//! This module configures the `tracing-subscriber` infrastructure and provides
//! utilities for forwarding logs to platform-specific logging systems through
//! the `LoggerSink` trait. When a sink is configured, every event that survives
//! filtering is mirrored to the host logger while still flowing through the
//! standard `tracing` layers.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::time::LogLevel;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = LoggingConfig::default()
//!         .with_format(LogFormat::Pretty)
//!         .with_level(LogLevel::Debug);
//!
//!     init_logging(config).expect("Failed to initialize logging");
//!
//!     tracing::info!("Notes core started");
//! }
//! ```
//!
//! ## LoggerSink integration
//!
//! Provide a custom `LoggerSink` to mirror log events into a host-specific
//! pipeline (e.g., `os_log`/`Logcat`). The sink receives structured
//! [`LogEntry`](bridge_traits::time::LogEntry) instances with the original
//! message plus any fields emitted on the event.
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LoggingConfig};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(HostLogger::connect()?);
//! let config = LoggingConfig::default().with_logger_sink(sink);
//! init_logging(config)?;
//! tracing::warn!(target: "core_sync", "Remote store slow to respond");
//! ```

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    filter::EnvFilter,
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format with colors
    Pretty,
    /// Structured JSON format for machine parsing
    Json,
    /// Compact format for production
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Logging configuration
#[derive(Clone)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Minimum log level
    pub level: LogLevel,
    /// Enable PII redaction
    pub redact_pii: bool,
    /// Custom filter string (e.g., "core_pipeline=debug,core_sync=trace")
    pub filter: Option<String>,
    /// Optional logger sink for forwarding logs to host
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Enable span contexts for distributed tracing
    pub enable_spans: bool,
    /// Display target module in logs
    pub display_target: bool,
    /// Display thread info
    pub display_thread_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            redact_pii: true,
            filter: None,
            logger_sink: None,
            enable_spans: true,
            display_target: true,
            display_thread_info: false,
        }
    }
}

impl LoggingConfig {
    /// Set log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set minimum log level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Enable or disable PII redaction
    pub fn with_pii_redaction(mut self, redact: bool) -> Self {
        self.redact_pii = redact;
        self
    }

    /// Set custom filter string
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set logger sink for host integration
    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    /// Enable or disable span contexts
    pub fn with_spans(mut self, enable: bool) -> Self {
        self.enable_spans = enable;
        self
    }

    /// Enable or disable target display
    pub fn with_target(mut self, display: bool) -> Self {
        self.display_target = display;
        self
    }

    /// Enable or disable thread info
    pub fn with_thread_info(mut self, display: bool) -> Self {
        self.display_thread_info = display;
        self
    }
}

/// Initialize the logging system
///
/// This should be called once during application startup. Subsequent calls
/// will return an error.
///
/// # Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - Configuration is invalid
///
/// # Example
///
/// ```ignore
/// use core_runtime::logging::{LoggingConfig, init_logging};
///
/// let config = LoggingConfig::default();
/// init_logging(config)?;
/// ```
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;

    match config.format {
        LogFormat::Pretty => init_pretty_logging(config, filter),
        LogFormat::Json => init_json_logging(config, filter),
        LogFormat::Compact => init_compact_logging(config, filter),
    }
}

/// Crates whose events are shown at the configured level by default
const WORKSPACE_CRATES: &[&str] = &[
    "core_runtime",
    "core_pipeline",
    "core_sync",
    "core_service",
    "bridge_desktop",
];

/// Dependencies capped at `warn` unless a custom filter is given
const QUIET_DEPENDENCIES: &[&str] = &["sqlx"];

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let base_level = match config.level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };

    let filter_string = if let Some(custom_filter) = &config.filter {
        custom_filter.clone()
    } else {
        // Default filter: our crates at specified level, dependencies at warn
        WORKSPACE_CRATES
            .iter()
            .map(|krate| format!("{}={}", krate, base_level))
            .chain(QUIET_DEPENDENCIES.iter().map(|dep| format!("{}=warn", dep)))
            .collect::<Vec<_>>()
            .join(",")
    };

    EnvFilter::try_new(filter_string)
        .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
}

fn init_pretty_logging(config: LoggingConfig, filter: EnvFilter) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_span_events(if config.enable_spans {
            tracing_subscriber::fmt::format::FmtSpan::ACTIVE
        } else {
            tracing_subscriber::fmt::format::FmtSpan::NONE
        })
        .with_writer(io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(LoggerSinkLayer::new(config.logger_sink.clone(), config.redact_pii));

    subscriber
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn init_json_logging(config: LoggingConfig, filter: EnvFilter) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(config.enable_spans)
        .with_span_list(config.enable_spans)
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_writer(io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(LoggerSinkLayer::new(config.logger_sink.clone(), config.redact_pii));

    subscriber
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn init_compact_logging(config: LoggingConfig, filter: EnvFilter) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(config.display_target)
        .with_thread_ids(config.display_thread_info)
        .with_thread_names(config.display_thread_info)
        .with_writer(io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(LoggerSinkLayer::new(config.logger_sink.clone(), config.redact_pii));

    subscriber
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

/// Layer that forwards events to a `LoggerSink` implementation.
struct LoggerSinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl LoggerSinkLayer {
    fn new(sink: Option<Arc<dyn LoggerSink>>, redact: bool) -> Self {
        Self { sink, redact }
    }
}

impl<S> Layer<S> for LoggerSinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let metadata = event.metadata();
        let level = tracing_level_to_log_level(*metadata.level());

        if level < sink.min_level() {
            return;
        }

        let mut visitor = SinkVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .unwrap_or_else(|| metadata.name().to_string());

        let mut entry = LogEntry::new(level, metadata.target(), message);

        for (key, value) in visitor.fields {
            let value = if self.redact {
                redact_if_sensitive(&key, &value)
            } else {
                value
            };
            entry = entry.with_field(key, value);
        }

        if let Some(span) = ctx.lookup_current() {
            entry.span_id = Some(span.name().to_string());
        }

        let sink = Arc::clone(sink);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = sink.log(entry).await {
                    eprintln!("LoggerSink error: {}", err);
                }
            });
            return;
        }

        if let Err(err) = futures::executor::block_on(sink.log(entry)) {
            eprintln!("LoggerSink error: {}", err);
        }
    }
}

#[derive(Default)]
struct SinkVisitor {
    message: Option<String>,
    fields: HashMap<String, String>,
}

impl SinkVisitor {
    fn record_value(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for SinkVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, format!("{:?}", value));
    }
}

fn tracing_level_to_log_level(level: tracing::Level) -> LogLevel {
    match level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// Helper function to redact sensitive field values
///
/// This should be used when manually constructing log entries:
///
/// ```ignore
/// use tracing::info;
/// use core_runtime::logging::redact_if_sensitive;
///
/// let token = "sensitive_token_value";
/// info!(token = %redact_if_sensitive("token", token), "Retrieved token");
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    const SENSITIVE_FIELDS: &[&str] = &[
        "token",
        "password",
        "secret",
        "api_key",
        "authorization",
        "bearer",
        "credential",
        "payload",
    ];

    let field_lower = field_name.to_lowercase();
    if SENSITIVE_FIELDS.iter().any(|&f| field_lower.contains(f)) {
        "[REDACTED]".to_string()
    } else if value.contains('@') && value.contains('.') {
        // Likely an email - redact domain but keep first char
        if let Some(at_pos) = value.find('@') {
            format!("{}***@[REDACTED]", &value[..1.min(at_pos)])
        } else {
            value.to_string()
        }
    } else {
        value.to_string()
    }
}

/// Strip full file paths to basename only for privacy
///
/// Useful when logging file operations:
///
/// ```ignore
/// use tracing::info;
/// use core_runtime::logging::strip_path;
///
/// let path = "/home/ana/attachments/2024/board.png";
/// info!(file = %strip_path(path), "Uploading attachment");
/// // Logs: file="board.png"
/// ```
pub fn strip_path(path: &str) -> &str {
    path.rsplit('/')
        .next()
        .unwrap_or(path)
        .rsplit('\\')
        .next()
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as SinkResult;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::default()
            .with_format(LogFormat::Json)
            .with_level(LogLevel::Debug)
            .with_pii_redaction(true)
            .with_filter("core_pipeline=trace")
            .with_spans(true)
            .with_target(true)
            .with_thread_info(true);

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.redact_pii);
        assert_eq!(config.filter, Some("core_pipeline=trace".to_string()));
        assert!(config.enable_spans);
        assert!(config.display_target);
        assert!(config.display_thread_info);
    }

    #[test]
    fn test_redact_if_sensitive() {
        // Tokens should be redacted
        assert_eq!(
            redact_if_sensitive("access_token", "secret123"),
            "[REDACTED]"
        );
        assert_eq!(redact_if_sensitive("token", "abc"), "[REDACTED]");
        assert_eq!(redact_if_sensitive("password", "pass"), "[REDACTED]");
        assert_eq!(redact_if_sensitive("payload_preview", "ffd8ff"), "[REDACTED]");

        // Emails should be partially redacted
        let redacted = redact_if_sensitive("email", "user@example.com");
        assert!(redacted.starts_with('u'));
        assert!(redacted.contains("[REDACTED]"));

        // Normal values should pass through
        assert_eq!(redact_if_sensitive("unit_id", "12345"), "12345");
        assert_eq!(redact_if_sensitive("name", "whiteboard.png"), "whiteboard.png");
    }

    #[test]
    fn test_strip_path() {
        assert_eq!(strip_path("/home/user/attachments/scan.pdf"), "scan.pdf");
        assert_eq!(strip_path("C:\\Users\\Ana\\Notes\\scan.pdf"), "scan.pdf");
        assert_eq!(strip_path("scan.pdf"), "scan.pdf");
        assert_eq!(strip_path("/var/log/"), "");
    }

    #[test]
    fn test_default_format() {
        #[cfg(debug_assertions)]
        assert_eq!(LogFormat::default(), LogFormat::Pretty);

        #[cfg(not(debug_assertions))]
        assert_eq!(LogFormat::default(), LogFormat::Json);
    }

    #[test]
    fn test_build_filter() {
        let config = LoggingConfig::default().with_level(LogLevel::Debug);
        let filter = build_filter(&config).unwrap().to_string();
        assert!(filter.contains("core_pipeline=debug"));
        assert!(filter.contains("sqlx=warn"));
    }

    #[test]
    fn test_build_custom_filter() {
        let config = LoggingConfig::default().with_filter("core_pipeline=trace,core_sync=debug");
        let filter = build_filter(&config).unwrap();
        assert!(filter.to_string().contains("core_pipeline=trace"));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LoggingConfig::default().with_filter("core_sync=[[");
        assert!(matches!(build_filter(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_logger_sink_layer_forwards_event() {
        let sink = Arc::new(TestLoggerSink::default());
        let trait_sink: Arc<dyn LoggerSink> = sink.clone();
        let layer = LoggerSinkLayer::new(Some(trait_sink), true);
        let subscriber = tracing_subscriber::registry().with(layer);
        let _guard = tracing::subscriber::set_default(subscriber);

        tracing::info!(
            target: "test.target",
            originator = "ana",
            api_key = "k-123",
            "session flushed"
        );

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.target, "test.target");
        assert_eq!(entry.message, "session flushed");
        assert_eq!(entry.fields.get("originator"), Some(&"ana".to_string()));
        assert_eq!(entry.fields.get("api_key"), Some(&"[REDACTED]".to_string()));
    }

    #[derive(Default)]
    struct TestLoggerSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LoggerSink for TestLoggerSink {
        async fn log(&self, entry: LogEntry) -> SinkResult<()> {
            let mut entries = self.entries.lock().unwrap();
            entries.push(entry);
            Ok(())
        }

        fn min_level(&self) -> LogLevel {
            LogLevel::Trace
        }
    }
}
