//! Structured logging for the MPC node
//!
//! Plain `tracing` macros are used throughout the crate. Events that matter
//! for auditing (nonce reuse, rejected partial signatures, excluded
//! partners) are additionally emitted as JSON `LogEvent`s:
//!
//! ```rust,ignore
//! use mpc_node::logging::{init_logging, log_security_event, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?;
//! log_security_event("nonce_reuse", false, serde_json::json!({"nonce": id}), Some(&req_id));
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// MPC run lifecycle (start, qualified set changes, completion)
    Mpc,
    /// Request confirmation and partial signing
    Signing,
    /// Nonce reuse, rejected partials, excluded partners
    Security,
    /// Startup and shutdown
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (RFC 3339)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    /// Request or MPC id the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

/// Log a security-related event
pub fn log_security_event(
    event_type: &str,
    success: bool,
    details: serde_json::Value,
    correlation_id: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );
    if let Some(id) = correlation_id {
        event = event.with_correlation_id(id);
    }

    if success {
        tracing::info!(target: "mpc_node::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "mpc_node::security", "{}", event.to_json());
    }
}

/// Log the end of an MPC run
pub fn log_mpc_event(
    kind: &str,
    mpc_id: &str,
    success: bool,
    duration_ms: u64,
    details: serde_json::Value,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let event = LogEvent::new(level, EventCategory::Mpc, format!("{} finished", kind))
        .with_correlation_id(mpc_id)
        .with_duration(duration_ms)
        .with_data(details);

    if success {
        tracing::info!(target: "mpc_node::mpc", "{}", event.to_json());
    } else {
        tracing::error!(target: "mpc_node::mpc", "{}", event.to_json());
    }
}

/// Log the outcome of a confirmation request
pub fn log_confirmation_event(req_id: &str, confirmed: bool, details: serde_json::Value) {
    let level = if confirmed { LogLevel::Info } else { LogLevel::Warn };
    let event = LogEvent::new(
        level,
        EventCategory::Signing,
        if confirmed { "request confirmed" } else { "request not confirmed" },
    )
    .with_correlation_id(req_id)
    .with_data(details);

    if confirmed {
        tracing::info!(target: "mpc_node::signing", "{}", event.to_json());
    } else {
        tracing::warn!(target: "mpc_node::signing", "{}", event.to_json());
    }
}

/// Initialize the logging system
///
/// `RUST_LOG` wins over `level` when set. JSON output is meant for
/// production, the pretty format for development.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_filter();
        EnvFilter::new(format!(
            "mpc_node={},tower_http={},axum={}",
            level, level, level
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from the `[logging]` config section
pub fn init_from_config(config: &crate::config::NodeConfig) -> Result<(), LoggingError> {
    init_logging(
        LogLevel::from(config.logging.level.as_str()),
        config.logging.json,
    )
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Correlation id for requests that did not bring one
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
