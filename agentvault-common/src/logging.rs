//! Security-aware logging infrastructure for AgentVault
//!
//! This module provides structured logging with security considerations:
//! - Never logs sensitive information (private keys, recovery phrases, passphrases)
//! - Sanitizes potentially sensitive values (addresses, transaction IDs) in parameters
//! - Categorizes log events by wallet component
//! - Provides both human-readable and machine-parseable output
//!
//! # Usage
//!
//! ```
//! use agentvault_common::logging::{self, LogConfig, LogLevel};
//! use serde_json::json;
//!
//! logging::init(&LogConfig::default()).expect("Failed to initialize logging");
//!
//! logging::log_policy(
//!     LogLevel::Info,
//!     "spend evaluated",
//!     Some(json!({"tier": "micro"})),
//! );
//! ```

use chrono::Local;
use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::sync::Once;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log context categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogContext {
    /// Key vault: lock, unlock, key access
    Security,
    /// Ledger bookkeeping and wallet facade
    Core,
    /// Provider calls and failover
    Network,
    /// Building, signing, broadcasting and tracking
    Transaction,
    /// Spend policy, approvals and limits
    Policy,
    /// Persisted documents
    Storage,
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default log level for all contexts
    pub level: LogLevel,
    /// Path to log file (None for console-only)
    pub log_file: Option<String>,
    /// Whether to include timestamps in log messages
    pub include_timestamps: bool,
    /// Whether to include source location in log messages
    pub include_source_location: bool,
    /// Whether to log to console
    pub console_logging: bool,
    /// Whether to use JSON format for logs (machine-readable)
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
            include_timestamps: true,
            include_source_location: false,
            console_logging: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Minimal configuration used by test suites
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            log_file: None,
            include_timestamps: false,
            include_source_location: false,
            console_logging: false,
            json_format: false,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

static LOGGING_INIT: Once = Once::new();

/// Initialize the logging system with the given configuration
///
/// Safe to call multiple times; only the first call configures the logger.
pub fn init(config: &LogConfig) -> Result<(), String> {
    let mut result = Ok(());

    let include_timestamps = config.include_timestamps;
    let include_source_location = config.include_source_location;
    let json_format = config.json_format;
    let console_logging = config.console_logging;
    let log_file = config.log_file.clone();
    let level = config.level;

    LOGGING_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        if console_logging || log_file.is_some() {
            builder.filter_level(level.into());
        } else {
            builder.filter_level(LevelFilter::Off);
        }

        builder.format(move |buf, record| {
            let timestamp = if include_timestamps {
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
            } else {
                String::new()
            };

            let source_location = if include_source_location {
                format!(
                    " [{}:{}]",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0)
                )
            } else {
                String::new()
            };

            if json_format {
                let json = json!({
                    "timestamp": timestamp,
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "location": source_location,
                    "message": record.args().to_string(),
                });

                writeln!(buf, "{}", json)
            } else {
                if include_timestamps {
                    write!(buf, "{} ", timestamp)?;
                }

                let mut style = buf.style();
                style.set_bold(true);
                writeln!(
                    buf,
                    "[{}{}] {}",
                    style.value(record.level()),
                    source_location,
                    record.args()
                )
            }
        });

        if let Some(file_path) = &log_file {
            match OpenOptions::new().create(true).append(true).open(file_path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(_) => {
                    result = Err(format!("Failed to open log file: {}", file_path));
                    return;
                }
            }
        }

        if let Err(e) = builder.try_init() {
            // Another logger (usually a test harness) got there first
            debug!("Logger already initialized: {}", e);
        }
    });

    result
}

/// Truncate the middle of a potentially sensitive string
///
/// Strings of 8 characters or fewer are masked entirely.
pub fn sanitize_for_logging(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "*****".to_string();
    }

    let first: String = chars[..4].iter().collect();
    let last: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", first, last)
}

/// Sanitize every string value of a JSON parameter object
///
/// Numbers and booleans are kept as-is: amounts and counts are not sensitive.
pub fn sanitize_params(params: serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => json!(sanitize_for_logging(&s)),
                        other => other,
                    };
                    (k, v)
                })
                .collect(),
        ),
        other => other,
    }
}

fn sanitize_and_log(
    level: LogLevel,
    context: LogContext,
    message: &str,
    params: Option<serde_json::Value>,
) {
    match params.map(sanitize_params) {
        Some(p) => log::log!(level.into(), "[{:?}] {} {}", context, message, p),
        None => log::log!(level.into(), "[{:?}] {}", context, message),
    }
}

/// Log a key vault event
pub fn log_security(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Security, message, params);
}

/// Log a core wallet event
pub fn log_core(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Core, message, params);
}

/// Log a network event
pub fn log_network(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Network, message, params);
}

/// Log a transaction event
pub fn log_transaction(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Transaction, message, params);
}

/// Log a policy event
pub fn log_policy(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Policy, message, params);
}

/// Log a storage event
pub fn log_storage(level: LogLevel, message: &str, params: Option<serde_json::Value>) {
    sanitize_and_log(level, LogContext::Storage, message, params);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_are_masked() {
        assert_eq!(sanitize_for_logging("abc"), "*****");
        assert_eq!(sanitize_for_logging(""), "");
    }

    #[test]
    fn long_values_keep_edges() {
        assert_eq!(
            sanitize_for_logging("DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L"),
            "DH5y...mr7L"
        );
    }

    #[test]
    fn params_keep_numbers() {
        let sanitized = sanitize_params(json!({
            "txid": "7967a5185e907a25225574544c31f7b0",
            "amount": 1500,
        }));
        assert_eq!(sanitized["txid"], "7967...f7b0");
        assert_eq!(sanitized["amount"], 1500);
    }
}
