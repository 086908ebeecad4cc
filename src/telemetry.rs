//! Telemetry and tracing utilities
//!
//! Sets up the global tracing subscriber for the relay process. Console logs
//! are written to stderr; stdout is reserved for published events.
//!
//! ## Example
//!
//! ```rust,ignore
//! use flow_relay::telemetry::{init_subscriber, OutputFormat, SubscriberConfig};
//!
//! let config = SubscriberConfig::builder()
//!     .log_level(tracing::Level::DEBUG)
//!     .output_format(OutputFormat::Json)
//!     .build();
//! let _guard = init_subscriber(config)?;
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

use crate::error::{RelayError, Result};

/// Output format for tracing logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON format
    Json,
    /// Compact JSON format
    JsonCompact,
}

/// Configuration for tracing subscriber
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub log_level: tracing::Level,
    pub output_format: OutputFormat,
    /// Log file path; when set, logs go to the file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            output_format: OutputFormat::Text,
            log_file: None,
        }
    }
}

impl SubscriberConfig {
    pub fn builder() -> SubscriberConfigBuilder {
        SubscriberConfigBuilder::default()
    }
}

/// Builder for SubscriberConfig
#[derive(Debug, Default)]
pub struct SubscriberConfigBuilder {
    log_level: Option<tracing::Level>,
    output_format: Option<OutputFormat>,
    log_file: Option<PathBuf>,
}

impl SubscriberConfigBuilder {
    /// Set the log level
    pub fn log_level(mut self, level: tracing::Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Set the log level from a string
    pub fn log_level_str(mut self, level: &str) -> Result<Self> {
        let level = match level.trim().to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => {
                return Err(RelayError::Configuration(format!(
                    "Invalid log level: {level}. Valid options: trace, debug, info, warn, error"
                )));
            }
        };
        self.log_level = Some(level);
        Ok(self)
    }

    /// Set the output format from a string
    pub fn output_format_str(mut self, format: &str) -> Result<Self> {
        let format = match format.trim().to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "json-compact" => OutputFormat::JsonCompact,
            "text" => OutputFormat::Text,
            _ => {
                return Err(RelayError::Configuration(format!(
                    "Invalid log format: {format}. Valid options: text, json, json-compact"
                )));
            }
        };
        self.output_format = Some(format);
        Ok(self)
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    pub fn log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    pub fn build(self) -> SubscriberConfig {
        SubscriberConfig {
            log_level: self.log_level.unwrap_or(tracing::Level::INFO),
            output_format: self.output_format.unwrap_or_default(),
            log_file: self.log_file,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Both writers (stderr and file) are non-blocking, so a `WorkerGuard` is
/// returned whenever this call installs the subscriber; keep it alive for the
/// lifetime of the process so buffered lines get flushed. Calling this when a
/// subscriber is already installed is not an error and returns `None`.
pub fn init_subscriber(config: SubscriberConfig) -> Result<Option<WorkerGuard>> {
    let level = config.log_level.as_str().to_lowercase();
    let filter = EnvFilter::new(format!("flow_relay={level}"));

    let (writer, guard) = make_writer(&config)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    let init_result = match config.output_format {
        OutputFormat::Json => builder.json().try_init(),
        OutputFormat::JsonCompact => builder.json().flatten_event(true).try_init(),
        OutputFormat::Text => builder.with_ansi(config.log_file.is_none()).try_init(),
    };

    match init_result {
        Ok(()) => Ok(Some(guard)),
        Err(e) => {
            if e.to_string().contains("already been set") {
                Ok(None)
            } else {
                Err(RelayError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        }
    }
}

/// Non-blocking writer for the configured destination.
fn make_writer(config: &SubscriberConfig) -> Result<(NonBlocking, WorkerGuard)> {
    match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path.file_name().ok_or_else(|| {
                RelayError::Configuration(format!("Invalid log file path: {}", path.display()))
            })?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            Ok(tracing_appender::non_blocking(appender))
        }
        None => Ok(tracing_appender::non_blocking(std::io::stderr())),
    }
}

/// Initialize tracing subscriber from environment variables
///
/// - `FLOW_RELAY_LOG_LEVEL`: trace, debug, info, warn, error
/// - `FLOW_RELAY_LOG_FORMAT`: text, json, json-compact
/// - `FLOW_RELAY_LOG_FILE`: log file path
pub fn init_from_env() -> Result<Option<WorkerGuard>> {
    init_subscriber(config_from_lookup(|key| std::env::var(key).ok())?)
}

fn config_from_lookup<F>(lookup: F) -> Result<SubscriberConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = SubscriberConfig::builder();

    if let Some(level) = lookup("FLOW_RELAY_LOG_LEVEL") {
        builder = builder.log_level_str(&level)?;
    }
    if let Some(format) = lookup("FLOW_RELAY_LOG_FORMAT") {
        builder = builder.output_format_str(&format)?;
    }
    if let Some(path) = lookup("FLOW_RELAY_LOG_FILE") {
        builder = builder.log_file(PathBuf::from(path));
    }

    Ok(builder.build())
}

/// Mask a secret for logging, keeping only a short prefix and suffix.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
