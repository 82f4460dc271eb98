//! Logging setup for MDP binaries
//!
//! Console lines go to stderr. Setting `MDP_LOG_DIR` also writes a
//! daily-rotated `{prefix}.YYYY-MM-DD` file there, which is how scheduled
//! ingestion runs keep their history.
//!
//! Library code never prints; it logs with structured fields, inside the
//! per-source span the orchestrator opens:
//!
//! ```rust
//! use tracing::warn;
//!
//! let source_id = "obis";
//! let attempt = 2;
//! warn!(source_id, attempt, delay_ms = 1000u64, "Retrying after transient error");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mdp_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::builder()
//!         .level(LogLevel::Debug)
//!         .log_file_prefix("mdp-ingest")
//!         .build()
//!         .merge_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Ingestion started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// HTTP client internals are noisy at debug level
const DEFAULT_QUIET_DIRECTIVES: &[&str] = &["hyper=warn", "hyper_util=warn", "h2=warn", "reqwest=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

/// Logging configuration
///
/// Built by the binary from its CLI flags, then overridden by `MDP_LOG_*`:
///
/// - `MDP_LOG_LEVEL`: trace, debug, info, warn, error
/// - `MDP_LOG_FORMAT`: text or json
/// - `MDP_LOG_DIR`: directory for rotated log files
/// - `MDP_LOG_FILTER`: extra comma-separated directives, e.g. `mdp_ingest::dedup=trace`
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    /// JSON lines instead of human-readable text
    pub json: bool,
    /// File output is off unless set
    pub log_dir: Option<PathBuf>,
    pub log_file_prefix: String,
    pub filter_directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            log_dir: None,
            log_file_prefix: "mdp".to_string(),
            filter_directives: None,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Override fields with any `MDP_LOG_*` variables set
    pub fn merge_env(mut self) -> Result<Self> {
        if let Ok(level) = std::env::var("MDP_LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Ok(format) = std::env::var("MDP_LOG_FORMAT") {
            self.json = match format.to_lowercase().as_str() {
                "json" => true,
                "text" => false,
                _ => anyhow::bail!("Invalid log format: {}", format),
            };
        }
        if let Ok(dir) = std::env::var("MDP_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Ok(filter) = std::env::var("MDP_LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter =
            EnvFilter::from_default_env().add_directive(self.level.to_tracing_level().into());

        let extra = self.filter_directives.as_deref().unwrap_or_default().split(',');
        for directive in DEFAULT_QUIET_DIRECTIVES.iter().copied().chain(extra) {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
            );
        }

        Ok(filter)
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn fmt_layer<W>(json: bool, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    // Source spans report their duration when they close
    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(ansi);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global tracing subscriber
///
/// Call once at startup. With file output the returned guard must be held
/// until exit so buffered lines are flushed.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers = vec![fmt_layer(config.json, std::io::stderr, true)];
    let mut guard = None;

    if let Some(ref dir) = config.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, &config.log_file_prefix);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config.json, non_blocking, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_builder_defaults_to_console_only() {
        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .log_file_prefix("mdp-ingest")
            .build();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.log_file_prefix, "mdp-ingest");
        assert!(config.log_dir.is_none());
        assert!(!config.json);
    }

    #[test]
    fn test_filter_directives() {
        let config = LogConfig {
            filter_directives: Some("mdp_ingest::dedup=trace, ".to_string()),
            ..Default::default()
        };
        assert!(config.env_filter().is_ok());

        let config = LogConfig {
            filter_directives: Some("reqwest=verbose!!".to_string()),
            ..Default::default()
        };
        assert!(config.env_filter().is_err());
    }
}
