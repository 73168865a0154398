//! Logging setup
//!
//! Endpoints log through `tracing`. Embedders that do not install their
//! own subscriber can have either endpoint do it: a [`LogConfig`] attached
//! to `ServerConfig` or `ClientConfig` is installed when the endpoint is
//! created, and the first install wins. Standalone use via
//! [`init_logging`] is also supported.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Filter applied when `RUST_LOG` is not set
const DEFAULT_FILTER: &str = "wsrpc=info";

/// Errors installing the logging subscriber
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("cannot open log file: {0}")]
    File(#[from] io::Error),

    #[error("a logging subscriber is already installed")]
    AlreadyInstalled,
}

/// Logging configuration carried by `ServerConfig` and `ClientConfig`
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Tracing filter directives (e.g., "wsrpc=debug")
    pub filter: String,
    /// Optional log file; stderr when absent
    pub file_path: Option<PathBuf>,
    /// Emit structured JSON instead of the human-readable format
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read configuration from `RUST_LOG`, `WSRPC_LOG_FILE`, and
    /// `WSRPC_LOG_JSON`
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("RUST_LOG").ok(),
            env::var("WSRPC_LOG_FILE").ok(),
            env::var("WSRPC_LOG_JSON").ok(),
        )
    }

    fn from_vars(
        filter: Option<String>,
        file_path: Option<String>,
        json: Option<String>,
    ) -> Self {
        Self {
            filter: filter.unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            file_path: file_path.map(PathBuf::from),
            json_format: matches!(json.as_deref(), Some("1" | "true")),
        }
    }

    /// Override the filter directives
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Log to a file instead of stderr
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Enable or disable JSON output
    pub fn with_json(mut self, json: bool) -> Self {
        self.json_format = json;
        self
    }
}

/// Install the global logging subscriber described by `config`
///
/// Fails with [`LoggingError::AlreadyInstalled`] when a subscriber is
/// already set, so competing endpoints leave the first install in place.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| LoggingError::Filter(e.to_string()))?;

    let layer = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            fmt_layer(config.json_format, false, file)
        }
        None => fmt_layer(config.json_format, true, io::stderr),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)
}

/// Build the format layer for a writer; ANSI colors only make sense on
/// a terminal, never in JSON or file output
fn fmt_layer<W>(json: bool, ansi: bool, writer: W) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed()
    }
}

/// Install logging for an endpoint if its config asks for it
///
/// An earlier install wins; any other failure is reported on stderr
/// since there may be no subscriber to log it through.
pub(crate) fn install_for_endpoint(config: &Option<LogConfig>) {
    let Some(config) = config else {
        return;
    };
    match init_logging(config) {
        Ok(()) => {}
        Err(LoggingError::AlreadyInstalled) => {
            tracing::debug!("logging subscriber already installed");
        }
        Err(e) => eprintln!("wsrpc: failed to initialize logging: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_this_crate() {
        let config = LogConfig::default();
        assert_eq!(config.filter, "wsrpc=info");
        assert!(config.file_path.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn from_vars_parses_each_knob() {
        let config = LogConfig::from_vars(
            Some("wsrpc=trace".to_string()),
            Some("/tmp/wsrpc.log".to_string()),
            Some("true".to_string()),
        );
        assert_eq!(config.filter, "wsrpc=trace");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/wsrpc.log")));
        assert!(config.json_format);

        let config = LogConfig::from_vars(None, None, Some("0".to_string()));
        assert_eq!(config.filter, DEFAULT_FILTER);
        assert!(config.file_path.is_none());
        assert!(!config.json_format);
    }

    #[test]
    fn builders_override_fields() {
        let config = LogConfig::default()
            .with_filter("wsrpc=debug")
            .with_file("/tmp/out.log")
            .with_json(true);
        assert_eq!(config.filter, "wsrpc=debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/out.log")));
        assert!(config.json_format);
    }

    #[test]
    fn init_logging_installs_once_and_validates_the_file() {
        let path = std::env::temp_dir().join(format!("wsrpc-log-test-{}.log", std::process::id()));
        let config = LogConfig::default().with_file(path.clone()).with_json(true);

        // Another test in this binary may have installed a subscriber
        // first; both outcomes leave one installed.
        let first = init_logging(&config);
        assert!(first.is_ok() || matches!(first, Err(LoggingError::AlreadyInstalled)));
        tracing::info!("logging exercised");

        match init_logging(&LogConfig::default()) {
            Err(LoggingError::AlreadyInstalled) => {}
            other => panic!("expected AlreadyInstalled, got {other:?}"),
        }

        // The file is opened before the install attempt, so a bad path
        // fails regardless of subscriber state.
        let missing = LogConfig::default().with_file("/nonexistent-wsrpc-dir/out.log");
        match init_logging(&missing) {
            Err(LoggingError::File(_)) => {}
            other => panic!("expected File error, got {other:?}"),
        }

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn install_for_endpoint_tolerates_every_outcome() {
        install_for_endpoint(&None);
        install_for_endpoint(&Some(LogConfig::default()));
        // Repeat: whichever call installed first, this one is a no-op.
        install_for_endpoint(&Some(LogConfig::default()));
    }
}
