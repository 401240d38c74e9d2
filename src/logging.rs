//! Structured logging setup
//!
//! Human-readable or JSON output on STDOUT, optionally mirrored to an
//! append-mode log file. `RUST_LOG` wins over the configured level.
//!
//! Configuration loading happens before the level is known, so it runs
//! under [`with_bootstrap_logging`], which reports warnings on STDERR.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::fmt::{self, fmt};
use tracing_subscriber::{EnvFilter, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging based on configuration.
///
/// # Errors
///
/// Returns an error if the level is not a valid filter directive, the log
/// file cannot be opened, or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use iot_ingestion::config::LoggingConfig;
/// use iot_ingestion::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
///     include_payload: false,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;

    let mut layers = vec![output_layer(config.json_format, std::io::stdout)];
    if let Some(path) = &config.file_path {
        let file = open_log_file(path)?;
        layers.push(output_layer(config.json_format, Arc::new(file)));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Runs `f` with a temporary STDERR subscriber showing warnings and errors.
///
/// # Examples
///
/// ```no_run
/// use iot_ingestion::cli::Cli;
/// use iot_ingestion::config::Config;
/// use iot_ingestion::logging::with_bootstrap_logging;
///
/// let cli = Cli::default();
/// let config = with_bootstrap_logging(|| Config::load("config/config.yaml", &cli));
/// ```
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    tracing::subscriber::with_default(bootstrap_subscriber(std::io::stderr), f)
}

fn bootstrap_subscriber<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .with_writer(writer)
        .finish()
}

/// Filter from `RUST_LOG` if set, otherwise from `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))
}

fn output_layer<W>(json: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_writer(writer)
            .boxed()
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bootstrap_subscriber_reports_warnings_only() {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = bootstrap_subscriber(move || writer.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("loading configuration");
            tracing::warn!("Invalid value for COORDINATOR_PORT: abc");
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Invalid value for COORDINATOR_PORT: abc"));
        assert!(!output.contains("loading configuration"));
    }

    #[test]
    fn test_build_filter_accepts_levels_and_directives() {
        assert!(build_filter("info").is_ok());
        assert!(build_filter("iot_ingestion=debug,rdkafka=warn").is_ok());
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ingestion.log");
        std::fs::write(&path, "existing\n").unwrap();

        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "appended").unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "existing\nappended\n");
    }

    #[test]
    fn test_open_log_file_missing_directory() {
        let err = open_log_file(Path::new("/nonexistent/dir/ingestion.log")).unwrap_err();
        assert!(err.to_string().contains("Failed to open log file"));
    }
}
