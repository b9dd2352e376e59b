//! Logging setup
//!
//! Embedders that already run their own `tracing` subscriber can skip
//! this module; `init_logging` is a convenience bootstrapper for
//! binaries that want env-driven output selection. Wire traffic is
//! logged with the id of the binding that carried it, so interleaved
//! frames from a pooled session stay attributable to one server.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Output selection for [`init_logging`]
#[derive(Debug, Clone)]
pub struct LogOptions {
    filter: String,
    file: Option<PathBuf>,
    json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

impl LogOptions {
    /// Read output selection from the environment: `RUST_LOG` for the
    /// filter, `LSP_CONDUIT_LOG_FILE` for an optional file target, and
    /// `LSP_CONDUIT_LOG_JSON=true` for JSON lines
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            filter: env::var("RUST_LOG").unwrap_or(defaults.filter),
            file: env::var("LSP_CONDUIT_LOG_FILE").ok().map(PathBuf::from),
            json: env::var("LSP_CONDUIT_LOG_JSON")
                .map(|value| value == "true")
                .unwrap_or(defaults.json),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn json(&self) -> bool {
        self.json
    }

    fn format_layer(&self) -> Result<BoxedLayer, io::Error> {
        let (writer, ansi) = match &self.file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                (BoxMakeWriter::new(Arc::new(file)), false)
            }
            None => (BoxMakeWriter::new(io::stderr), true),
        };

        let layer = if self.json {
            fmt::layer().json().with_writer(writer).with_ansi(false).boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(true)
                .boxed()
        };

        Ok(layer)
    }
}

/// Install a global subscriber for the given options
pub fn init_logging(options: LogOptions) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_new(options.filter()).or_else(|_| EnvFilter::try_new("info"))?;
    let layer = options.format_layer()?;

    tracing_subscriber::registry().with(layer).with(filter).init();
    Ok(())
}

/// Log one wire frame, tagged with the binding that carried it
#[macro_export]
macro_rules! log_wire_message {
    ($level:expr, $binding:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            binding = $binding,
            direction = $direction,
            method = $method,
            data = ?$data,
            "wire message"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = LogOptions::default();
        assert_eq!(options.filter(), "info");
        assert!(options.file().is_none());
        assert!(!options.json());
    }

    #[test]
    fn test_builder_overrides() {
        let options = LogOptions::default()
            .with_filter("warn")
            .with_file("/custom/path.log")
            .with_json(true);

        assert_eq!(options.filter(), "warn");
        assert_eq!(options.file(), Some(Path::new("/custom/path.log")));
        assert!(options.json());
    }

    #[test]
    fn test_from_env() {
        // Without any variables set, the defaults win
        unsafe {
            env::remove_var("RUST_LOG");
            env::remove_var("LSP_CONDUIT_LOG_FILE");
            env::remove_var("LSP_CONDUIT_LOG_JSON");
        }

        let options = LogOptions::from_env();
        assert_eq!(options.filter(), "info");
        assert!(options.file().is_none());
        assert!(!options.json());

        unsafe {
            env::set_var("RUST_LOG", "debug");
            env::set_var("LSP_CONDUIT_LOG_FILE", "/tmp/conduit.log");
            env::set_var("LSP_CONDUIT_LOG_JSON", "true");
        }

        let options = LogOptions::from_env();
        assert_eq!(options.filter(), "debug");
        assert_eq!(options.file(), Some(Path::new("/tmp/conduit.log")));
        assert!(options.json());

        // Any value other than "true" leaves JSON off
        unsafe {
            env::set_var("LSP_CONDUIT_LOG_JSON", "1");
        }
        assert!(!LogOptions::from_env().json());

        unsafe {
            env::remove_var("RUST_LOG");
            env::remove_var("LSP_CONDUIT_LOG_FILE");
            env::remove_var("LSP_CONDUIT_LOG_JSON");
        }
    }
}
