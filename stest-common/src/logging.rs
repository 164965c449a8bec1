//! Logging setup shared by the `stest` binary and integration tests.
//!
//! Filters come from `STEST_LOG` (full `EnvFilter` directives) or
//! `STEST_LOG_LEVEL`, falling back to the level the caller passes.

use std::path::{Path, PathBuf};

use crate::config::env::EnvParser;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Output format of the console sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Where and how to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    directives: Option<String>,
    format: LogFormat,
    stderr: bool,
    file: Option<PathBuf>,
}

impl LogConfig {
    /// Start from the environment with `default_level` as fallback.
    pub fn from_env(default_level: &str) -> Self {
        // Nothing is listening yet, so a malformed value just keeps the default.
        let mut env = EnvParser::new();
        let level = env.get_log_level("LOG_LEVEL", default_level).value;
        let directives = env.get_optional_string("LOG").value;
        let format = match env.get_optional_string("LOG_FORMAT").value.as_deref() {
            Some(f) if f.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        Self {
            level,
            directives,
            format,
            stderr: false,
            file: None,
        }
    }

    /// Write console output to stderr so stdout stays machine readable.
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Override the level. Explicit `STEST_LOG` directives still win.
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Also write JSON lines to `path` through a non-blocking writer.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        let spec = self.directives.clone().unwrap_or_else(|| {
            format!(
                "stest={level},stest_common={level},warn",
                level = self.level
            )
        });
        EnvFilter::try_new(spec).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps background log writers alive. Drop it at the end of `main`.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

fn file_writer(
    path: &Path,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    let appender = tracing_appender::rolling::never(dir, name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuards> {
    let mut guards = LoggingGuards::default();

    let file_layer = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            guards._file = Some(guard);
            Some(fmt::layer().json().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    let (pretty, json) = match (config.format, config.stderr) {
        (LogFormat::Pretty, true) => (
            Some(fmt::layer().with_writer(std::io::stderr).boxed()),
            None,
        ),
        (LogFormat::Pretty, false) => (Some(fmt::layer().boxed()), None),
        (LogFormat::Json, true) => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr).boxed()),
        ),
        (LogFormat::Json, false) => (None, Some(fmt::layer().json().boxed())),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(file_layer)
        .with(pretty)
        .with(json)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guards)
}
