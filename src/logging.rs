//! Logging setup for the `wpool` binary and its worker subprocesses.
//!
//! # Environment Variables
//!
//! - `WPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `WPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `WPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `WPOOL_LOG_FILE` - Path to a log file written in addition to stderr
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Internal consistency violations are logged at error level on the
//! `wpool::bug` target, so `WPOOL_LOG=warn,wpool::bug=error` keeps them even
//! in quiet setups.
//!
//! # Example
//!
//! ```no_run
//! use wpool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_cli().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-field human-readable output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration, built up and then handed to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no filter is set (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file; rotated daily
    pub file_path: Option<PathBuf>,
    /// Emit a line when an instrumented span closes, with its timing
    pub span_events: bool,
    /// Filter directive string; wins over `level`
    pub filter: Option<String>,
    /// Show thread names, useful to follow multiplex reader threads
    pub show_thread_names: bool,
    /// Colour stderr output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            span_events: false,
            filter: None,
            show_thread_names: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Preset for the interactive `wpool` commands.
    pub fn for_cli() -> Self {
        Self::default()
    }

    /// Preset for a worker subprocess. Its stderr is often redirected to a
    /// file, so colour is off.
    pub fn for_worker() -> Self {
        Self {
            ansi: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_thread_names(mut self, enabled: bool) -> Self {
        self.show_thread_names = enabled;
        self
    }

    /// Apply `WPOOL_*` and `RUST_LOG` overrides.
    ///
    /// A filter set from the command line is kept; env vars only fill in
    /// what the caller left unset.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("WPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("WPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("WPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("WPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer writing to `writer`.
    fn layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path) -> RollingFileAppender {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("wpool.log");
    RollingFileAppender::new(Rotation::DAILY, parent, file_name)
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let stderr_layer = config.layer(std::io::stderr, config.ansi);
    let file_layer = config
        .file_path
        .as_deref()
        .map(|path| config.layer(file_appender(path), false));

    let _ = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}
