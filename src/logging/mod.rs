//! Logging configuration and initialization
//!
//! Centralized logging setup on the `tracing` ecosystem, with human-readable
//! or JSON output selected via environment variables or programmatically.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "info", "gradforge=trace")
//! - `GRADFORGE_LOG_LEVEL`: simple level (error, warn, info, debug, trace)
//! - `GRADFORGE_LOG_FORMAT`: output format ("human" or "json")

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "GRADFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "GRADFORGE_LOG_FORMAT";

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize logging from the environment. Idempotent; safe to call from
/// multiple tests or embedding applications.
pub fn init_logging_default() {
    TRACING_INITIALIZED.get_or_init(|| {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        // RUST_LOG wins over the crate-specific level variable.
        let filter = match std::env::var("RUST_LOG") {
            Ok(spec) => {
                EnvFilter::try_new(spec).unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()))
            }
            Err(_) => EnvFilter::new(level.as_filter_str()),
        };

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(false))
                .try_init(),
            LogFormat::Human => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .try_init(),
        };
        // Another subscriber may already be installed by the embedder.
        if let Err(err) = result {
            eprintln!("gradforge: logging init skipped: {}", err);
        }
    });
}

/// Check if tracing has been initialized by this crate.
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
