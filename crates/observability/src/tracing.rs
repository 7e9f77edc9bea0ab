//! Tracing/logging initialization.
//!
//! - Filter from `RUST_LOG` (default `info`)
//! - JSON lines by default, human-readable with `SAKSFLYT_LOG_FORMAT=pretty`
//! - Every saga log line carries the dispatch span (event, case id, correlation id, hop)

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the output format.
pub const ENV_LOG_FORMAT: &str = "SAKSFLYT_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "compact" => Self::Pretty,
            _ => Self::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or unparsable.
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            format: lookup(ENV_LOG_FORMAT)
                .map(|raw| LogFormat::parse(&raw))
                .unwrap_or_default(),
            ..Self::default()
        }
    }
}

/// Initialize tracing from the environment.
pub fn init() {
    init_with(&ObservabilityConfig::from_env());
}

/// Initialize tracing with an explicit configuration.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_with(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_target(false)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
