//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` fmt subscriber filtered by `EnvFilter`.
//! `RUST_LOG` takes precedence over the configured level. Initialization
//! happens at most once per process; later calls are ignored.

use std::env;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Configuration for logging initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level for this crate: trace, debug, info, warn or error
    pub level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
    /// Include the module target in each line
    pub include_target: bool,
    /// Include file and line number
    pub include_location: bool,
    /// Include thread ids and names
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            include_target: true,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// JSON output with location and thread metadata.
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_target: true,
            include_location: true,
            include_thread_ids: true,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Parsed level, INFO when the configured value is not recognised.
    pub fn level(&self) -> Level {
        parse_level(&self.level)
    }
}

/// Parse a level name case-insensitively, defaulting to INFO.
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let directive = format!("{}={}", env!("CARGO_PKG_NAME"), config.level());
    let filter = EnvFilter::from_default_env();
    match directive.parse() {
        Ok(directive) if env::var("RUST_LOG").is_err() => filter.add_directive(directive),
        _ => filter,
    }
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(config);
        let result = if config.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .try_init()
        };
        if let Err(err) = result {
            eprintln!("phaseward: logging already initialised: {}", err);
        }
    });
}

/// Initialize from `PHASEWARD_LOG_LEVEL` and `PHASEWARD_LOG_JSON`.
pub fn init_from_env() {
    let mut config = LoggingConfig::default();
    if let Ok(level) = env::var("PHASEWARD_LOG_LEVEL") {
        config.level = level;
    }
    if let Some(json) = env::var("PHASEWARD_LOG_JSON")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
    {
        config.json = json;
    }
    init(&config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level(" warn "), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn test_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level(), Level::INFO);
        assert!(!config.json);
        assert!(LoggingConfig::production().json);
        assert_eq!(LoggingConfig::with_level("debug").level(), Level::DEBUG);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(&LoggingConfig::with_level("debug"));
        init(&LoggingConfig::production());
        init_from_env();
        tracing::info!("logging initialised twice without panicking");
    }
}
