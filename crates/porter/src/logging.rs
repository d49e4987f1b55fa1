//! Tracing setup for the CLI.
//!
//! Logs go to stderr so stdout stays reserved for JSON results.

use std::io;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Resolved logging settings, plus any values that had to be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub rejected: Vec<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            rejected: Vec::new(),
        }
    }
}

impl LogSettings {
    /// Resolve settings from raw flag/config values.
    ///
    /// Values are trimmed and lower-cased; anything unknown falls back to
    /// `info` or `pretty` and is listed in `rejected`.
    pub fn resolve(level: Option<&str>, format: Option<&str>) -> Self {
        let mut settings = Self::default();

        if let Some(raw) = level.map(str::trim).filter(|s| !s.is_empty()) {
            match parse_level(&raw.to_lowercase()) {
                Some(level) => settings.level = level,
                None => settings.rejected.push(format!("log level '{raw}'")),
            }
        }

        if let Some(raw) = format.map(str::trim).filter(|s| !s.is_empty()) {
            match raw.to_lowercase().as_str() {
                "pretty" => settings.format = LogFormat::Pretty,
                "json" => settings.format = LogFormat::Json,
                _ => settings.rejected.push(format!("log format '{raw}'")),
            }
        }

        settings
    }
}

fn parse_level(value: &str) -> Option<Level> {
    match value {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Directives used when `RUST_LOG` is unset.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("porter={level},porter_oci={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides `settings.level`.
pub fn init_tracing(settings: &LogSettings) -> miette::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(settings.level)))
        .map_err(|e| miette::miette!("Failed to create tracing filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match settings.format {
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(io::stderr)
                .with_target(true);
            registry.with(layer).init();
        }
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_current_span(true)
                .with_span_list(true);
            registry.with(layer).init();
        }
    }

    for value in &settings.rejected {
        tracing::warn!(value = %value, "Invalid logging setting, using default");
    }
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        format = ?settings.format,
        "Tracing initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(LogSettings::resolve(None, None), LogSettings::default());
        assert_eq!(LogSettings::resolve(Some("  "), Some("")), LogSettings::default());
    }

    #[test]
    fn test_normalization() {
        let settings = LogSettings::resolve(Some(" DEBUG "), Some("Json"));
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);
        assert!(settings.rejected.is_empty());

        assert_eq!(LogSettings::resolve(Some("Warning"), None).level, Level::WARN);
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let settings = LogSettings::resolve(Some("loud"), Some("xml"));
        assert_eq!(settings.level, Level::INFO);
        assert_eq!(settings.format, LogFormat::Pretty);
        assert_eq!(
            settings.rejected,
            vec!["log level 'loud'".to_string(), "log format 'xml'".to_string()]
        );
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(Level::TRACE), "porter=trace,porter_oci=trace");
    }
}
