//! Logging setup for the GPU fan daemon

use crate::config::{LoggingConfig, DEFAULT_LOG_PATH};
use crate::errors::Result;
use fern::Dispatch;
use log::{debug, warn, LevelFilter};

/// Where log records go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Json,
    File(std::path::PathBuf),
}

/// Resolved output and level, plus the fallbacks taken to get there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub target: LogTarget,
    pub level: LevelFilter,
    pub warnings: Vec<String>,
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level {
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

impl LogSettings {
    /// Resolve the logging section; `-v` flags can only raise the level
    pub fn resolve(config: Option<&LoggingConfig>, verbosity: u8) -> Self {
        let mut warnings = Vec::new();
        let default = LoggingConfig::default();
        let config = config.unwrap_or_else(|| {
            warnings.push("No logging configuration provided, using default settings".to_string());
            &default
        });

        let mut level = match config.level.as_deref() {
            None => LevelFilter::Info,
            Some(name) => parse_level(name).unwrap_or_else(|| {
                warnings.push(format!("Invalid log level '{}', defaulting to 'info'", name));
                LevelFilter::Info
            }),
        };
        level = match verbosity {
            0 => level,
            1 => level.max(LevelFilter::Debug),
            _ => LevelFilter::Trace,
        };

        let target = match config.kind.as_deref() {
            None | Some("stdout") => LogTarget::Stdout,
            Some("json") => LogTarget::Json,
            Some("file") => LogTarget::File(
                config
                    .path
                    .clone()
                    .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_LOG_PATH)),
            ),
            Some(other) => {
                warnings.push(format!("Invalid log type '{}', defaulting to 'stdout'", other));
                LogTarget::Stdout
            }
        };

        Self {
            target,
            level,
            warnings,
        }
    }
}

fn text_format(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "{} [{}] {}: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.target(),
        message
    ))
}

fn json_format(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    let line = serde_json::json!({
        "ts": chrono::Local::now().to_rfc3339(),
        "level": record.level().to_string(),
        "target": record.target(),
        "msg": message.to_string(),
    });
    out.finish(format_args!("{}", line))
}

/// Install the global logger. Can only succeed once per process.
pub fn setup(config: Option<&LoggingConfig>, verbosity: u8) -> Result<()> {
    let settings = LogSettings::resolve(config, verbosity);

    let dispatch = Dispatch::new().level(settings.level);
    let dispatch = match &settings.target {
        LogTarget::Stdout => dispatch.format(text_format).chain(std::io::stdout()),
        LogTarget::Json => dispatch.format(json_format).chain(std::io::stdout()),
        LogTarget::File(path) => dispatch.format(text_format).chain(fern::log_file(path)?),
    };
    dispatch.apply().map_err(fern::InitError::from)?;

    for warning in &settings.warnings {
        warn!("{}", warning);
    }
    debug!("Logging configured: {:?} at {}", settings.target, settings.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(kind: Option<&str>, level: Option<&str>) -> LoggingConfig {
        LoggingConfig {
            kind: kind.map(String::from),
            level: level.map(String::from),
            path: None,
        }
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let settings = LogSettings::resolve(None, 0);
        assert_eq!(settings.target, LogTarget::Stdout);
        assert_eq!(settings.level, LevelFilter::Info);
        assert_eq!(settings.warnings.len(), 1);
    }

    #[test]
    fn test_invalid_values_fall_back_with_warnings() {
        let settings = LogSettings::resolve(Some(&logging(Some("syslog"), Some("loud"))), 0);
        assert_eq!(settings.target, LogTarget::Stdout);
        assert_eq!(settings.level, LevelFilter::Info);
        assert_eq!(settings.warnings.len(), 2);
    }

    #[test]
    fn test_file_target_defaults_path() {
        let settings = LogSettings::resolve(Some(&logging(Some("file"), Some("error"))), 0);
        assert_eq!(settings.target, LogTarget::File(DEFAULT_LOG_PATH.into()));
        assert_eq!(settings.level, LevelFilter::Error);
        assert!(settings.warnings.is_empty());
    }

    #[test]
    fn test_verbosity_raises_level() {
        let config = logging(Some("json"), Some("warn"));
        assert_eq!(LogSettings::resolve(Some(&config), 1).level, LevelFilter::Debug);
        assert_eq!(LogSettings::resolve(Some(&config), 3).level, LevelFilter::Trace);

        let config = logging(None, Some("debug"));
        assert_eq!(LogSettings::resolve(Some(&config), 0).level, LevelFilter::Debug);
    }
}
