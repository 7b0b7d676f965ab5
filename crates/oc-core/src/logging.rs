//! Logging setup
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be traced without touching the config file.

use crate::config::DebugConfig;
use crate::error::{EmulatorError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Build the filter for the given debug settings
pub fn env_filter(config: &DebugConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()))
}

/// Install the global tracing subscriber
pub fn init(config: &DebugConfig) -> Result<()> {
    let filter = env_filter(config);

    let installed = if config.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    installed.map_err(|e| EmulatorError::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_log_level_filters() {
        assert_eq!(LogLevel::Off.as_filter(), "off");
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }

    #[test]
    fn test_init_to_file_then_reinit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = DebugConfig {
            log_level: LogLevel::Debug,
            log_to_file: true,
            log_path: dir.path().join("oc.log"),
            dump_shaders: false,
        };

        // Only one global subscriber may exist per process
        let _ = init(&config);
        assert!(init(&config).is_err());
        assert!(config.log_path.exists());
    }
}
