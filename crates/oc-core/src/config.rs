//! Configuration system for oxidized-cell emulator

use crate::error::{EmulatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub gpu: GpuConfig,
    pub paths: PathConfig,
    pub debug: DebugConfig,
}

/// GPU settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub backend: GpuBackend,
    /// Persist compiled shaders to disk between runs
    pub shader_cache: bool,
    pub shader_compile_mode: ShaderCompileMode,
    /// Number of background compiler threads (0 = pick from host CPU count)
    pub shader_compiler_threads: u32,
    /// Keep generated shader source around and compile with debug info
    pub shader_debugging: bool,
    pub deterministic_gpu_sync: bool,
    /// Don't pop up a message when a shader fails to compile
    pub suppress_shader_alerts: bool,
}

/// GPU backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum GpuBackend {
    #[default]
    Vulkan,
    Null,
}

/// How draws wait for shaders that are still compiling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum ShaderCompileMode {
    /// Keep rendering and skip draws whose shaders aren't ready yet
    #[default]
    Asynchronous,
    /// Stall the draw until its shaders are compiled
    Synchronous,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub shader_cache: PathBuf,
    pub dumps: PathBuf,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
    /// Write every generated shader source to the dump directory
    pub dump_shaders: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            backend: GpuBackend::default(),
            shader_cache: true,
            shader_compile_mode: ShaderCompileMode::default(),
            shader_compiler_threads: 0,
            shader_debugging: false,
            deterministic_gpu_sync: false,
            suppress_shader_alerts: false,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-cell");

        Self {
            shader_cache: base.join("cache/shaders"),
            dumps: base.join("dumps"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-cell.log"),
            dump_shaders: false,
        }
    }
}

impl Config {
    /// Load the configuration file, writing the defaults if there is none
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EmulatorError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| EmulatorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        debug!("Wrote configuration to {}", path.display());
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-cell")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.gpu.shader_cache);
        assert_eq!(config.gpu.shader_compile_mode, ShaderCompileMode::Asynchronous);
        assert_eq!(config.gpu.shader_compiler_threads, 0);
        assert!(!config.gpu.shader_debugging);
        assert!(config.paths.shader_cache.ends_with("cache/shaders"));
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.gpu.shader_compile_mode = ShaderCompileMode::Synchronous;
        config.gpu.shader_compiler_threads = 3;
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gpu.shader_compile_mode, ShaderCompileMode::Synchronous);
        assert_eq!(parsed.gpu.shader_compiler_threads, 3);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[gpu]\nshader_debugging = true\n").unwrap();
        assert!(parsed.gpu.shader_debugging);
        assert!(parsed.gpu.shader_cache);
        assert_eq!(parsed.debug.log_level, LogLevel::Info);
    }

    #[test]
    fn test_load_creates_and_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(created.gpu.shader_cache);

        let mut changed = created.clone();
        changed.gpu.suppress_shader_alerts = true;
        changed.save_to(&path).unwrap();
        assert!(Config::load_from(&path).unwrap().gpu.suppress_shader_alerts);

        std::fs::write(&path, "[gpu\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(EmulatorError::Config(_))));
    }
}
