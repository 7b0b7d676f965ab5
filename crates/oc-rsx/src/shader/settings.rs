//! Shader cache settings derived from the user configuration

use oc_core::config::ShaderCompileMode;
use oc_core::Config;
use std::path::PathBuf;

/// Everything the shader caches read from the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderCacheSettings {
    /// Persist compiled shaders to disk
    pub persistent: bool,
    pub cache_dir: PathBuf,
    pub dump_dir: PathBuf,
    /// Title ID of the running game; part of the cache file names
    pub game_id: String,
    pub compile_mode: ShaderCompileMode,
    /// 0 = choose from the host CPU count
    pub compiler_threads: usize,
    pub shader_debugging: bool,
    pub deterministic_gpu_sync: bool,
    pub suppress_alerts: bool,
    pub dump_shaders: bool,
}

impl ShaderCacheSettings {
    pub fn from_config(config: &Config, game_id: &str) -> Self {
        Self {
            persistent: config.gpu.shader_cache,
            cache_dir: config.paths.shader_cache.clone(),
            dump_dir: config.paths.dumps.clone(),
            game_id: game_id.to_string(),
            compile_mode: config.gpu.shader_compile_mode,
            compiler_threads: config.gpu.shader_compiler_threads as usize,
            shader_debugging: config.gpu.shader_debugging,
            deterministic_gpu_sync: config.gpu.deterministic_gpu_sync,
            suppress_alerts: config.gpu.suppress_shader_alerts,
            dump_shaders: config.debug.dump_shaders,
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.compile_mode == ShaderCompileMode::Synchronous
    }

    /// Settings whose change makes every compiled shader stale
    pub(crate) fn requires_clear(&self, other: &Self) -> bool {
        self.shader_debugging != other.shader_debugging
            || self.deterministic_gpu_sync != other.deterministic_gpu_sync
    }

    /// Settings whose change selects different cache files
    pub(crate) fn requires_reopen(&self, other: &Self) -> bool {
        self.persistent != other.persistent
            || self.cache_dir != other.cache_dir
            || self.game_id != other.game_id
    }
}

impl Default for ShaderCacheSettings {
    fn default() -> Self {
        Self::from_config(&Config::default(), "")
    }
}
