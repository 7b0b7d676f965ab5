//! Stage descriptors
//!
//! A descriptor is everything that differs between the vertex, fragment,
//! geometry and linked-program caches: how to derive a key from state, when
//! the stage is an identity, and how to generate source for a key.

use super::key::CacheKey;
use super::types::{CompileFlags, ShaderStage};
use oc_core::ShaderCacheError;

/// Parameters of one `ProgramCache` instantiation
pub trait ShaderStageDesc: Send + Sync + 'static {
    /// Pipeline state snapshot the key is derived from
    type State: ?Sized;
    type Key: CacheKey;

    fn stage(&self) -> ShaderStage;

    /// Name used in logs and alerts
    fn name(&self) -> &'static str;

    /// Suffix of the cache file name
    fn file_suffix(&self) -> &'static str {
        self.stage().short_name()
    }

    /// Bump when generated source changes for an unchanged key
    fn generator_version(&self) -> u32;

    fn derive_key(&self, state: &Self::State) -> Self::Key;

    /// True if the stage is an identity transform for this state and needs
    /// no program at all
    fn is_passthrough(&self, _state: &Self::State) -> bool {
        false
    }

    fn generate_source(&self, key: &Self::Key) -> Result<String, ShaderCacheError>;

    fn entry_point(&self) -> &'static str {
        "main"
    }

    fn compile_flags(&self) -> CompileFlags {
        CompileFlags::SKIP_VALIDATION | CompileFlags::OPTIMIZE
    }
}
