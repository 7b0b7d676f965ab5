//! RSX rendering backends
//!
//! The shader caches only need two things from a backend: a compiler that
//! can run on worker threads, and a way to turn bytecode into a bindable
//! object on the thread that owns the graphics context.

pub mod null;

use crate::shader::{ShaderCompiler, ShaderStage};
use std::sync::Arc;

/// Backend hooks used by the shader caches
pub trait ShaderBackend: 'static {
    /// Bindable program object (shader module, program id, ...)
    type Artifact: Send + Sync + 'static;

    /// Short backend tag used in cache file names, e.g. `VK`
    fn name(&self) -> &'static str;

    /// Driver / device identity; a change must invalidate cached binaries
    fn device_signature(&self) -> String;

    /// Compiler target for a stage, e.g. `vs_5_0`
    fn target_profile(&self, stage: ShaderStage) -> String;

    /// Source -> bytecode compiler used by the background workers
    fn compiler(&self) -> Arc<dyn ShaderCompiler>;

    /// Create the bindable object. Only called on the owning thread.
    fn create_artifact(&self, stage: ShaderStage, bytecode: &[u8]) -> Option<Self::Artifact>;

    /// Whether draws use one linked program instead of separate stages
    fn links_programs(&self) -> bool {
        false
    }
}
