//! RSX (Reality Synthesizer) shader caching for oxidized-cell
//!
//! Turns RSX pipeline state into compiled backend programs without stalling
//! the rendering thread, and keeps them across runs.

pub mod backend;
pub mod shader;
pub mod state;

pub use backend::ShaderBackend;
pub use shader::{DrawShaders, ShaderCacheManager, ShaderCacheSettings};
pub use state::{PipelineState, PrimitiveType};
