//! RSX shader caches
//!
//! Every pipeline stage gets a [`ProgramCache`] keyed by a fixed-size key
//! derived from the RSX state. Misses are generated and compiled on a
//! background pool, results are published on the rendering thread and
//! appended to a per-game disk cache that is replayed on the next run.

pub mod cache;
pub mod compiler;
pub mod diagnostics;
pub mod disk_cache;
pub mod entry;
pub mod key;
pub mod manager;
pub mod settings;
pub mod stage;
pub mod stages;
pub mod types;

pub use cache::{LastUsedSlot, ProgramCache, Role, StageStats};
pub use compiler::{default_worker_count, AsyncCompiler, CompileOutput, CompileUnit, ShaderCompiler};
pub use diagnostics::{AlertHook, DiagnosticsSink, ShaderAlert};
pub use disk_cache::{cache_file_name, game_tag, DiskCacheSummary, LinearDiskCache};
pub use entry::{CacheEntry, CompiledProgram, EntryRef, EntryState};
pub use key::{program_hash, CacheKey};
pub use manager::{DrawShaders, Prewarmer, ShaderCacheManager, ShaderCacheStats, StageCaches};
pub use settings::ShaderCacheSettings;
pub use stage::ShaderStageDesc;
pub use stages::*;
pub use types::*;
