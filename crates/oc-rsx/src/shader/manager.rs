//! Shader cache lifecycle
//!
//! `ShaderCacheManager` is what a renderer owns: it is created at backend
//! init, polled once per frame, asked for shaders once per draw, and shut
//! down (drain, clear, close) with the backend.

use super::cache::{LastUsedSlot, ProgramCache, Role, StageStats};
use super::compiler::AsyncCompiler;
use super::diagnostics::{AlertHook, DiagnosticsSink};
use super::disk_cache::cache_file_name;
use super::entry::EntryRef;
use super::settings::ShaderCacheSettings;
use super::stage::ShaderStageDesc;
use super::stages::{
    FragmentShaderKey, FragmentStage, GeometryShaderKey, GeometryStage, ProgramKey, ProgramStage,
    VertexShaderKey, VertexStage,
};
use crate::backend::ShaderBackend;
use crate::state::PipelineState;
use oc_core::ShaderCacheError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shaders selected for one draw
pub enum DrawShaders<A> {
    /// Separately bound stages (D3D style)
    Separate {
        vertex: EntryRef<A>,
        fragment: EntryRef<A>,
        /// The passthrough sentinel when no geometry stage is needed
        geometry: EntryRef<A>,
    },
    /// One linked program (GL style)
    Linked(EntryRef<A>),
}

impl<A> DrawShaders<A> {
    /// Every stage is compiled; the draw can go ahead
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Separate {
                vertex,
                fragment,
                geometry,
            } => vertex.is_compiled() && fragment.is_compiled() && geometry.is_compiled(),
            Self::Linked(program) => program.is_compiled(),
        }
    }

    /// Some stage failed and never will compile
    pub fn is_failed(&self) -> bool {
        match self {
            Self::Separate {
                vertex,
                fragment,
                geometry,
            } => vertex.is_failed() || fragment.is_failed() || geometry.is_failed(),
            Self::Linked(program) => program.is_failed(),
        }
    }
}

/// The four stage caches of one backend
pub struct StageCaches<B: ShaderBackend> {
    pub vertex: ProgramCache<VertexStage, B>,
    pub fragment: ProgramCache<FragmentStage, B>,
    pub geometry: ProgramCache<GeometryStage, B>,
    pub program: ProgramCache<ProgramStage, B>,
}

impl<B: ShaderBackend> StageCaches<B> {
    fn clear(&self) {
        self.vertex.clear();
        self.fragment.clear();
        self.geometry.clear();
        self.program.clear();
    }

    fn close_disk_caches(&self) {
        self.vertex.close_disk_cache();
        self.fragment.close_disk_cache();
        self.geometry.close_disk_cache();
        self.program.close_disk_cache();
    }

    fn set_debugging(&self, debugging: bool) {
        self.vertex.set_debugging(debugging);
        self.fragment.set_debugging(debugging);
        self.geometry.set_debugging(debugging);
        self.program.set_debugging(debugging);
    }
}

/// Last-used slots of one caller role, one per stage cache
pub struct StageSlots<A> {
    vertex: LastUsedSlot<VertexShaderKey, A>,
    fragment: LastUsedSlot<FragmentShaderKey, A>,
    geometry: LastUsedSlot<GeometryShaderKey, A>,
    program: LastUsedSlot<ProgramKey, A>,
}

impl<A> StageSlots<A> {
    fn new(role: Role) -> Self {
        Self {
            vertex: LastUsedSlot::new(role),
            fragment: LastUsedSlot::new(role),
            geometry: LastUsedSlot::new(role),
            program: LastUsedSlot::new(role),
        }
    }
}

/// Statistics for all stages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    pub vertex: StageStats,
    pub fragment: StageStats,
    pub geometry: StageStats,
    pub program: StageStats,
    /// Units submitted but not yet published
    pub pending: usize,
}

/// Owner of a backend's shader caches
pub struct ShaderCacheManager<B: ShaderBackend> {
    backend: B,
    settings: ShaderCacheSettings,
    compiler: Arc<AsyncCompiler<B>>,
    diagnostics: Arc<DiagnosticsSink>,
    caches: Arc<StageCaches<B>>,
    slots: StageSlots<B::Artifact>,
    shut_down: bool,
}

impl<B: ShaderBackend> ShaderCacheManager<B> {
    /// Start the compiler pool and open the disk caches for `settings.game_id`
    pub fn new(backend: B, settings: ShaderCacheSettings) -> Result<Self, ShaderCacheError> {
        let compiler = Arc::new(AsyncCompiler::new(backend.compiler(), settings.compiler_threads)?);
        let diagnostics = Arc::new(DiagnosticsSink::new(
            settings.dump_dir.clone(),
            settings.dump_shaders,
            settings.suppress_alerts,
        ));

        let caches = StageCaches {
            vertex: ProgramCache::new(
                VertexStage,
                &backend,
                Arc::clone(&compiler),
                Arc::clone(&diagnostics),
            ),
            fragment: ProgramCache::new(
                FragmentStage,
                &backend,
                Arc::clone(&compiler),
                Arc::clone(&diagnostics),
            ),
            geometry: ProgramCache::new(
                GeometryStage,
                &backend,
                Arc::clone(&compiler),
                Arc::clone(&diagnostics),
            ),
            program: ProgramCache::new(
                ProgramStage,
                &backend,
                Arc::clone(&compiler),
                Arc::clone(&diagnostics),
            ),
        };
        caches.set_debugging(settings.shader_debugging);

        let manager = Self {
            backend,
            settings,
            compiler,
            diagnostics,
            caches: Arc::new(caches),
            slots: StageSlots::new(Role::Owner),
            shut_down: false,
        };
        manager.open_disk_caches();

        info!(
            "{} shader caches ready ({} compiler threads, {:?})",
            manager.backend.name(),
            manager.compiler.worker_count(),
            manager.settings.compile_mode
        );
        Ok(manager)
    }

    fn open_disk_caches(&self) {
        if !self.settings.persistent {
            return;
        }
        if self.backend.links_programs() {
            self.open_disk_cache(&self.caches.program);
        } else {
            self.open_disk_cache(&self.caches.vertex);
            self.open_disk_cache(&self.caches.fragment);
            self.open_disk_cache(&self.caches.geometry);
        }
    }

    fn open_disk_cache<S: ShaderStageDesc>(&self, cache: &ProgramCache<S, B>) {
        let name = cache_file_name(
            self.backend.name(),
            &self.backend.device_signature(),
            &self.settings.game_id,
            cache.desc().file_suffix(),
        );
        let path = self.settings.cache_dir.join(name);
        // Cached binaries carry no source, so debugging starts from scratch
        let replay = !self.settings.shader_debugging;
        if let Err(e) = cache.open_disk_cache(&path, &self.backend, replay) {
            warn!(
                "{}: {}; {} shaders will not be persisted",
                path.display(),
                e,
                cache.desc().name()
            );
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &ShaderCacheSettings {
        &self.settings
    }

    pub fn caches(&self) -> &StageCaches<B> {
        &self.caches
    }

    pub fn set_alert_hook(&self, hook: AlertHook) {
        self.diagnostics.set_alert_hook(hook);
    }

    /// Publish finished compiles. Call once per frame on the owning thread.
    pub fn poll(&self) -> usize {
        self.compiler.poll(&self.backend)
    }

    /// Shaders for the current draw. In synchronous mode this returns only
    /// once every stage is compiled or failed.
    pub fn prepare_draw(&mut self, state: &PipelineState) -> DrawShaders<B::Artifact> {
        let caches = &*self.caches;
        let slots = &mut self.slots;

        if self.settings.is_synchronous() {
            let backend = &self.backend;
            if backend.links_programs() {
                return DrawShaders::Linked(caches.program.prepare_sync(
                    backend,
                    state,
                    &mut slots.program,
                ));
            }
            return DrawShaders::Separate {
                vertex: caches.vertex.prepare_sync(backend, state, &mut slots.vertex),
                fragment: caches.fragment.prepare_sync(backend, state, &mut slots.fragment),
                geometry: caches.geometry.prepare_sync(backend, state, &mut slots.geometry),
            };
        }

        if self.backend.links_programs() {
            return DrawShaders::Linked(caches.program.prepare(state, &mut slots.program));
        }
        DrawShaders::Separate {
            vertex: caches.vertex.prepare(state, &mut slots.vertex),
            fragment: caches.fragment.prepare(state, &mut slots.fragment),
            geometry: caches.geometry.prepare(state, &mut slots.geometry),
        }
    }

    /// Handle for a background thread that compiles ahead of need
    pub fn prewarmer(&self) -> Prewarmer<B> {
        Prewarmer {
            caches: Arc::clone(&self.caches),
            slots: StageSlots::new(Role::Prewarm),
            links_programs: self.backend.links_programs(),
        }
    }

    /// Take new settings, clearing or reopening caches as needed
    pub fn apply_settings(&mut self, settings: ShaderCacheSettings) {
        if settings == self.settings {
            return;
        }
        let clear = self.settings.requires_clear(&settings);
        let reopen = self.settings.requires_reopen(&settings);
        if settings.compiler_threads != self.settings.compiler_threads {
            debug!("Shader compiler thread count takes effect on restart");
        }
        if settings.dump_dir != self.settings.dump_dir {
            debug!("Shader dump directory takes effect on restart");
        }

        self.diagnostics.set_suppress_alerts(settings.suppress_alerts);
        self.diagnostics.set_dump_all_sources(settings.dump_shaders);
        self.caches.set_debugging(settings.shader_debugging);
        self.settings = settings;

        if clear || reopen {
            self.invalidate();
        }
        if reopen {
            self.caches.close_disk_caches();
            self.open_disk_caches();
        }
    }

    /// Drop every compiled shader. Disk caches are left alone.
    pub fn invalidate(&mut self) {
        self.compiler.wait_for_finish(&self.backend);
        self.caches.clear();
        info!("Shader caches cleared");
    }

    /// Drain the compiler, clear the tables and close the disk caches.
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.compiler.wait_for_finish(&self.backend);
        let stats = self.stats();
        self.caches.clear();
        self.caches.close_disk_caches();
        debug!("Shader caches shut down: {:?}", stats);
    }

    pub fn stats(&self) -> ShaderCacheStats {
        ShaderCacheStats {
            vertex: self.caches.vertex.stats(),
            fragment: self.caches.fragment.stats(),
            geometry: self.caches.geometry.stats(),
            program: self.caches.program.stats(),
            pending: self.compiler.pending(),
        }
    }
}

impl<B: ShaderBackend> Drop for ShaderCacheManager<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pre-warm role: requests compilation from another thread, never binds.
///
/// Results are still published by the owning thread's `poll`. Stop using
/// the handle before the manager shuts down.
pub struct Prewarmer<B: ShaderBackend> {
    caches: Arc<StageCaches<B>>,
    slots: StageSlots<B::Artifact>,
    links_programs: bool,
}

impl<B: ShaderBackend> Prewarmer<B> {
    /// Make sure the shaders for `state` are compiled or compiling.
    /// Returns true if they are all compiled already.
    pub fn prewarm(&mut self, state: &PipelineState) -> bool {
        let caches = &*self.caches;
        let slots = &mut self.slots;

        if self.links_programs {
            return caches.program.prepare(state, &mut slots.program).is_compiled();
        }
        let vertex = caches.vertex.prepare(state, &mut slots.vertex);
        let fragment = caches.fragment.prepare(state, &mut slots.fragment);
        let geometry = caches.geometry.prepare(state, &mut slots.geometry);
        vertex.is_compiled() && fragment.is_compiled() && geometry.is_compiled()
    }
}
