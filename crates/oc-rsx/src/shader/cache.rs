//! Render-state keyed program cache
//!
//! One `ProgramCache` exists per pipeline stage. Lookups go through a
//! caller-owned [`LastUsedSlot`] first, so a draw whose state did not change
//! since the caller's previous draw never takes the table lock.
//!
//! Compilation runs on the [`AsyncCompiler`] pool. Results are published on
//! the thread that polls the pool: the backend object is created there,
//! the bytecode appended to the disk cache, and only then is the entry
//! flagged compiled.

use super::compiler::{AsyncCompiler, CompileOutput, CompileUnit};
use super::diagnostics::DiagnosticsSink;
use super::disk_cache::{LinearDiskCache, ReplayReport};
use super::entry::{CacheEntry, CompiledProgram, EntryRef};
use super::key::CacheKey;
use super::stage::ShaderStageDesc;
use crate::backend::ShaderBackend;
use crossbeam::utils::Backoff;
use oc_core::{RsxError, ShaderCacheError};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Source of cache identities, so a slot never matches a different cache
static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Who is calling `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Thread owning the graphics context; binds what it gets back
    Owner,
    /// Background thread compiling ahead of need; never binds
    Prewarm,
}

/// Fast-path memory of one caller role for one cache
pub struct LastUsedSlot<K, A> {
    role: Role,
    /// key, entry, (cache id, table generation) at the time it was stored
    cached: Option<(K, EntryRef<A>, u64, u64)>,
}

impl<K: CacheKey, A> LastUsedSlot<K, A> {
    pub fn new(role: Role) -> Self {
        Self { role, cached: None }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Forget the remembered entry
    pub fn reset(&mut self) {
        self.cached = None;
    }

    pub fn key(&self) -> Option<&K> {
        self.cached.as_ref().map(|(key, ..)| key)
    }
}

/// Point-in-time counters of one stage cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStats {
    pub entries: usize,
    pub compiled: usize,
    pub failed: usize,
    /// Units handed to the compiler since startup
    pub submitted: usize,
    /// Of those, how many were claimed by the pre-warm role
    pub prewarm_submitted: usize,
    pub fast_path_hits: usize,
    pub passthrough_hits: usize,
    pub loaded_from_disk: usize,
    pub duplicates_skipped: usize,
    pub corrupt_skipped: usize,
    /// Persistence was switched off after an I/O error
    pub disk_degraded: bool,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    prewarm_submitted: AtomicUsize,
    fast_path_hits: AtomicUsize,
    passthrough_hits: AtomicUsize,
    loaded_from_disk: AtomicUsize,
    duplicates_skipped: AtomicUsize,
    corrupt_skipped: AtomicUsize,
    disk_degraded: AtomicBool,
}

/// State reachable from completion handlers
struct Shared<S: ShaderStageDesc, A> {
    desc: S,
    id: u64,
    table: Mutex<HashMap<S::Key, EntryRef<A>>>,
    generation: AtomicU64,
    disk: Mutex<Option<LinearDiskCache>>,
    diagnostics: Arc<DiagnosticsSink>,
    counters: Counters,
}

impl<S: ShaderStageDesc, A> Shared<S, A> {
    fn persist(&self, key: &S::Key, bytecode: &[u8]) {
        let mut disk = self.disk.lock();
        let Some(file) = disk.as_mut() else {
            return;
        };
        if let Err(e) = file.append(key.to_bytes(), bytecode) {
            warn!(
                "{} shader cache: {}; continuing without persistence",
                self.desc.name(),
                e
            );
            *disk = None;
            self.counters.disk_degraded.store(true, Ordering::Relaxed);
        }
    }
}

/// Cache of compiled programs for one stage
pub struct ProgramCache<S: ShaderStageDesc, B: ShaderBackend> {
    shared: Arc<Shared<S, B::Artifact>>,
    passthrough: EntryRef<B::Artifact>,
    compiler: Arc<AsyncCompiler<B>>,
    target: String,
    /// Keep generated source and build with debug flags
    debugging: AtomicBool,
}

impl<S: ShaderStageDesc, B: ShaderBackend> ProgramCache<S, B> {
    pub fn new(
        desc: S,
        backend: &B,
        compiler: Arc<AsyncCompiler<B>>,
        diagnostics: Arc<DiagnosticsSink>,
    ) -> Self {
        let target = backend.target_profile(desc.stage());
        Self {
            shared: Arc::new(Shared {
                desc,
                id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                table: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                disk: Mutex::new(None),
                diagnostics,
                counters: Counters::default(),
            }),
            passthrough: Arc::new(CacheEntry::passthrough()),
            compiler,
            target,
            debugging: AtomicBool::new(false),
        }
    }

    pub fn desc(&self) -> &S {
        &self.shared.desc
    }

    pub fn set_debugging(&self, debugging: bool) {
        self.debugging.store(debugging, Ordering::Relaxed);
    }

    /// Shared sentinel returned for identity states
    pub fn passthrough_entry(&self) -> &EntryRef<B::Artifact> {
        &self.passthrough
    }

    /// Look up (or start compiling) the program for `state`.
    ///
    /// Never blocks on compilation. The returned entry may still be
    /// claimed; check `is_compiled` / `is_failed`.
    pub fn prepare(
        &self,
        state: &S::State,
        slot: &mut LastUsedSlot<S::Key, B::Artifact>,
    ) -> EntryRef<B::Artifact> {
        let shared = &*self.shared;

        if shared.desc.is_passthrough(state) {
            shared.counters.passthrough_hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(&self.passthrough);
        }

        let key = shared.desc.derive_key(state);
        let generation = shared.generation.load(Ordering::Acquire);

        if let Some((last_key, entry, id, last_gen)) = &slot.cached {
            if *last_key == key && *id == shared.id && *last_gen == generation {
                shared.counters.fast_path_hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(entry);
            }
        }

        let entry = {
            let mut table = shared.table.lock();
            match table.entry(key) {
                Entry::Occupied(e) => Arc::clone(e.get()),
                Entry::Vacant(e) => {
                    trace!("{} cache miss for {:?}", shared.desc.name(), key);
                    Arc::clone(e.insert(Arc::new(CacheEntry::new())))
                }
            }
        };
        slot.cached = Some((key, Arc::clone(&entry), shared.id, generation));

        if entry.try_claim() {
            self.submit(key, &entry, slot.role);
        }
        entry
    }

    /// Like [`prepare`](Self::prepare), but drains the compiler until the
    /// entry is compiled or failed. Owning thread only.
    pub fn prepare_sync(
        &self,
        backend: &B,
        state: &S::State,
        slot: &mut LastUsedSlot<S::Key, B::Artifact>,
    ) -> EntryRef<B::Artifact> {
        let entry = self.prepare(state, slot);
        let backoff = Backoff::new();
        while !entry.is_settled() {
            if self.compiler.poll(backend) == 0 {
                backoff.snooze();
            }
        }
        entry
    }

    /// Generate source for a freshly claimed entry and queue it
    fn submit(&self, key: S::Key, entry: &EntryRef<B::Artifact>, role: Role) {
        let shared = &*self.shared;
        let desc = &shared.desc;

        let source = match desc.generate_source(&key) {
            Ok(source) => source,
            Err(e) => {
                error!("{} ({:?})", e, key);
                entry.mark_failed();
                return;
            }
        };

        let debugging = self.debugging.load(Ordering::Relaxed);
        let unit = CompileUnit {
            stage: desc.stage(),
            label: format!("{} shader {:?}", desc.name(), key),
            source,
            entry_point: desc.entry_point(),
            target: self.target.clone(),
            flags: desc.compile_flags().for_debugging(debugging),
        };
        shared.diagnostics.dump_source(&unit);

        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if role == Role::Prewarm {
            shared.counters.prewarm_submitted.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Compiling {} for {}", unit.label, unit.target);

        let shared = Arc::clone(&self.shared);
        let entry = Arc::clone(entry);
        self.compiler.submit(
            unit,
            Box::new(move |backend: &B, output: CompileOutput| {
                complete(&shared, backend, key, &entry, output, debugging)
            }),
        );
    }

    /// Seed the table from a disk cache file and keep it open for appends.
    ///
    /// With `replay` false the file is only opened for appending.
    pub fn open_disk_cache(
        &self,
        path: &Path,
        backend: &B,
        replay: bool,
    ) -> Result<ReplayReport, ShaderCacheError> {
        let shared = &*self.shared;
        let desc = &shared.desc;

        let opened = LinearDiskCache::open(path, S::Key::SIZE, desc.generator_version());
        let (file, report) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                shared.counters.disk_degraded.store(true, Ordering::Relaxed);
                return Err(e);
            }
        };
        shared.counters.corrupt_skipped.fetch_add(report.skipped, Ordering::Relaxed);

        if replay {
            let mut duplicates = 0;
            let mut corrupt = 0;

            // First record of each key not already in the table, looked up
            // under a short lock
            let mut pending = Vec::new();
            {
                let table = shared.table.lock();
                let mut seen = HashSet::new();
                for record in &report.records {
                    let Some(key) = S::Key::from_bytes(&record.key) else {
                        warn!("{}: invalid key at offset {}", path.display(), record.offset);
                        corrupt += 1;
                        continue;
                    };
                    if table.contains_key(&key) || !seen.insert(key) {
                        duplicates += 1;
                        continue;
                    }
                    pending.push((key, record));
                }
            }

            // Backend objects are created without the lock held
            let mut created = Vec::with_capacity(pending.len());
            for (key, record) in pending {
                match backend.create_artifact(desc.stage(), &record.bytecode) {
                    Some(artifact) => created.push((key, record.bytecode.clone(), artifact)),
                    None => {
                        warn!(
                            "{}: backend rejected cached {} shader at offset {}",
                            path.display(),
                            desc.name(),
                            record.offset
                        );
                        corrupt += 1;
                    }
                }
            }

            let mut loaded = 0;
            {
                let mut table = shared.table.lock();
                for (key, bytecode, artifact) in created {
                    // A concurrent prepare may have claimed the key meanwhile
                    match table.entry(key) {
                        Entry::Vacant(slot) => {
                            slot.insert(Arc::new(CacheEntry::precompiled(bytecode, artifact)));
                            loaded += 1;
                        }
                        Entry::Occupied(_) => duplicates += 1,
                    }
                }
            }

            let counters = &shared.counters;
            counters.loaded_from_disk.fetch_add(loaded, Ordering::Relaxed);
            counters.duplicates_skipped.fetch_add(duplicates, Ordering::Relaxed);
            counters.corrupt_skipped.fetch_add(corrupt, Ordering::Relaxed);
            info!(
                "Loaded {} {} shaders from {} ({} duplicates, {} skipped)",
                loaded,
                desc.name(),
                path.display(),
                duplicates,
                corrupt + report.skipped
            );
        }

        *shared.disk.lock() = Some(file);
        Ok(report)
    }

    /// Sync and release the disk cache file, if one is open
    pub fn close_disk_cache(&self) {
        if let Some(file) = self.shared.disk.lock().take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!("Failed to close shader cache {}: {}", path.display(), e);
            }
        }
    }

    /// Drop every entry. Outstanding entry references stay usable, but no
    /// slot will hand them out again.
    pub fn clear(&self) {
        let mut table = self.shared.table.lock();
        table.clear();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_disk_cache(&self) -> bool {
        self.shared.disk.lock().is_some()
    }

    pub fn stats(&self) -> StageStats {
        let counters = &self.shared.counters;
        let mut stats = StageStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            prewarm_submitted: counters.prewarm_submitted.load(Ordering::Relaxed),
            fast_path_hits: counters.fast_path_hits.load(Ordering::Relaxed),
            passthrough_hits: counters.passthrough_hits.load(Ordering::Relaxed),
            loaded_from_disk: counters.loaded_from_disk.load(Ordering::Relaxed),
            duplicates_skipped: counters.duplicates_skipped.load(Ordering::Relaxed),
            corrupt_skipped: counters.corrupt_skipped.load(Ordering::Relaxed),
            disk_degraded: counters.disk_degraded.load(Ordering::Relaxed),
            ..Default::default()
        };

        let table = self.shared.table.lock();
        stats.entries = table.len();
        for entry in table.values() {
            if entry.is_compiled() {
                stats.compiled += 1;
            } else if entry.is_failed() {
                stats.failed += 1;
            }
        }
        stats
    }
}

/// Publish a finished unit. Runs on the polling (owning) thread.
fn complete<S: ShaderStageDesc, B: ShaderBackend>(
    shared: &Shared<S, B::Artifact>,
    backend: &B,
    key: S::Key,
    entry: &CacheEntry<B::Artifact>,
    output: CompileOutput,
    keep_source: bool,
) {
    let CompileOutput { unit, result } = output;

    let bytecode = match result {
        Ok(bytecode) => bytecode,
        Err(diagnostics) => {
            shared.diagnostics.report_failure(shared.desc.name(), &unit, &diagnostics);
            entry.mark_failed();
            return;
        }
    };

    let Some(artifact) = backend.create_artifact(unit.stage, &bytecode) else {
        let err = RsxError::Backend(format!(
            "could not create a program from {} bytes",
            bytecode.len()
        ));
        error!("{} [{}]", err, unit.label);
        entry.mark_failed();
        return;
    };

    shared.persist(&key, &bytecode);
    entry.publish(CompiledProgram {
        bytecode,
        artifact: Some(artifact),
        source: keep_source.then_some(unit.source),
    });
    trace!("{} ready", unit.label);
}
