//! Program cache behaviour across compiler, disk and threads

use bytemuck::{Pod, Zeroable};
use crossbeam::channel::{self, Receiver, Sender};
use oc_core::ShaderCacheError;
use oc_rsx::backend::null::NullBackend;
use oc_rsx::shader::disk_cache::{self, LinearDiskCache};
use oc_rsx::shader::{
    AsyncCompiler, CacheKey, CompileFlags, CompileUnit, DiagnosticsSink, LastUsedSlot, ProgramCache,
    Role, ShaderCompiler, ShaderStage, ShaderStageDesc,
};
use oc_rsx::ShaderBackend;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const TEST_GEN_VERSION: u32 = 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
struct TestKey {
    id: u32,
    reserved: u32,
}

impl CacheKey for TestKey {
    fn is_valid(&self) -> bool {
        self.reserved == 0
    }
}

/// State is a plain id: 0 is passthrough, odd ids fail to compile
#[derive(Default)]
struct TestStage {
    generated: AtomicUsize,
}

impl ShaderStageDesc for TestStage {
    type State = u32;
    type Key = TestKey;

    fn stage(&self) -> ShaderStage {
        ShaderStage::VERTEX
    }

    fn name(&self) -> &'static str {
        "test"
    }

    fn generator_version(&self) -> u32 {
        TEST_GEN_VERSION
    }

    fn derive_key(&self, state: &u32) -> TestKey {
        TestKey { id: *state, reserved: 0 }
    }

    fn is_passthrough(&self, state: &u32) -> bool {
        *state == 0
    }

    fn generate_source(&self, key: &TestKey) -> Result<String, ShaderCacheError> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        if key.id % 2 == 1 {
            Ok(format!("void main() {{\n#error variant {} is unsupported\n}}", key.id))
        } else {
            Ok(format!("void main() {{ /* variant {} */ }}", key.id))
        }
    }
}

struct Harness {
    backend: NullBackend,
    compiler: Arc<AsyncCompiler<NullBackend>>,
    diagnostics: Arc<DiagnosticsSink>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let backend = NullBackend::new();
        let compiler = Arc::new(AsyncCompiler::new(backend.compiler(), 4).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Arc::new(DiagnosticsSink::new(dir.path().join("dumps"), false, true));
        Self {
            backend,
            compiler,
            diagnostics,
            dir,
        }
    }

    fn cache(&self) -> ProgramCache<TestStage, NullBackend> {
        ProgramCache::new(
            TestStage::default(),
            &self.backend,
            Arc::clone(&self.compiler),
            Arc::clone(&self.diagnostics),
        )
    }

    fn cache_path(&self) -> std::path::PathBuf {
        self.dir.path().join("NULL-00000000-TEST00000-vs.cache")
    }

    fn finish(&self) {
        self.compiler.wait_for_finish(&self.backend);
    }
}

/// Backend whose `create_artifact` waits for the test to release it
struct GatedBackend {
    inner: NullBackend,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl ShaderBackend for GatedBackend {
    type Artifact = <NullBackend as ShaderBackend>::Artifact;

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn device_signature(&self) -> String {
        self.inner.device_signature()
    }

    fn target_profile(&self, stage: ShaderStage) -> String {
        self.inner.target_profile(stage)
    }

    fn compiler(&self) -> Arc<dyn ShaderCompiler> {
        self.inner.compiler()
    }

    fn create_artifact(&self, stage: ShaderStage, bytecode: &[u8]) -> Option<Self::Artifact> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        self.inner.create_artifact(stage, bytecode)
    }
}

fn compile_bytecode(backend: &NullBackend, source: &str) -> Vec<u8> {
    let unit = CompileUnit {
        stage: ShaderStage::VERTEX,
        label: "fixture".to_string(),
        source: source.to_string(),
        entry_point: "main",
        target: backend.target_profile(ShaderStage::VERTEX),
        flags: CompileFlags::OPTIMIZE,
    };
    backend.compiler().compile(&unit).unwrap()
}

fn records_on_disk(path: &Path) -> usize {
    disk_cache::inspect(path).unwrap().records
}

#[test]
fn test_scenario_a_miss_compile_persist() {
    let h = Harness::new();
    let cache = h.cache();
    cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
    let mut slot = LastUsedSlot::new(Role::Owner);

    let entry = cache.prepare(&2, &mut slot);
    assert!(!entry.is_compiled());
    assert_eq!(cache.stats().submitted, 1);

    h.finish();
    assert_eq!(records_on_disk(&h.cache_path()), 1);
    assert!(cache.prepare(&2, &mut slot).is_compiled());

    let summary = disk_cache::inspect(&h.cache_path()).unwrap();
    assert_eq!(summary.header.key_size as usize, TestKey::SIZE);
    assert_eq!(summary.header.generator_version, TEST_GEN_VERSION);
}

#[test]
fn test_scenario_b_duplicate_records_seed_once() {
    let h = Harness::new();
    let key = TestKey { id: 4, reserved: 0 };
    {
        let (mut file, _) =
            LinearDiskCache::open(&h.cache_path(), TestKey::SIZE, TEST_GEN_VERSION).unwrap();
        let bytecode = compile_bytecode(&h.backend, "void main() { }");
        file.append(key.to_bytes(), &bytecode).unwrap();
        file.append(key.to_bytes(), &bytecode).unwrap();
        file.close().unwrap();
    }

    let cache = h.cache();
    let report = cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
    assert_eq!(report.records.len(), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(h.backend.artifacts_created(), 1);

    let stats = cache.stats();
    assert_eq!(stats.loaded_from_disk, 1);
    assert_eq!(stats.duplicates_skipped, 1);
}

#[test]
fn test_scenario_c_failed_key_is_never_retried() {
    let h = Harness::new();
    let cache = h.cache();
    cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
    let mut slot = LastUsedSlot::new(Role::Owner);

    cache.prepare(&3, &mut slot);
    h.finish();

    for i in 0..100 {
        // Alternate keys so the locked lookup is exercised, not just the slot
        if i % 2 == 0 {
            cache.prepare(&2, &mut slot);
        }
        let entry = cache.prepare(&3, &mut slot);
        assert!(entry.is_failed());
        assert!(!entry.is_compiled());
    }
    h.finish();

    assert_eq!(cache.stats().submitted, 2);
    assert_eq!(cache.desc().generated.load(Ordering::SeqCst), 2);
    assert_eq!(h.diagnostics.failure_count(), 1);
    assert!(h.dir.path().join("dumps/bad_vs_0000.txt").exists());
    // Only the good variant was persisted
    assert_eq!(records_on_disk(&h.cache_path()), 1);
}

#[test]
fn test_repeated_prepare_submits_once_across_roles() {
    let h = Harness::new();
    let cache = h.cache();
    let mut owner = LastUsedSlot::new(Role::Owner);
    let mut prewarm = LastUsedSlot::new(Role::Prewarm);

    let first = cache.prepare(&6, &mut prewarm);
    for _ in 0..50 {
        assert!(Arc::ptr_eq(&first, &cache.prepare(&6, &mut owner)));
        assert!(Arc::ptr_eq(&first, &cache.prepare(&6, &mut prewarm)));
    }
    h.finish();

    let stats = cache.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.prewarm_submitted, 1);
    assert_eq!(h.backend.compile_count(), 1);
    assert!(first.is_compiled());
}

#[test]
fn test_concurrent_prepare_of_new_key() {
    const THREADS: usize = 8;
    let h = Harness::new();
    let cache = h.cache();
    let barrier = Barrier::new(THREADS);

    let entries: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = &cache;
                let barrier = &barrier;
                s.spawn(move || {
                    let role = if i == 0 { Role::Owner } else { Role::Prewarm };
                    let mut slot = LastUsedSlot::new(role);
                    barrier.wait();
                    cache.prepare(&8, &mut slot)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    h.finish();
    assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
    assert!(entries[0].is_compiled());
    assert_eq!(cache.stats().submitted, 1);
    assert_eq!(cache.desc().generated.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.compile_count(), 1);
}

#[test]
fn test_round_trip_needs_no_compiler() {
    let h = Harness::new();
    {
        let cache = h.cache();
        cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
        let mut slot = LastUsedSlot::new(Role::Owner);
        for id in [2, 4, 10] {
            cache.prepare(&id, &mut slot);
        }
        h.finish();
        cache.close_disk_cache();
    }

    let compiles = h.backend.compile_count();
    let cache = h.cache();
    cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
    let mut slot = LastUsedSlot::new(Role::Owner);
    for id in [2, 4, 10] {
        assert!(cache.prepare(&id, &mut slot).is_compiled());
    }

    assert_eq!(cache.desc().generated.load(Ordering::SeqCst), 0);
    assert_eq!(h.backend.compile_count(), compiles);
    assert_eq!(h.compiler.pending(), 0);
    assert_eq!(cache.stats().submitted, 0);
}

#[test]
fn test_clear_recompiles_once_and_keeps_disk() {
    let h = Harness::new();
    let cache = h.cache();
    cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
    let mut slot = LastUsedSlot::new(Role::Owner);

    cache.prepare(&12, &mut slot);
    h.finish();
    cache.clear();
    cache.clear();

    for _ in 0..10 {
        cache.prepare(&12, &mut slot);
    }
    h.finish();

    assert!(cache.prepare(&12, &mut slot).is_compiled());
    assert_eq!(cache.stats().submitted, 2);
    // The fresh compile is appended again; replay keeps the first one
    assert_eq!(records_on_disk(&h.cache_path()), 2);
}

#[test]
fn test_passthrough_never_compiles() {
    let h = Harness::new();
    let cache = h.cache();
    let mut slot = LastUsedSlot::new(Role::Owner);

    for _ in 0..20 {
        let entry = cache.prepare(&0, &mut slot);
        assert!(entry.is_compiled());
        assert!(entry.is_passthrough());
        assert!(Arc::ptr_eq(&entry, cache.passthrough_entry()));
    }

    assert!(cache.is_empty());
    assert_eq!(cache.desc().generated.load(Ordering::SeqCst), 0);
    assert_eq!(h.compiler.pending(), 0);
}

#[test]
fn test_synchronous_prepare() {
    let h = Harness::new();
    let cache = h.cache();
    let mut slot = LastUsedSlot::new(Role::Owner);

    assert!(cache.prepare_sync(&h.backend, &14, &mut slot).is_compiled());
    assert!(cache.prepare_sync(&h.backend, &15, &mut slot).is_failed());
}

#[test]
fn test_corrupt_records_are_skipped() {
    let h = Harness::new();
    {
        let (mut file, _) =
            LinearDiskCache::open(&h.cache_path(), TestKey::SIZE, TEST_GEN_VERSION).unwrap();
        let good = compile_bytecode(&h.backend, "void main() { }");
        let bad_key = TestKey { id: 1, reserved: 9 };
        file.append(bad_key.to_bytes(), &good).unwrap();
        file.append(TestKey { id: 2, reserved: 0 }.to_bytes(), b"not bytecode").unwrap();
        file.append(TestKey { id: 4, reserved: 0 }.to_bytes(), &good).unwrap();
        file.close().unwrap();
    }

    let cache = h.cache();
    cache.open_disk_cache(&h.cache_path(), &h.backend, true).unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().corrupt_skipped, 2);

    // The rejected variant compiles normally
    let mut slot = LastUsedSlot::new(Role::Owner);
    assert!(cache.prepare_sync(&h.backend, &2, &mut slot).is_compiled());
}

#[test]
fn test_unopenable_disk_cache_runs_memory_only() {
    let h = Harness::new();
    let blocker = h.dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let cache = h.cache();
    assert!(cache.open_disk_cache(&blocker.join("x.cache"), &h.backend, true).is_err());
    assert!(cache.stats().disk_degraded);

    let mut slot = LastUsedSlot::new(Role::Owner);
    assert!(cache.prepare_sync(&h.backend, &2, &mut slot).is_compiled());
}

#[test]
fn test_replay_does_not_block_prepare() {
    let h = Harness::new();
    {
        let (mut file, _) =
            LinearDiskCache::open(&h.cache_path(), TestKey::SIZE, TEST_GEN_VERSION).unwrap();
        let bytecode = compile_bytecode(&h.backend, "void main() { }");
        for id in [2, 4, 6] {
            file.append(TestKey { id, reserved: 0 }.to_bytes(), &bytecode).unwrap();
        }
        file.close().unwrap();
    }

    let (entered_tx, entered_rx) = channel::unbounded();
    let (release_tx, release_rx) = channel::unbounded();
    let backend = GatedBackend {
        inner: NullBackend::new(),
        entered: entered_tx,
        release: release_rx,
    };
    let compiler = Arc::new(AsyncCompiler::new(backend.compiler(), 2).unwrap());
    let diagnostics = Arc::clone(&h.diagnostics);
    let cache = ProgramCache::new(TestStage::default(), &backend, compiler, diagnostics);
    let path = h.cache_path();

    thread::scope(|s| {
        let cache = &cache;
        let backend = &backend;
        let path = &path;
        let replay = s.spawn(move || cache.open_disk_cache(path, backend, true));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Replay is now parked inside create_artifact
        let (done_tx, done_rx) = channel::bounded(1);
        s.spawn(move || {
            let mut slot = LastUsedSlot::new(Role::Prewarm);
            let _ = done_tx.send(cache.prepare(&100, &mut slot));
        });
        let prepared = done_rx.recv_timeout(Duration::from_secs(5));

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        let report = replay.join().unwrap().unwrap();

        assert!(prepared.is_ok(), "prepare waited for replay to finish");
        assert_eq!(report.records.len(), 3);
    });

    assert_eq!(cache.len(), 4);
    let stats = cache.stats();
    assert_eq!(stats.loaded_from_disk, 3);
    assert_eq!(stats.prewarm_submitted, 1);
}
