//! Benchmarks for per-draw shader lookup

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use oc_rsx::backend::null::NullBackend;
use oc_rsx::shader::{AsyncCompiler, DiagnosticsSink, LastUsedSlot, ProgramCache, Role, VertexStage};
use oc_rsx::{PipelineState, ShaderBackend};
use std::sync::Arc;

fn warmed_cache(backend: &NullBackend, variants: u32) -> ProgramCache<VertexStage, NullBackend> {
    let compiler = Arc::new(AsyncCompiler::new(backend.compiler(), 2).unwrap());
    let dumps = std::env::temp_dir().join("oc-rsx-bench-dumps");
    let diagnostics = Arc::new(DiagnosticsSink::new(dumps, false, true));
    let cache = ProgramCache::new(VertexStage, backend, compiler, diagnostics);

    let mut slot = LastUsedSlot::new(Role::Owner);
    for i in 0..variants {
        let mut state = PipelineState::new();
        state.vertex_program_hash = i as u64;
        cache.prepare_sync(backend, &state, &mut slot);
    }
    cache
}

fn bench_repeated_state(c: &mut Criterion) {
    let backend = NullBackend::new();
    let cache = warmed_cache(&backend, 1);
    let state = PipelineState::new();
    let mut slot = LastUsedSlot::new(Role::Owner);
    cache.prepare(&state, &mut slot);

    c.bench_function("prepare_fast_path", |b| {
        b.iter(|| black_box(cache.prepare(black_box(&state), &mut slot)));
    });
}

fn bench_alternating_states(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare_locked_lookup");
    let backend = NullBackend::new();

    for variants in [2u32, 64, 1024].iter() {
        let cache = warmed_cache(&backend, *variants);
        let states: Vec<PipelineState> = (0..*variants)
            .map(|i| {
                let mut state = PipelineState::new();
                state.vertex_program_hash = i as u64;
                state
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(variants), &states, |b, states| {
            let mut slot = LastUsedSlot::new(Role::Owner);
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % states.len();
                black_box(cache.prepare(&states[i], &mut slot))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_repeated_state, bench_alternating_states);
criterion_main!(benches);
