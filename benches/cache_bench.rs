//! Benchmarks for the paged KV cache subsystem.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mlxr_core::cache::eviction::EvictionManager;
use mlxr_core::cache::pager::Pager;
use mlxr_core::config::{ArenaConfig, EvictionConfig, EvictionPolicyKind, ModelConfig};

fn bench_model() -> ModelConfig {
    ModelConfig {
        num_layers: 2,
        num_query_heads: 4,
        num_kv_heads: 2,
        head_dim: 8,
        block_size: 16,
        vocab_size: 1000,
        eos_token_id: None,
    }
}

fn filled_pager(num_blocks: usize, capacity: usize) -> Pager {
    let model = bench_model();
    let arena_cfg = ArenaConfig {
        gpu_capacity_blocks: capacity,
        cpu_capacity_blocks: capacity,
        enable_cpu_overflow: true,
    };
    let mut pager = Pager::new(&model, &arena_cfg);
    pager.create(1, None, 0).unwrap();
    pager.ensure_capacity(1, num_blocks * model.block_size).unwrap();
    pager
}

/// One eviction round over 10k candidates, trimming from 95% back to 90%
/// usage — a single round's candidate-collection-and-rank cost, not a
/// drain-to-empty.
fn bench_eviction_scoring(c: &mut Criterion) {
    let eviction_cfg = EvictionConfig {
        policy: EvictionPolicyKind::Lru,
        eviction_threshold: 0.90,
        target_usage: 0.89,
        min_blocks_per_sequence: 0,
        enable_persistence: false,
        persistence_dir: std::env::temp_dir().join("mlxr-bench"),
    };
    let mgr = EvictionManager::new(eviction_cfg);

    c.bench_function("eviction_rank_10k_candidates", |b| {
        b.iter_batched(
            || filled_pager(9_500, 10_000),
            |mut pager| {
                let evicted = mgr.maybe_evict(&mut pager).unwrap();
                black_box(evicted);
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

fn bench_block_for_token_lookup(c: &mut Criterion) {
    let pager = filled_pager(10_000, 10_000);

    c.bench_function("block_for_token_10k_blocks", |b| {
        b.iter(|| {
            for pos in (0..10_000 * 16).step_by(997) {
                black_box(pager.block_for_token(1, pos).ok());
            }
        })
    });
}

criterion_group!(benches, bench_eviction_scoring, bench_block_for_token_lookup);
criterion_main!(benches);
