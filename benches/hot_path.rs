//! Criterion benchmarks for the per-message path: frame decode and barrier
//! evaluation.
//!
//! Run: `cargo bench`

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use race_strategy_aggregator::aggregator::{Barrier, TriggerPolicy};
use race_strategy_aggregator::source::{Overtake, TireCliff, Undercut, decode};
use race_strategy_aggregator::types::Snapshot;

/// Overtake frame with `n` drivers, a third of them at zero.
fn overtake_json(n: usize, revision: u64) -> String {
    let drivers: Vec<String> = (0..n).map(|i| format!("\"D{i:02}\":{}", i % 3)).collect();
    format!("{{{},\"refresh_count\":{revision}}}", drivers.join(","))
}

fn tire_cliff_json(revision: u64) -> String {
    let vector: Vec<String> = (0..32).map(|i| format!("0.{:03}", i * 31 % 1000)).collect();
    format!(
        r#"{{"MY_CAR":{{"matches_found":30,"max_similarity":0.912,"risk_detected":true,"simulated_vector":[{}]}},"refresh_count":{revision}}}"#,
        vector.join(",")
    )
}

fn undercut_json(revision: u64) -> String {
    format!(
        r#"{{"MY_CAR":{{"total_matches":10,"relevant_matches":6,"simulated_vector":[0.9,0.21,0.41]}},"refresh_count":{revision}}}"#
    )
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let overtake = overtake_json(20, 10);
    group.bench_function("overtake_20", |b| {
        b.iter(|| decode(&Overtake, black_box(&overtake)).unwrap());
    });

    let tire_cliff = tire_cliff_json(10);
    group.bench_function("tire_cliff", |b| {
        b.iter(|| decode(&TireCliff, black_box(&tire_cliff)).unwrap());
    });

    let undercut = undercut_json(10);
    group.bench_function("undercut", |b| {
        b.iter(|| decode(&Undercut, black_box(&undercut)).unwrap());
    });

    group.finish();
}

/// One full race window: every source advances 1..=10 in round-robin order,
/// ending in a single dispatch.
fn window_updates() -> Vec<Snapshot> {
    (1..=10)
        .flat_map(|rev| {
            [
                decode(&Overtake, &overtake_json(20, rev)).unwrap(),
                decode(&TireCliff, &tire_cliff_json(rev)).unwrap(),
                decode(&Undercut, &undercut_json(rev)).unwrap(),
            ]
        })
        .collect()
}

fn bench_barrier(c: &mut Criterion) {
    let updates = window_updates();

    c.bench_function("barrier/window_of_30", |b| {
        b.iter_batched(
            || (Barrier::new(TriggerPolicy::default()), updates.clone()),
            |(mut barrier, updates)| {
                for snapshot in updates {
                    barrier.observe(snapshot);
                    black_box(barrier.poll());
                }
                barrier.generation()
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_decode, bench_barrier);
criterion_main!(benches);
