//! Criterion benchmarks for the in-process step path.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use parvec_core::{AgentMajor, Options};
use parvec_test_utils::{RandomLifetimeEnv, ScriptedEnv};
use parvec_vector::{Seeds, SyncConfig, SyncVectorEnv, VectorEnv};

/// Action 1 for every agent in every env holding it.
fn all_ones<V: VectorEnv<Action = i64>>(venv: &V) -> AgentMajor<i64> {
    venv.ledger()
        .envs_have_agents()
        .iter()
        .filter(|(_, envs)| !envs.is_empty())
        .map(|(agent, envs)| (agent.clone(), envs.iter().map(|e| (*e, 1)).collect()))
        .collect()
}

fn bench_sync_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_step");
    for num_envs in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("scripted", num_envs), &num_envs, |b, &n| {
            let envs = (0..n).map(|_| ScriptedEnv::two_agents(50)).collect();
            let mut venv = SyncVectorEnv::new(envs, SyncConfig::default()).unwrap();
            venv.reset(Seeds::Broadcast(7), &Options::new()).unwrap();
            b.iter(|| {
                let actions = all_ones(&venv);
                black_box(venv.step(actions).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_ragged_step(c: &mut Criterion) {
    // Agents finish at random times, so every step reshapes the ledger.
    c.bench_function("sync_step/ragged_16x8", |b| {
        let envs = (0..16).map(|_| RandomLifetimeEnv::new(8, 20)).collect();
        let mut venv = SyncVectorEnv::new(envs, SyncConfig::default()).unwrap();
        venv.reset(Seeds::PerEnv((0..16).collect()), &Options::new())
            .unwrap();
        b.iter(|| {
            let actions = all_ones(&venv);
            black_box(venv.step(actions).unwrap());
        });
    });
}

fn bench_debug_checks(c: &mut Criterion) {
    c.bench_function("sync_step/debug_8", |b| {
        let envs = (0..8).map(|_| ScriptedEnv::two_agents(50)).collect();
        let mut venv = SyncVectorEnv::new(envs, SyncConfig { debug: true }).unwrap();
        venv.reset(Seeds::Unseeded, &Options::new()).unwrap();
        b.iter(|| {
            let actions = all_ones(&venv);
            black_box(venv.step(actions).unwrap());
        });
    });
}

criterion_group!(benches, bench_sync_step, bench_ragged_step, bench_debug_checks);
criterion_main!(benches);
