use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use saksflyt_core::{CaseId, CaseRecord, CaseStatus, CaseType, ProcessingMode, reachable, transition};
use saksflyt_events::InMemoryEventStream;
use saksflyt_infra::collaborators::{InMemoryCollaborators, RetryPolicy};
use saksflyt_infra::{InMemoryCaseStore, OrchestratorConfig, SagaServices, case_orchestrator};

/// Every (from, to, mode) combination through the pure state machine.
fn bench_transition_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_machine");
    let pairs = CaseStatus::ALL.len() * CaseStatus::ALL.len() * 2;
    group.throughput(Throughput::Elements(pairs as u64));

    group.bench_function("transition_all_pairs", |b| {
        b.iter(|| {
            let mut accepted = 0usize;
            for mode in [ProcessingMode::Manual, ProcessingMode::Automatic] {
                for from in CaseStatus::ALL {
                    for to in CaseStatus::ALL {
                        if transition(black_box(from), black_box(to), mode).is_ok() {
                            accepted += 1;
                        }
                    }
                }
            }
            accepted
        })
    });

    group.bench_function("reachable_automatic", |b| {
        b.iter(|| {
            CaseStatus::ALL
                .iter()
                .map(|s| reachable(black_box(*s), ProcessingMode::Automatic).len())
                .sum::<usize>()
        })
    });

    group.finish();
}

/// Open `cases` cases and drive the stream until every saga has finished.
fn run_sagas(cases: usize, partitions: u32) -> usize {
    let config = OrchestratorConfig::default()
        .with_instance("bench-0")
        .with_partitions(partitions)
        .with_workers(1);
    let stream = Arc::new(InMemoryEventStream::new(config.partitions));
    let store = Arc::new(InMemoryCaseStore::new());
    let services = Arc::new(SagaServices::with_collaborators(
        store.clone(),
        Arc::new(InMemoryCollaborators::new().with_coordination_required(true)),
        RetryPolicy::fixed(1, Duration::ZERO),
    ));
    let orchestrator = case_orchestrator(&config, stream, services).unwrap();

    for i in 0..cases {
        let case_type = if i % 2 == 0 {
            CaseType::Barnepensjon
        } else {
            CaseType::Omstillingsstoenad
        };
        let record = CaseRecord::new(CaseId::new(), case_type, ProcessingMode::Automatic);
        orchestrator.dispatcher().open_case(store.as_ref(), record).unwrap();
    }

    orchestrator.run_until_idle(10_000).unwrap().processed
}

fn bench_full_saga(c: &mut Criterion) {
    let mut group = c.benchmark_group("saga");

    for cases in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(cases as u64));
        group.bench_with_input(BenchmarkId::new("automatic_to_iverksatt", cases), &cases, |b, &n| {
            b.iter(|| black_box(run_sagas(n, 4)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_transition_table, bench_full_saga);
criterion_main!(benches);
