//! Transaction benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use orecstm_bench::utils::{new_refs, random_pairs};
use orecstm_core::{LockLevel, Stm, TransactionConfig};

/// Benchmark reads of a growing number of references.
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    for count in [1usize, 8, 32, 128].iter() {
        let stm = Stm::new();
        let refs = new_refs(&stm, *count, 7);
        let executor = stm.executor(TransactionConfig::new()).unwrap();

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let sum = executor
                    .execute(|tx| {
                        let mut sum = 0;
                        for reference in &refs {
                            sum += reference.get(tx)?;
                        }
                        Ok(sum)
                    })
                    .unwrap();
                black_box(sum);
            });
        });
    }
    group.finish();
}

/// Benchmark untracked reads of read-biased references.
fn bench_untracked_read(c: &mut Criterion) {
    let stm = Stm::new();
    let refs = new_refs(&stm, 32, 1);
    let config = TransactionConfig::new()
        .track_reads(false)
        .blocking_allowed(false)
        .readonly(true);
    let executor = stm.executor(config).unwrap();

    c.bench_function("read_untracked_32", |b| {
        b.iter(|| {
            let sum = executor
                .execute(|tx| {
                    let mut sum = 0;
                    for reference in &refs {
                        sum += reference.get(tx)?;
                    }
                    Ok(sum)
                })
                .unwrap();
            black_box(sum);
        });
    });
}

/// Benchmark transfers under each lock level.
fn bench_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer");
    let pairs = random_pairs(1024, 64);

    for lock_level in [
        LockLevel::Default,
        LockLevel::EnsureWrites,
        LockLevel::PrivatizeWrites,
    ] {
        let stm = Stm::new();
        let accounts = new_refs(&stm, 64, 1_000);
        let executor = stm
            .executor(TransactionConfig::new().lock_level(lock_level))
            .unwrap();

        group.bench_function(format!("{lock_level:?}"), |b| {
            let mut next = 0;
            b.iter(|| {
                let (from, to) = pairs[next % pairs.len()];
                next += 1;
                executor
                    .execute(|tx| {
                        accounts[from].increment(tx, -1)?;
                        accounts[to].increment(tx, 1)?;
                        Ok(())
                    })
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark a counter updated by alter, commute and atomic increments.
fn bench_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter");
    let stm = Stm::new();
    let counter = stm.new_ref(0_u64);

    group.bench_function("alter", |b| {
        b.iter(|| black_box(stm.atomic(|tx| counter.increment(tx, 1)).unwrap()));
    });

    group.bench_function("commute", |b| {
        b.iter(|| stm.atomic(|tx| counter.commute_increment(tx, 1)).unwrap());
    });

    group.bench_function("atomic", |b| {
        b.iter(|| black_box(counter.atomic_increment_and_get(1).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_read,
    bench_untracked_read,
    bench_transfer,
    bench_counter,
);

criterion_main!(benches);
