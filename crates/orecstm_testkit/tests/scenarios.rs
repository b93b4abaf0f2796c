//! Cross-module scenarios run against the public API.

use orecstm_core::{
    IsolationLevel, LockLevel, Orec, Stm, StmError, TransactionConfig, TransactionEvent,
};
use orecstm_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_transfers_preserve_total() {
    init_tracing();
    let (result, bank) = run_bank_transfers(&StressConfig::quick());
    result.print_summary("concurrent transfers");
    assert_eq!(result.failed_ops, 0);
    assert_eq!(bank.atomic_total(), bank.expected_total());
}

#[test]
fn transfers_preserve_total_under_every_lock_level() {
    init_tracing();
    for lock_level in [
        LockLevel::Default,
        LockLevel::EnsureReads,
        LockLevel::EnsureWrites,
        LockLevel::PrivatizeReads,
        LockLevel::PrivatizeWrites,
    ] {
        let config = StressConfig {
            operations: 100,
            transaction: TransactionConfig::new().lock_level(lock_level),
            ..StressConfig::quick()
        };
        let (result, bank) = run_bank_transfers(&config);
        assert_eq!(result.failed_ops, 0, "{lock_level:?}");
        assert_eq!(bank.atomic_total(), bank.expected_total(), "{lock_level:?}");
    }
}

#[test]
fn readers_never_see_a_torn_total() {
    init_tracing();
    for isolation_level in [IsolationLevel::Snapshot, IsolationLevel::Serializable] {
        let config = StressConfig {
            transaction: TransactionConfig::new().isolation_level(isolation_level),
            ..StressConfig::quick()
        };
        let (result, bank) = run_snapshot_readers(&config);
        assert_eq!(result.failed_ops, 0, "{isolation_level:?}");
        assert_eq!(bank.atomic_total(), bank.expected_total());
    }
}

#[test]
fn commuting_counter_counts_every_increment() {
    init_tracing();
    let config = StressConfig::quick();
    let (result, counter) = run_commuting_counter(&config);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(
        counter.atomic_get().unwrap(),
        (config.threads * config.operations) as u64
    );
}

#[test]
fn atomic_counter_counts_every_success() {
    let (result, counter) = run_atomic_counter(&StressConfig::quick());
    assert_eq!(counter.atomic_get().unwrap(), result.successful_ops as u64);
    assert_eq!(counter.orec().surplus(), 0);
}

#[test]
fn blocked_consumer_wakes_for_producer() {
    init_tracing();
    let stm = Stm::new();
    let queue = stm.new_ref(Vec::<u32>::new());

    let consumer = {
        let stm = stm.clone();
        let queue = queue.clone();
        thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < 3 {
                let item = stm.atomic(|tx| {
                    let mut items = queue.get(tx)?;
                    if items.is_empty() {
                        return tx.retry();
                    }
                    let item = items.remove(0);
                    queue.set(tx, items)?;
                    Ok(item)
                })?;
                received.push(item);
            }
            Ok::<_, StmError>(received)
        })
    };

    for item in 1..=3 {
        thread::sleep(Duration::from_millis(10));
        stm.atomic(|tx| {
            queue.alter(tx, |mut items| {
                items.push(item);
                items
            })
        })
        .unwrap();
    }

    assert_eq!(consumer.join().unwrap().unwrap(), vec![1, 2, 3]);
}

#[test]
fn serializable_prevents_write_skew_between_threads() {
    init_tracing();
    // Two on-call doctors; each may leave only while the other stays.
    let stm = Stm::new();
    let alice = stm.new_ref(true);
    let bob = stm.new_ref(true);
    let executor = Arc::new(
        stm.executor(TransactionConfig::new().isolation_level(IsolationLevel::Serializable))
            .unwrap(),
    );

    let handles: Vec<_> = [(alice.clone(), bob.clone()), (bob.clone(), alice.clone())]
        .into_iter()
        .map(|(me, other)| {
            let executor = Arc::clone(&executor);
            thread::spawn(move || {
                executor.execute(|tx| {
                    if me.get(tx)? && other.get(tx)? {
                        me.set(tx, false)?;
                    }
                    Ok(())
                })
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(alice.atomic_get().unwrap() || bob.atomic_get().unwrap());
}

#[test]
fn permanent_listener_sees_every_commit() {
    let stm = Stm::new();
    let listener = Arc::new(RecordingListener::new());
    let executor = stm
        .executor(TransactionConfig::new().permanent_listener(listener.clone()))
        .unwrap();
    let counter = stm.new_ref(0_i32);

    for _ in 0..5 {
        executor.execute(|tx| counter.increment(tx, 1)).unwrap();
    }

    assert_eq!(listener.count(TransactionEvent::PostCommit), 5);
    assert_eq!(listener.count(TransactionEvent::PrePrepare), 5);
    assert_eq!(listener.count(TransactionEvent::PostAbort), 0);
}

#[test]
fn read_biased_threshold_is_per_stm() {
    let stm = stm_with_threshold(3);
    let bank = Bank::with_stm(stm, 1, 0);
    for _ in 0..3 {
        bank.atomic_total();
    }
    assert!(bank.account(0).orec().is_read_biased());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_transfers_preserve_total(
        transfers in transfers_strategy(6, 20),
        config in transaction_config_strategy(),
    ) {
        let bank = Bank::new(6, 100);
        let executor = bank.stm().executor(config).unwrap();
        for transfer in &transfers {
            executor
                .execute(|tx| bank.transfer(tx, transfer.from, transfer.to, transfer.amount))
                .unwrap();
        }
        prop_assert_eq!(bank.atomic_total(), bank.expected_total());
    }

    #[test]
    fn batched_transfers_match_sequential_model(transfers in transfers_strategy(4, 12)) {
        let bank = Bank::new(4, 50);
        bank.stm()
            .atomic(|tx| {
                for transfer in &transfers {
                    bank.transfer(tx, transfer.from, transfer.to, transfer.amount)?;
                }
                Ok(())
            })
            .unwrap();

        let mut model = [50_i64; 4];
        for transfer in &transfers {
            if transfer.from != transfer.to {
                model[transfer.from] -= transfer.amount;
                model[transfer.to] += transfer.amount;
            }
        }
        for (index, expected) in model.iter().enumerate() {
            prop_assert_eq!(bank.account(index).atomic_get().unwrap(), *expected);
        }
    }

    #[test]
    fn orec_surplus_tracks_arrivals(ops in orec_ops_strategy(64)) {
        let orec = Orec::new(orecstm_core::orec::MAX_READ_BIASED_THRESHOLD);
        let mut arrived = 0_u64;
        for op in ops {
            match op {
                OrecOp::Arrive => {
                    prop_assert!(orec.arrive(1).has_depart_obligation());
                    arrived += 1;
                }
                OrecOp::DepartAfterReading if arrived > 0 => {
                    orec.depart_after_reading();
                    arrived -= 1;
                }
                OrecOp::DepartAfterFailure if arrived > 0 => {
                    orec.depart_after_failure();
                    arrived -= 1;
                }
                _ => {}
            }
            let state = orec.state();
            prop_assert_eq!(state.surplus(), arrived);
            prop_assert!(!state.has_any_lock());
            prop_assert!(!state.is_read_biased());
        }
    }
}
