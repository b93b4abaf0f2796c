//! Stress drivers for orecstm.
//!
//! These drivers run workloads from several threads at once so tests can check
//! invariants that only break under contention.

use crate::fixtures::Bank;
use orecstm_core::{Stm, StmResult, TransactionConfig, TxnRef};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of a stress test run.
#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }

    /// Renders the result as JSON, for collecting runs in CI artifacts.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("Failed to serialize stress result")
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations performed by each thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of accounts in bank workloads.
    pub accounts: usize,
    /// Starting balance of every account.
    pub initial_balance: i64,
    /// Configuration of the transactions the drivers run.
    pub transaction: TransactionConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            accounts: 16,
            initial_balance: 1_000,
            transaction: TransactionConfig::new(),
        }
    }
}

impl StressConfig {
    /// Creates a small configuration suitable for unit tests.
    pub fn quick() -> Self {
        Self {
            operations: 200,
            threads: 4,
            accounts: 8,
            ..Self::default()
        }
    }
}

/// Runs `worker` on `threads` threads released at the same moment and tallies
/// the operations each reported as successful and failed.
fn run_threads<F>(threads: usize, worker: F) -> StressTestResult
where
    F: Fn(usize) -> (usize, usize) + Send + Sync + 'static,
{
    let worker = Arc::new(worker);
    let barrier = Arc::new(Barrier::new(threads));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let worker = Arc::clone(&worker);
            let barrier = Arc::clone(&barrier);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                barrier.wait();
                let (ok, err) = worker(index);
                successful.fetch_add(ok, Ordering::Relaxed);
                failed.fetch_add(err, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs random transfers between the accounts of a fresh bank.
///
/// Returns the bank so the caller can check that the total was preserved.
pub fn run_bank_transfers(config: &StressConfig) -> (StressTestResult, Bank) {
    let bank = Bank::new(config.accounts, config.initial_balance);
    let executor = Arc::new(
        bank.stm()
            .executor(config.transaction.clone())
            .expect("Invalid transaction config"),
    );

    let accounts = config.accounts;
    let operations = config.operations;
    let shared = bank.clone();
    let result = run_threads(config.threads, move |_| {
        let mut rng = rand::thread_rng();
        let mut ok = 0;
        let mut err = 0;
        for _ in 0..operations {
            let from = rng.gen_range(0..accounts);
            let to = rng.gen_range(0..accounts);
            let amount = rng.gen_range(1..=10);
            match executor.execute(|tx| shared.transfer(tx, from, to, amount)) {
                Ok(()) => ok += 1,
                Err(error) => {
                    debug!(%error, "transfer failed");
                    err += 1;
                }
            }
        }
        (ok, err)
    });
    (result, bank)
}

/// Runs transfers on half the threads while the other half sums all balances.
///
/// A reader that sees a total different from the starting total is counted as a
/// failed operation, so with a consistent isolation level `failed_ops` must be 0.
pub fn run_snapshot_readers(config: &StressConfig) -> (StressTestResult, Bank) {
    let bank = Bank::new(config.accounts, config.initial_balance);
    let executor = Arc::new(
        bank.stm()
            .executor(config.transaction.clone())
            .expect("Invalid transaction config"),
    );

    let accounts = config.accounts;
    let operations = config.operations;
    let shared = bank.clone();
    let result = run_threads(config.threads.max(2), move |index| {
        let mut ok = 0;
        let mut err = 0;
        if index % 2 == 0 {
            let mut rng = rand::thread_rng();
            for _ in 0..operations {
                let from = rng.gen_range(0..accounts);
                let to = rng.gen_range(0..accounts);
                match executor.execute(|tx| shared.transfer(tx, from, to, 1)) {
                    Ok(()) => ok += 1,
                    Err(_) => err += 1,
                }
            }
        } else {
            let expected = shared.expected_total();
            for _ in 0..operations {
                match executor.execute(|tx| shared.total(tx)) {
                    Ok(total) if total == expected => ok += 1,
                    Ok(total) => {
                        debug!(total, expected, "inconsistent snapshot");
                        err += 1;
                    }
                    Err(_) => err += 1,
                }
            }
        }
        (ok, err)
    });
    (result, bank)
}

/// Commutes increments of a single counter from every thread.
///
/// Returns the counter so the caller can compare it with the successful count.
pub fn run_commuting_counter(config: &StressConfig) -> (StressTestResult, TxnRef<u64>) {
    let stm = Stm::new();
    let counter = stm.new_ref(0_u64);
    let executor = Arc::new(
        stm.executor(config.transaction.clone())
            .expect("Invalid transaction config"),
    );

    let operations = config.operations;
    let shared = counter.clone();
    let result = run_threads(config.threads, move |_| {
        let mut ok = 0;
        let mut err = 0;
        for _ in 0..operations {
            match executor.execute(|tx| shared.commute_increment(tx, 1)) {
                Ok(()) => ok += 1,
                Err(_) => err += 1,
            }
        }
        (ok, err)
    });
    (result, counter)
}

/// Increments a single counter with atomic operations from every thread.
pub fn run_atomic_counter(config: &StressConfig) -> (StressTestResult, TxnRef<u64>) {
    let stm = Stm::new();
    let counter = stm.new_ref(0_u64);

    let operations = config.operations;
    let shared = counter.clone();
    let result = run_threads(config.threads, move |_| {
        let mut ok = 0;
        let mut err = 0;
        for _ in 0..operations {
            let outcome: StmResult<u64> = shared.atomic_increment_and_get(1);
            match outcome {
                Ok(_) => ok += 1,
                Err(_) => err += 1,
            }
        }
        (ok, err)
    });
    (result, counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_computes_throughput() {
        let result = StressTestResult::new(90, 10, Duration::from_secs(2));
        assert_eq!(result.total_ops, 100);
        assert!((result.ops_per_second - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn result_serializes() {
        let result = StressTestResult::new(1, 0, Duration::from_millis(5));
        let json: serde_json::Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(json["successful_ops"], 1);
    }

    #[test]
    fn bank_transfers_preserve_total() {
        let (result, bank) = run_bank_transfers(&StressConfig::quick());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(bank.atomic_total(), bank.expected_total());
    }
}
