//! Benchmark utilities.

use orecstm_core::{Stm, TxnRef};
use rand::Rng;

/// Creates `count` references holding `initial` each.
pub fn new_refs(stm: &Stm, count: usize, initial: i64) -> Vec<TxnRef<i64>> {
    (0..count).map(|_| stm.new_ref(initial)).collect()
}

/// Generates `count` random account pairs below `accounts`.
pub fn random_pairs(count: usize, accounts: usize) -> Vec<(usize, usize)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| (rng.gen_range(0..accounts), rng.gen_range(0..accounts)))
        .collect()
}
