//! Benchmark helpers for orecstm.

#![warn(missing_docs)]

pub mod utils;
