//! # orecstm Testkit
//!
//! Test utilities for orecstm.
//!
//! This crate provides:
//! - Fixtures: tracing setup, a bank of account references, a recording listener
//! - Property-based test generators using proptest
//! - Stress drivers that hammer the engine from several threads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use orecstm_testkit::prelude::*;
//!
//! #[test]
//! fn transfers_keep_the_total() {
//!     let bank = Bank::new(4, 100);
//!     bank.stm().atomic(|tx| bank.transfer(tx, 0, 1, 30)).unwrap();
//!     assert_eq!(bank.atomic_total(), 400);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
