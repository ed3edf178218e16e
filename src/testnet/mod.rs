//! Helpers for tests that need a real ledger on disk
//!
//! Ledgers live in temporary directories and blocks are mined against the
//! easiest target, which takes a few thousand hashes per block.

pub mod test_utils;

pub use test_utils::*;
