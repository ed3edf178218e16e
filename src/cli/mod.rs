//! Command-line interface
//!
//! Argument parsing for the `architect-ledger` binary. The commands
//! themselves run in `main.rs`.

pub mod commands;

pub use commands::{Command, Opt};
