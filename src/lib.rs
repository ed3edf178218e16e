//! # Architect Ledger - A File-Backed Block Ledger Node
//!
//! The storage and consensus core of a small proof-of-work currency: an
//! append-only block ledger kept in two flat files, the rules every block and
//! transaction is checked against, and the processors that feed it from
//! peers.
//!
//! ## What Is Here
//! - **Ledger**: index + data files, derived caches rebuilt from them, and
//!   two-slot checkpoints
//! - **Consensus**: block and transaction validation with named rejection
//!   reasons, difficulty retargeting and a decaying subsidy
//! - **Lock Coordinator**: the depth-bounded lock that serializes ledger
//!   mutation while validation re-enters the ledger
//! - **Block Processor**: accepts pushed blocks and settles same-height
//!   collisions
//! - **Synchronizer**: catches up from peers and rolls back orphaned tips
//!
//! ## Layout
//! - `core/`: blocks, transactions, validation, difficulty, subsidy, locking
//! - `storage/`: the ledger, its record stores and caches, the sled index
//! - `network/`: the peer trait, processors, synchronizer and node runtime
//! - `wallet/`: addresses and signing keys
//! - `config/`: node settings
//! - `utils/`: hashing, signatures and byte decoding
//! - `cli/`: command-line parsing

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{
    Block, LockCoordinator, ProofOfWork, Rejection, Target, Transaction, TxInput, TxOutput,
    ValidationContext,
};
pub use error::{BlockchainError, Result};
pub use network::{
    BlockProcessor, LoopbackNetwork, Network, Node, NodeContext, SubmitOutcome, Synchronizer,
    TxOutcome, TxProcessor,
};
pub use storage::{BlocksAfter, Ledger, LedgerObserver, SledTransactionIndex};
pub use wallet::{validate_address, Address, Wallet};
