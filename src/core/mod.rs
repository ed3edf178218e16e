//! Core ledger types
//!
//! Blocks, transactions, the consensus rules they are checked against,
//! difficulty and subsidy schedules, and the lock coordinator that
//! serializes access to the ledger.

pub mod block;
pub mod difficulty;
pub mod lock;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;
pub mod validation;

/// Double-SHA256 digest used for block and transaction ids
pub type Hash32 = [u8; 32];

pub use block::{expected_target, Block, BLOCK_HEADER_LENGTH, INITIAL_PREV_BLOCK, MAX_BLOCK_SIZE};
pub use difficulty::{next_target, Target};
pub use lock::{LockCoordinator, LockHold};
pub use monetary::{block_subsidy, minimum_fee, INITIAL_BLOCK_REWARD, SATOSHIS_PER_COIN};
pub use proof_of_work::ProofOfWork;
pub use transaction::{Transaction, TxInput, TxOutput, MAX_TX_SIZE};
pub use validation::{Rejection, TxRole, ValidationContext};
