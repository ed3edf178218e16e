//! Block propagation and chain synchronization
//!
//! The wire transport is not part of this crate. Everything here talks to
//! peers through the [`Network`] trait; [`LoopbackNetwork`] implements it
//! in-process on top of other ledgers.

pub mod loopback;
pub mod node;
pub mod processor;
pub mod synchronizer;

use crate::core::Hash32;
use crate::error::Result;
use crate::storage::BlocksAfter;

/// Peer-facing collaborator used by the processors and the synchronizer.
pub trait Network: Send + Sync {
    /// Asks every reachable peer for up to `count` blocks after `hash`.
    /// Returns one answer per peer that replied.
    fn request_blocks_after(&self, hash: &Hash32, count: usize) -> Result<Vec<BlocksAfter>>;

    fn broadcast_block_found(&self, hash: &Hash32, raw: &[u8]) -> Result<()>;

    fn broadcast_transaction(&self, hash: &Hash32, raw: &[u8]) -> Result<()>;
}

pub use loopback::{Broadcast, LoopbackNetwork};
pub use node::{Node, NodeContext};
pub use processor::{BlockProcessor, SubmitOutcome, TxOutcome, TxProcessor};
pub use synchronizer::{CycleOutcome, SyncState, SyncStatus, Synchronizer};
