//! Test utilities for ledger testing

use crate::core::{Block, LockCoordinator, ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::Ledger;
use crate::utils::current_unix_time;
use crate::wallet::{Address, Wallet};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

/// Genesis blocks are dated this far in the past so that a chain of one
/// block per second stays behind the local clock
pub const GENESIS_AGE_SECS: u64 = 3_000;

/// Create a temporary directory for testing
pub fn create_temp_dir() -> Result<TempDir> {
    tempfile::tempdir().map_err(|e| BlockchainError::Io(e.to_string()))
}

pub fn open_test_ledger(dir: &Path) -> Result<Arc<Ledger>> {
    Ok(Arc::new(Ledger::open(dir, LockCoordinator::standalone("test"), vec![])?))
}

/// Create an empty ledger with temporary storage
pub fn create_test_ledger() -> Result<(Arc<Ledger>, TempDir)> {
    let temp_dir = create_temp_dir()?;
    let ledger = open_test_ledger(temp_dir.path())?;
    Ok((ledger, temp_dir))
}

/// One second after the parent, or well in the past for a genesis block
pub fn next_block_time(ledger: &Ledger, ref_id: Option<u32>) -> Result<u64> {
    match ref_id {
        Some(id) => {
            let parent = ledger
                .block_by_id(id, 0)?
                .ok_or_else(|| BlockchainError::Io(format!("no block {id}")))?;
            Ok(parent.get_time() + 1)
        }
        None => Ok(current_unix_time()? - GENESIS_AGE_SECS),
    }
}

/// Mine a block on top of block `ref_id` holding `transactions` after the
/// coinbase. The block is not added to the ledger.
pub fn mine_block_after(
    ledger: &Ledger,
    ref_id: Option<u32>,
    miner: &Address,
    transactions: Vec<Transaction>,
) -> Result<Block> {
    let time = next_block_time(ledger, ref_id)?;
    let template = ProofOfWork::block_template(ledger, ref_id, miner, time, transactions, 0)?;
    ProofOfWork::new_proof_of_work(template)
        .run(&AtomicBool::new(false))
        .ok_or_else(|| BlockchainError::Transaction("nonce space exhausted".to_string()))
}

/// Mine a block on top of the current tip
pub fn mine_next_block(ledger: &Ledger, miner: &Address, transactions: Vec<Transaction>) -> Result<Block> {
    mine_block_after(ledger, ledger.length().checked_sub(1), miner, transactions)
}

/// Mine and append `count` coinbase-only blocks
pub fn extend_chain(ledger: &Ledger, miner: &Address, count: u32) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    for _ in 0..count {
        let block = mine_next_block(ledger, miner, vec![])?;
        ledger.append(&block, 0)?;
        blocks.push(block);
    }
    Ok(blocks)
}

/// Spend output `out` of `source` owned by `wallet`: `value` goes to `to`
/// and `change` back to the wallet. Whatever is left is the fee.
pub fn create_spend(
    wallet: &Wallet,
    source: &Transaction,
    out: u32,
    to: Address,
    value: u64,
    change: u64,
) -> Result<Transaction> {
    let mut tx = Transaction::new(current_unix_time()?);
    tx.add_output(to, value)?;
    if change > 0 {
        tx.add_output(wallet.get_address(), change)?;
    }
    tx.add_input(source.hash(), out, wallet)?;
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{block_subsidy, ValidationContext};

    #[test]
    fn test_create_test_ledger() {
        let (ledger, _temp_dir) = create_test_ledger().unwrap();
        assert_eq!(ledger.length(), 0);
    }

    #[test]
    fn test_extended_chain_validates() {
        let (ledger, _temp_dir) = create_test_ledger().unwrap();
        let miner = Wallet::new().unwrap().get_address();
        let blocks = extend_chain(&ledger, &miner, 3).unwrap();
        assert_eq!(ledger.length(), 3);
        assert_eq!(blocks[2].get_time(), blocks[0].get_time() + 2);

        let next = mine_next_block(&ledger, &miner, vec![]).unwrap();
        let ctx = ValidationContext::current().unwrap();
        next.validate_after(&ledger, Some(2), &ctx, 0).unwrap();
        let coinbase = &next.get_transactions()[0];
        assert_eq!(coinbase.get_output(0).unwrap().value, block_subsidy(3));
    }
}
