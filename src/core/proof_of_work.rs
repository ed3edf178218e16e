use crate::core::{
    block_subsidy, expected_target, Block, Hash32, Transaction, TxRole, ValidationContext,
    BLOCK_HEADER_LENGTH, INITIAL_PREV_BLOCK, MAX_BLOCK_SIZE,
};
use crate::error::{BlockchainError, Result};
use crate::storage::Ledger;
use crate::wallet::Address;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Nonces tried between checks of the stop flag
const CHECK_STOP_EVERY: u64 = 4096;

pub struct ProofOfWork {
    block: Block,
}

impl ProofOfWork {
    pub fn new_proof_of_work(block: Block) -> ProofOfWork {
        ProofOfWork { block }
    }

    /// Builds an unmined block on top of block `ref_id` (`None` for genesis).
    /// Candidates that fail validation, conflict with an earlier candidate or
    /// do not fit are left out; the coinbase pays the subsidy plus the fees
    /// of the ones taken.
    pub fn block_template(
        ledger: &Ledger,
        ref_id: Option<u32>,
        miner: &Address,
        time: u64,
        candidates: Vec<Transaction>,
        allowable: usize,
    ) -> Result<Block> {
        let _hold = ledger.lock_coordinator().acquire(allowable)?;
        let previous = match ref_id {
            Some(id) => Some(
                ledger
                    .block_by_id(id, allowable + 1)?
                    .ok_or_else(|| BlockchainError::Io(format!("block {id} is not in the ledger")))?,
            ),
            None => None,
        };
        let prev_hash = previous.as_ref().map_or(INITIAL_PREV_BLOCK, |b| b.hash());
        let next_id = ref_id.map_or(0, |id| id + 1);
        let target = expected_target(ledger, previous.as_ref().zip(ref_id), allowable + 1)?;
        let mut block = Block::new(prev_hash, time, target);

        let ctx = ValidationContext::current()?;
        // Room for the header and a coinbase with one output
        let mut size = BLOCK_HEADER_LENGTH + 32 + 4 + 256;
        let mut spent: HashSet<(Hash32, u32)> = HashSet::new();
        let mut fees: u64 = 0;
        for tx in candidates {
            let tx_size = 32 + 4 + tx.raw_len();
            if size + tx_size > MAX_BLOCK_SIZE {
                continue;
            }
            if tx
                .get_inputs()
                .any(|input| spent.contains(&(input.ref_tx_hash, input.ref_out)))
            {
                continue;
            }
            let fee = match tx.validate_after(ledger, ref_id, TxRole::Free, &ctx, allowable + 1) {
                Ok(fee) => fee,
                Err(BlockchainError::Consensus(reason)) => {
                    debug!("Leaving out tx {}: {reason}", tx.hash_hex());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(total) = fees.checked_add(fee) else {
                continue;
            };
            fees = total;
            size += tx_size;
            spent.extend(tx.get_inputs().map(|input| (input.ref_tx_hash, input.ref_out)));
            block.add_transaction(tx);
        }

        let reward = block_subsidy(next_id)
            .checked_add(fees)
            .ok_or_else(|| BlockchainError::Transaction("reward overflows".to_string()))?;
        block.add_first_transaction(Transaction::new_coinbase(time, *miner, reward)?);
        info!(
            "Prepared block #{next_id} with {} transactions, {fees} in fees",
            block.get_transactions().len()
        );
        Ok(block)
    }

    /// True when the block's hash is not above its declared target
    pub fn validate(block: &Block) -> bool {
        block.get_target().is_met_by(&block.compute_hash())
    }

    /// Searches nonces from the block's current one until the hash meets the
    /// target. Returns `None` when the nonce space runs out or `stop` is set.
    pub fn run(self, stop: &AtomicBool) -> Option<Block> {
        let mut block = self.block;
        let start = block.get_nonce();
        debug!("Mining block on top of {}", data_encoding::HEXLOWER.encode(block.get_prev_block_hash()));
        let mut nonce = start;
        loop {
            block.set_nonce(nonce);
            if Self::validate(&block) {
                info!("Mined block {} after {} attempts", block.hash_hex(), nonce - start + 1);
                return Some(block);
            }
            if (nonce - start) % CHECK_STOP_EVERY == 0 && stop.load(Ordering::Relaxed) {
                return None;
            }
            nonce = nonce.checked_add(1)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::INITIAL_PREV_BLOCK;
    use crate::core::{Target, Transaction};
    use crate::wallet::Address;

    fn create_test_block(target: Target) -> Block {
        let address = Address::from_public_key(&[1u8; 65]);
        let mut block = Block::new(INITIAL_PREV_BLOCK, 1_000, target);
        block.add_transaction(Transaction::new_coinbase(1_000, address, 50).unwrap());
        block
    }

    #[test]
    fn test_mined_block_validates() {
        let block = ProofOfWork::new_proof_of_work(create_test_block(Target::EASIEST))
            .run(&AtomicBool::new(false))
            .unwrap();
        assert!(ProofOfWork::validate(&block));
        assert!(block.get_target().is_met_by(&block.hash()));
    }

    #[test]
    fn test_stop_flag_aborts_search() {
        let mut impossible = [0u8; 32];
        impossible[31] = 0;
        let block = create_test_block(Target::from_bytes(impossible));
        assert!(ProofOfWork::new_proof_of_work(block)
            .run(&AtomicBool::new(true))
            .is_none());
    }

    #[test]
    fn test_validate_rejects_unmined_hard_block() {
        let block = create_test_block(Target::from_bytes([0u8; 32]));
        assert!(!ProofOfWork::validate(&block));
    }
}
