use crate::core::{minimum_fee, Block, Hash32, Rejection, Transaction, TxRole, ValidationContext, INITIAL_PREV_BLOCK};
use crate::error::{BlockchainError, Result};
use crate::network::{Network, SyncStatus};
use crate::storage::Ledger;
use crate::wallet::Address;
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::sync::Arc;

/// What happened to a submitted block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Already in the ledger
    Known,
    /// Parent unknown or too far behind the tip
    Ignored,
    Accepted { id: u32 },
    /// Won a same-height collision and replaced the tip
    ReplacedTip { id: u32 },
    /// Lost a same-height collision
    KeptExisting,
    Rejected(Rejection),
}

/// Where the candidate sits relative to the tip
enum Placement {
    ExtendsTip(Option<u32>),
    CollidesWithTip(Option<u32>),
}

/// Accepts blocks pushed by peers or found locally.
pub struct BlockProcessor {
    ledger: Arc<Ledger>,
    network: Arc<dyn Network>,
    status: Arc<SyncStatus>,
}

impl BlockProcessor {
    pub fn new(ledger: Arc<Ledger>, network: Arc<dyn Network>, status: Arc<SyncStatus>) -> BlockProcessor {
        BlockProcessor {
            ledger,
            network,
            status,
        }
    }

    pub fn submit(&self, hash: Hash32, raw: &[u8], source: &str) -> Result<SubmitOutcome> {
        let ledger = &self.ledger;
        let _hold = ledger.lock_coordinator().acquire(0)?;
        let hash_hex = HEXLOWER.encode(&hash);
        if ledger.id_for_hash(&hash, 1)?.is_some() {
            debug!(target: "processor", "Block {hash_hex} from {source} is known");
            return Ok(SubmitOutcome::Known);
        }

        let block = match Block::from_raw(hash, raw) {
            Ok(block) => block,
            Err(BlockchainError::Consensus(reason)) => {
                warn!(target: "processor", "Rejected block {hash_hex} from {source}: {reason}");
                return Ok(SubmitOutcome::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        let Some(placement) = self.placement(&block)? else {
            debug!(target: "processor", "Ignoring block {hash_hex} from {source}: parent is not near the tip");
            return Ok(SubmitOutcome::Ignored);
        };
        let ref_id = match placement {
            Placement::ExtendsTip(ref_id) | Placement::CollidesWithTip(ref_id) => ref_id,
        };
        let ctx = ValidationContext::current()?;
        match block.validate_after(ledger, ref_id, &ctx, 1) {
            Ok(()) => {}
            Err(BlockchainError::Consensus(reason)) => {
                warn!(target: "processor", "Rejected block {hash_hex} from {source}: {reason}");
                return Ok(SubmitOutcome::Rejected(reason));
            }
            Err(e) => return Err(e),
        }

        match placement {
            Placement::ExtendsTip(_) => {
                let id = ledger.with_cache_rewrite(1, |changes| {
                    let id = ledger.append(&block, 2)?;
                    changes.mark_appended(id);
                    Ok(id)
                })?;
                info!(target: "processor", "Accepted block {hash_hex} from {source} as #{id}");
                self.status.block_added();
                if let Err(e) = self.network.broadcast_block_found(&hash, block.raw()) {
                    warn!(target: "processor", "Failed to broadcast block {hash_hex}: {e}");
                }
                Ok(SubmitOutcome::Accepted { id })
            }
            Placement::CollidesWithTip(_) => self.resolve_collision(block, source),
        }
    }

    /// The candidate must reference the tip or the block before it
    fn placement(&self, block: &Block) -> Result<Option<Placement>> {
        let prev = block.get_prev_block_hash();
        let tip_id = self.ledger.length().checked_sub(1);
        let ref_id = if *prev == INITIAL_PREV_BLOCK {
            None
        } else {
            match self.ledger.id_for_hash(prev, 1)? {
                Some(id) => Some(id),
                None => return Ok(None),
            }
        };
        if ref_id == tip_id {
            return Ok(Some(Placement::ExtendsTip(ref_id)));
        }
        let before_tip = match tip_id {
            Some(0) => None,
            Some(tip) => Some(tip - 1),
            None => return Ok(None),
        };
        if ref_id == before_tip {
            Ok(Some(Placement::CollidesWithTip(ref_id)))
        } else {
            Ok(None)
        }
    }

    fn resolve_collision(&self, candidate: Block, source: &str) -> Result<SubmitOutcome> {
        let ledger = &self.ledger;
        let (tip_id, tip) = ledger
            .tip(1)?
            .ok_or_else(|| BlockchainError::Io("collision without a tip".to_string()))?;
        let tip_miner = tip.miner_address();
        let candidate_miner = candidate.miner_address();

        // Counts as of the common parent: the tip's own block is not counted
        let count = |miner: &Option<Address>| -> Result<u32> {
            let Some(miner) = miner else { return Ok(0) };
            let count = ledger.miner_block_count(miner, 1)?;
            Ok(if Some(*miner) == tip_miner {
                count.saturating_sub(1)
            } else {
                count
            })
        };
        let tip_count = count(&tip_miner)?;
        let candidate_count = count(&candidate_miner)?;

        let candidate_wins = match candidate_count.cmp(&tip_count) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => candidate.hash() < tip.hash(),
        };
        info!(
            target: "collision",
            "Block {} from {source} (miner count {candidate_count}) collides with #{tip_id} {} (miner count {tip_count}): {}",
            candidate.hash_hex(),
            tip.hash_hex(),
            if candidate_wins { "replacing tip" } else { "keeping tip" }
        );
        if !candidate_wins {
            return Ok(SubmitOutcome::KeptExisting);
        }

        let id = ledger.with_cache_rewrite(1, |changes| {
            ledger.remove_tail(1, 2)?;
            let id = ledger.append(&candidate, 2)?;
            changes.mark_rewritten();
            Ok(id)
        })?;
        self.status.block_added();
        if let Err(e) = self.network.broadcast_block_found(&candidate.hash(), candidate.raw()) {
            warn!(target: "processor", "Failed to broadcast block {}: {e}", candidate.hash_hex());
        }
        Ok(SubmitOutcome::ReplacedTip { id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Accepted { fee: u64 },
    Rejected(Rejection),
}

/// Admits unconfirmed transactions into the free pool.
pub struct TxProcessor {
    ledger: Arc<Ledger>,
    network: Arc<dyn Network>,
}

impl TxProcessor {
    pub fn new(ledger: Arc<Ledger>, network: Arc<dyn Network>) -> TxProcessor {
        TxProcessor { ledger, network }
    }

    pub fn submit(&self, hash: Hash32, raw: &[u8], source: &str) -> Result<TxOutcome> {
        let hash_hex = HEXLOWER.encode(&hash);
        match self.admit(hash, raw) {
            Ok(fee) => {
                info!(target: "processor", "Accepted free tx {hash_hex} from {source} paying {fee}");
                if let Err(e) = self.network.broadcast_transaction(&hash, raw) {
                    warn!(target: "processor", "Failed to broadcast tx {hash_hex}: {e}");
                }
                Ok(TxOutcome::Accepted { fee })
            }
            Err(BlockchainError::Consensus(reason)) => {
                warn!(target: "processor", "Rejected tx {hash_hex} from {source}: {reason}");
                Ok(TxOutcome::Rejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    fn admit(&self, hash: Hash32, raw: &[u8]) -> Result<u64> {
        let ledger = &self.ledger;
        let _hold = ledger.lock_coordinator().acquire(0)?;
        let tip_id = ledger.length().checked_sub(1);
        let confirmed = match tip_id {
            Some(tip) => ledger.find_transaction(&hash, tip, 1)?.is_some(),
            None => false,
        };
        if confirmed || ledger.is_known_free(&hash, 1)? {
            return Err(Rejection::KnownTx.into());
        }

        let tx = Transaction::from_raw(Some(hash), raw)?;
        let ctx = ValidationContext::current()?;
        let fee = tx.validate_after(ledger, tip_id, TxRole::Free, &ctx, 1)?;
        for input in tx.get_inputs() {
            if ledger.is_output_spent_by_free(&input.ref_tx_hash, input.ref_out, 1)? {
                return Err(Rejection::OutIsSpentByFreeTx.into());
            }
        }
        if fee < minimum_fee(raw.len()) {
            return Err(Rejection::TooSmallFee.into());
        }
        ledger.with_cache_rewrite(1, |_| ledger.add_free(&tx, 2))?;
        Ok(fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Broadcast, LoopbackNetwork};
    use crate::testnet::{create_spend, create_test_ledger, extend_chain, mine_block_after, mine_next_block};
    use crate::wallet::Wallet;

    fn processors(ledger: &Arc<Ledger>) -> (BlockProcessor, TxProcessor, Arc<LoopbackNetwork>) {
        let network = Arc::new(LoopbackNetwork::new(1 << 20));
        let blocks = BlockProcessor::new(
            Arc::clone(ledger),
            network.clone(),
            Arc::new(SyncStatus::new(false)),
        );
        let txs = TxProcessor::new(Arc::clone(ledger), network.clone());
        (blocks, txs, network)
    }

    #[test]
    fn test_extends_tip_and_broadcasts() {
        let (ledger, _dir) = create_test_ledger().unwrap();
        let (processor, _, network) = processors(&ledger);
        let miner = Wallet::new().unwrap().get_address();
        let genesis = mine_next_block(&ledger, &miner, vec![]).unwrap();

        let outcome = processor.submit(genesis.hash(), genesis.raw(), "test").unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted { id: 0 });
        assert!(matches!(&network.broadcasts()[..], [Broadcast::BlockFound { .. }]));
        assert_eq!(
            processor.submit(genesis.hash(), genesis.raw(), "test").unwrap(),
            SubmitOutcome::Known
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        let (ledger, _dir) = create_test_ledger().unwrap();
        let (processor, _, _) = processors(&ledger);
        assert_eq!(
            processor.submit([1u8; 32], b"garbage", "test").unwrap(),
            SubmitOutcome::Rejected(Rejection::WrongData)
        );
    }

    #[test]
    fn test_unknown_or_old_parent_is_ignored() {
        let (ledger, _dir) = create_test_ledger().unwrap();
        let (processor, _, _) = processors(&ledger);
        let miner = Wallet::new().unwrap().get_address();

        let mut orphan = mine_next_block(&ledger, &miner, vec![]).unwrap();
        orphan.set_prev_block_hash([7u8; 32]);
        assert_eq!(
            processor.submit(orphan.hash(), orphan.raw(), "test").unwrap(),
            SubmitOutcome::Ignored
        );

        extend_chain(&ledger, &miner, 3).unwrap();
        let stale = mine_block_after(&ledger, Some(0), &Wallet::new().unwrap().get_address(), vec![]).unwrap();
        assert_eq!(
            processor.submit(stale.hash(), stale.raw(), "test").unwrap(),
            SubmitOutcome::Ignored
        );
    }

    #[test]
    fn test_collision_prefers_busier_miner() {
        let (ledger, _dir) = create_test_ledger().unwrap();
        let (processor, _, _) = processors(&ledger);
        let busy = Wallet::new().unwrap().get_address();
        let idle = Wallet::new().unwrap().get_address();
        extend_chain(&ledger, &busy, 2).unwrap();

        // The tip is mined by `idle`; a competing block from `busy` wins
        let tip = mine_next_block(&ledger, &idle, vec![]).unwrap();
        ledger.append(&tip, 0).unwrap();
        let rival = mine_block_after(&ledger, Some(1), &busy, vec![]).unwrap();
        assert_eq!(
            processor.submit(rival.hash(), rival.raw(), "test").unwrap(),
            SubmitOutcome::ReplacedTip { id: 2 }
        );
        assert_eq!(ledger.hash_at(2, 0).unwrap(), Some(rival.hash()));

        // And the displaced block cannot come back
        assert_eq!(
            processor.submit(tip.hash(), tip.raw(), "test").unwrap(),
            SubmitOutcome::KeptExisting
        );
        assert_eq!(ledger.length(), 3);
    }

    #[test]
    fn test_free_tx_admission() {
        let (ledger, _dir) = create_test_ledger().unwrap();
        let (_, processor, network) = processors(&ledger);
        let owner = Wallet::new().unwrap();
        let blocks = extend_chain(&ledger, &owner.get_address(), 1).unwrap();
        let coinbase = &blocks[0].get_transactions()[0];
        let reward = coinbase.get_output(0).unwrap().value;
        let to = Wallet::new().unwrap().get_address();

        let cheap = create_spend(&owner, coinbase, 0, to, reward - 1, 0).unwrap();
        assert_eq!(
            processor.submit(cheap.hash(), cheap.raw(), "test").unwrap(),
            TxOutcome::Rejected(Rejection::TooSmallFee)
        );

        let tx = create_spend(&owner, coinbase, 0, to, reward - 100_000, 0).unwrap();
        assert_eq!(
            processor.submit(tx.hash(), tx.raw(), "test").unwrap(),
            TxOutcome::Accepted { fee: 100_000 }
        );
        assert!(ledger.is_known_free(&tx.hash(), 0).unwrap());
        assert!(matches!(&network.broadcasts()[..], [Broadcast::Transaction { .. }]));
        assert_eq!(
            processor.submit(tx.hash(), tx.raw(), "test").unwrap(),
            TxOutcome::Rejected(Rejection::KnownTx)
        );

        let conflicting = create_spend(&owner, coinbase, 0, to, reward - 200_000, 0).unwrap();
        assert_eq!(
            processor.submit(conflicting.hash(), conflicting.raw(), "test").unwrap(),
            TxOutcome::Rejected(Rejection::OutIsSpentByFreeTx)
        );
    }
}
