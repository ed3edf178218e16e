// Secondary transaction/output index kept in sled.
// Consensus never reads from here; the ledger feeds it through the observer
// list so balance queries do not have to walk the data file.

use crate::core::{Block, Hash32};
use crate::error::{BlockchainError, Result};
use crate::storage::ledger::LedgerObserver;
use crate::utils::{decode_index_value, encode_index_value};
use crate::wallet::Address;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;

const TRANSACTIONS_TREE: &str = "transactions";
const OUTPUTS_TREE: &str = "outputs";

/// Sink for confirmed transactions and their outputs.
pub trait TransactionIndex {
    fn record_transaction(&self, block_id: u32, tx_hash: &Hash32) -> Result<()>;

    fn record_output(
        &self,
        block_id: u32,
        tx_hash: &Hash32,
        index: u32,
        address: &Address,
        value: u64,
    ) -> Result<()>;

    fn mark_spent(&self, block_id: u32, tx_hash: &Hash32, index: u32) -> Result<()>;

    /// Forgets everything recorded at or after `block_id`
    fn remove_from(&self, block_id: u32) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct OutputEntry {
    pub block_id: u32,
    pub address: Vec<u8>,
    pub value: u64,
    pub spent_at: Option<u32>,
}

/// An unspent output as reported by [`SledTransactionIndex::unspent_outputs`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub tx_hash: Hash32,
    pub index: u32,
    pub value: u64,
    pub block_id: u32,
}

pub struct SledTransactionIndex {
    db: Db,
    transactions: Tree,
    outputs: Tree,
}

fn output_key(tx_hash: &Hash32, index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(tx_hash);
    key[32..].copy_from_slice(&index.to_be_bytes());
    key
}

fn db_error(context: &str) -> impl Fn(sled::Error) -> BlockchainError + '_ {
    move |e| BlockchainError::Database(format!("{context}: {e}"))
}

impl SledTransactionIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<SledTransactionIndex> {
        let db = sled::open(path.as_ref()).map_err(db_error("Failed to open index database"))?;
        let transactions = db
            .open_tree(TRANSACTIONS_TREE)
            .map_err(db_error("Failed to open transactions tree"))?;
        let outputs = db
            .open_tree(OUTPUTS_TREE)
            .map_err(db_error("Failed to open outputs tree"))?;
        Ok(SledTransactionIndex {
            db,
            transactions,
            outputs,
        })
    }

    /// Block holding the transaction, if it was recorded
    pub fn transaction_block(&self, tx_hash: &Hash32) -> Result<Option<u32>> {
        let value = self
            .transactions
            .get(tx_hash)
            .map_err(db_error("Failed to read transaction"))?;
        Ok(value.and_then(|bytes| {
            let bytes: [u8; 4] = bytes.as_ref().try_into().ok()?;
            Some(u32::from_be_bytes(bytes))
        }))
    }

    pub fn output(&self, tx_hash: &Hash32, index: u32) -> Result<Option<OutputEntry>> {
        let value = self
            .outputs
            .get(output_key(tx_hash, index))
            .map_err(db_error("Failed to read output"))?;
        value.map(|bytes| decode_index_value(bytes.as_ref())).transpose()
    }

    pub fn unspent_outputs(&self, address: &Address) -> Result<Vec<UnspentOutput>> {
        let mut found = Vec::new();
        for item in self.outputs.iter() {
            let (key, value) = item.map_err(db_error("Failed to iterate outputs"))?;
            let entry: OutputEntry = decode_index_value(value.as_ref())?;
            if entry.spent_at.is_some() || entry.address != address.as_bytes() {
                continue;
            }
            let mut tx_hash = [0u8; 32];
            tx_hash.copy_from_slice(&key[..32]);
            let mut index = [0u8; 4];
            index.copy_from_slice(&key[32..36]);
            found.push(UnspentOutput {
                tx_hash,
                index: u32::from_be_bytes(index),
                value: entry.value,
                block_id: entry.block_id,
            });
        }
        Ok(found)
    }

    pub fn balance(&self, address: &Address) -> Result<u64> {
        Ok(self
            .unspent_outputs(address)?
            .iter()
            .map(|out| out.value)
            .sum())
    }

    pub fn count_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn clear(&self) -> Result<()> {
        self.transactions
            .clear()
            .map_err(db_error("Failed to clear transactions tree"))?;
        self.outputs
            .clear()
            .map_err(db_error("Failed to clear outputs tree"))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(db_error("Failed to flush index"))?;
        Ok(())
    }
}

impl TransactionIndex for SledTransactionIndex {
    fn record_transaction(&self, block_id: u32, tx_hash: &Hash32) -> Result<()> {
        self.transactions
            .insert(tx_hash, block_id.to_be_bytes().to_vec())
            .map_err(db_error("Failed to insert transaction"))?;
        Ok(())
    }

    fn record_output(
        &self,
        block_id: u32,
        tx_hash: &Hash32,
        index: u32,
        address: &Address,
        value: u64,
    ) -> Result<()> {
        let entry = OutputEntry {
            block_id,
            address: address.as_bytes().to_vec(),
            value,
            spent_at: None,
        };
        self.outputs
            .insert(output_key(tx_hash, index), encode_index_value(&entry)?)
            .map_err(db_error("Failed to insert output"))?;
        Ok(())
    }

    fn mark_spent(&self, block_id: u32, tx_hash: &Hash32, index: u32) -> Result<()> {
        let key = output_key(tx_hash, index);
        let Some(mut entry) = self.output(tx_hash, index)? else {
            debug!(target: "index", "Spent output {} is not indexed", data_encoding::HEXLOWER.encode(tx_hash));
            return Ok(());
        };
        entry.spent_at = Some(block_id);
        self.outputs
            .insert(key, encode_index_value(&entry)?)
            .map_err(db_error("Failed to mark output spent"))?;
        Ok(())
    }

    fn remove_from(&self, block_id: u32) -> Result<()> {
        for item in self.transactions.iter() {
            let (key, value) = item.map_err(db_error("Failed to iterate transactions"))?;
            let recorded = <[u8; 4]>::try_from(value.as_ref()).map(u32::from_be_bytes);
            if recorded.map_or(true, |id| id >= block_id) {
                self.transactions
                    .remove(key)
                    .map_err(db_error("Failed to remove transaction"))?;
            }
        }
        for item in self.outputs.iter() {
            let (key, value) = item.map_err(db_error("Failed to iterate outputs"))?;
            let mut entry: OutputEntry = decode_index_value(value.as_ref())?;
            if entry.block_id >= block_id {
                self.outputs
                    .remove(key)
                    .map_err(db_error("Failed to remove output"))?;
            } else if entry.spent_at.is_some_and(|spent| spent >= block_id) {
                entry.spent_at = None;
                self.outputs
                    .insert(key, encode_index_value(&entry)?)
                    .map_err(db_error("Failed to unspend output"))?;
            }
        }
        Ok(())
    }
}

impl LedgerObserver for SledTransactionIndex {
    fn on_block_added(&self, block: &Block, id: u32) -> Result<()> {
        for tx in block.get_transactions() {
            let hash = tx.hash();
            self.record_transaction(id, &hash)?;
            for input in tx.get_inputs() {
                self.mark_spent(id, &input.ref_tx_hash, input.ref_out)?;
            }
            for (index, output) in tx.get_outputs().enumerate() {
                self.record_output(id, &hash, index as u32, &output.address, output.value)?;
            }
        }
        Ok(())
    }

    fn on_blocks_removed(&self, new_length: u32) -> Result<()> {
        self.remove_from(new_length)
    }

    fn on_cache_save(&self) -> Result<()> {
        self.flush()
    }

    fn on_reset(&self) -> Result<()> {
        info!(target: "index", "Clearing transaction index for replay");
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Target, Transaction, INITIAL_PREV_BLOCK};
    use crate::wallet::Wallet;
    use tempfile::TempDir;

    fn coinbase_block(miner: Address, value: u64) -> Block {
        let mut block = Block::new(INITIAL_PREV_BLOCK, 1_000, Target::EASIEST);
        block.add_transaction(Transaction::new_coinbase(1_000, miner, value).unwrap());
        block
    }

    #[test]
    fn test_balance_follows_blocks() {
        let dir = TempDir::new().unwrap();
        let index = SledTransactionIndex::open(dir.path().join("index")).unwrap();
        let alice = Wallet::new().unwrap();
        let bob = Address::from_public_key(&[2u8; 65]);

        let first = coinbase_block(alice.get_address(), 50);
        index.on_block_added(&first, 0).unwrap();
        assert_eq!(index.balance(&alice.get_address()).unwrap(), 50);

        let coinbase_hash = first.get_transactions()[0].hash();
        let mut spend = Transaction::new(1_010);
        spend.add_output(bob, 30).unwrap();
        spend.add_input(coinbase_hash, 0, &alice).unwrap();
        let mut second = coinbase_block(bob, 5);
        second.add_transaction(spend);
        index.on_block_added(&second, 1).unwrap();

        assert_eq!(index.balance(&alice.get_address()).unwrap(), 0);
        assert_eq!(index.balance(&bob).unwrap(), 35);
        assert_eq!(index.transaction_block(&coinbase_hash).unwrap(), Some(0));

        index.on_blocks_removed(1).unwrap();
        assert_eq!(index.balance(&alice.get_address()).unwrap(), 50);
        assert_eq!(index.balance(&bob).unwrap(), 0);
        assert_eq!(index.count_transactions(), 1);
    }

    #[test]
    fn test_reset_clears() {
        let dir = TempDir::new().unwrap();
        let index = SledTransactionIndex::open(dir.path().join("index")).unwrap();
        let miner = Address::from_public_key(&[1u8; 65]);
        index.on_block_added(&coinbase_block(miner, 50), 0).unwrap();
        index.on_reset().unwrap();
        assert_eq!(index.balance(&miner).unwrap(), 0);
        assert_eq!(index.count_transactions(), 0);
    }
}
