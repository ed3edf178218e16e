//! Derived caches of the ledger.
//!
//! Everything here can be recomputed from `blockchain.ind` and
//! `blockchain.dat`. The caches are kept so that retargeting, fork
//! tie-breaking and spend checks never have to touch the data file.

use crate::core::{Block, Hash32};
use crate::error::Result;
use crate::storage::record_store::{FixedRecord, FixedRecordStore, SortedRecordStore};
use crate::storage::records::{BlockTime, MinerCoins, SpentOutput, TxLocation};
use crate::wallet::Address;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

pub const TIMES_CACHE: &str = "times.cache";
pub const COINS_CACHE: &str = "coins.cache";
pub const SPENT_CACHE: &str = "spent.cache";
pub const TXS_CACHE: &str = "txs.cache";
pub const FREE_CACHE: &str = "free.cache";

/// Every cache file, in the order they are written
pub const CACHE_FILES: [&str; 5] = [TIMES_CACHE, COINS_CACHE, SPENT_CACHE, TXS_CACHE, FREE_CACHE];

#[derive(Clone, Default)]
pub struct Caches {
    pub times: FixedRecordStore<BlockTime>,
    pub coins: FixedRecordStore<MinerCoins>,
    pub spent: SortedRecordStore<SpentOutput>,
    pub txs: SortedRecordStore<TxLocation>,
}

impl Caches {
    pub fn new() -> Caches {
        Caches::default()
    }

    /// Reads the four block-derived cache files. Missing files read as empty.
    pub fn load(dir: &Path) -> Result<Caches> {
        Ok(Caches {
            times: FixedRecordStore::from_bytes(&read_or_empty(&dir.join(TIMES_CACHE))?)?,
            coins: FixedRecordStore::from_bytes(&read_or_empty(&dir.join(COINS_CACHE))?)?,
            spent: SortedRecordStore::from_bytes(&read_or_empty(&dir.join(SPENT_CACHE))?)?,
            txs: SortedRecordStore::from_bytes(&read_or_empty(&dir.join(TXS_CACHE))?)?,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        write_file(&dir.join(TIMES_CACHE), self.times.as_bytes())?;
        self.save_sorted(dir)
    }

    /// Rewrites every cache except block times, which only get records from
    /// `from_id` onwards written over the existing file.
    pub fn save_appended(&self, dir: &Path, from_id: u32) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(TIMES_CACHE))?;
        let start = from_id as usize * BlockTime::SIZE;
        file.set_len(start as u64)?;
        file.seek(SeekFrom::Start(start as u64))?;
        file.write_all(self.times.bytes_from(from_id as usize))?;
        file.flush()?;
        self.save_sorted(dir)
    }

    fn save_sorted(&self, dir: &Path) -> Result<()> {
        write_file(&dir.join(COINS_CACHE), self.coins.as_bytes())?;
        write_file(&dir.join(SPENT_CACHE), self.spent.as_bytes())?;
        write_file(&dir.join(TXS_CACHE), self.txs.as_bytes())
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.coins.clear();
        self.spent.clear();
        self.txs.clear();
    }

    /// Records the effects of block `id`, which must be the next block.
    pub fn apply_block(&mut self, block: &Block, id: u32) {
        self.times.push(&BlockTime {
            id,
            time: block.get_time(),
        });
        if let Some(miner) = block.miner_address() {
            self.increment_miner(miner);
        }
        for tx in block.get_transactions() {
            self.txs.insert(&TxLocation {
                tx_hash: tx.hash(),
                block_id: id,
            });
            for input in tx.get_inputs() {
                self.spent.insert(&SpentOutput {
                    tx_hash: input.ref_tx_hash,
                    out_n: input.ref_out,
                    spent_at: id,
                });
            }
        }
    }

    /// Undoes [`Caches::apply_block`] for the current last block `id`.
    pub fn revert_block(&mut self, block: &Block, id: u32) {
        self.times.truncate(id as usize);
        if let Some(miner) = block.miner_address() {
            self.decrement_miner(miner);
        }
        for tx in block.get_transactions() {
            let hash = tx.hash();
            self.remove_tx_location(&hash, id);
            for input in tx.get_inputs() {
                self.remove_spent(&input.ref_tx_hash, input.ref_out, id);
            }
        }
    }

    fn increment_miner(&mut self, miner: Address) {
        match self.coins.position(|entry| entry.address == miner) {
            Some(index) => {
                if let Some(mut entry) = self.coins.get(index) {
                    entry.count += 1;
                    self.coins.replace(index, &entry);
                }
            }
            None => {
                self.coins.push(&MinerCoins {
                    address: miner,
                    count: 1,
                });
            }
        }
    }

    fn decrement_miner(&mut self, miner: Address) {
        let Some(index) = self.coins.position(|entry| entry.address == miner) else {
            return;
        };
        if let Some(mut entry) = self.coins.get(index) {
            if entry.count <= 1 {
                self.coins.remove(index);
            } else {
                entry.count -= 1;
                self.coins.replace(index, &entry);
            }
        }
    }

    fn remove_tx_location(&mut self, hash: &Hash32, block_id: u32) {
        let found = self
            .txs
            .all_indexes_equal_to(hash)
            .into_iter()
            .rev()
            .find(|&index| self.txs.get(index).is_some_and(|r| r.block_id == block_id));
        if let Some(index) = found {
            self.txs.remove(index);
        }
    }

    fn remove_spent(&mut self, hash: &Hash32, out_n: u32, spent_at: u32) {
        let found = self.spent.all_indexes_equal_to(hash).into_iter().rev().find(|&index| {
            self.spent
                .get(index)
                .is_some_and(|r| r.out_n == out_n && r.spent_at == spent_at)
        });
        if let Some(index) = found {
            self.spent.remove(index);
        }
    }

    pub fn miner_block_count(&self, miner: &Address) -> u32 {
        self.coins
            .iter()
            .find(|entry| entry.address == *miner)
            .map_or(0, |entry| entry.count)
    }

    /// Earliest block at or before `as_of` that spent the output
    pub fn spent_at(&self, hash: &Hash32, out_n: u32, as_of: u32) -> Option<u32> {
        self.spent
            .all_equal_to(hash)
            .into_iter()
            .filter(|r| r.out_n == out_n && r.spent_at <= as_of)
            .map(|r| r.spent_at)
            .min()
    }

    /// Block holding the transaction, ignoring blocks after `as_of`
    pub fn tx_block(&self, hash: &Hash32, as_of: u32) -> Option<u32> {
        self.txs
            .all_equal_to(hash)
            .into_iter()
            .map(|r| r.block_id)
            .filter(|&id| id <= as_of)
            .min()
    }

    /// Blocks whose time is in `(since, till]`
    pub fn count_blocks_in_time_window(&self, since: u64, till: u64) -> u32 {
        let mut count = 0;
        for entry in self.times.iter().rev() {
            if entry.time <= since {
                break;
            }
            if entry.time <= till {
                count += 1;
            }
        }
        count
    }

    pub fn same_bytes(&self, other: &Caches) -> bool {
        self.times.as_bytes() == other.times.as_bytes()
            && self.coins.as_bytes() == other.coins.as_bytes()
            && self.spent.as_bytes() == other.spent.as_bytes()
            && self.txs.as_bytes() == other.txs.as_bytes()
    }
}

pub(crate) fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Writes through a temporary file and renames it over `path`
pub(crate) fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
