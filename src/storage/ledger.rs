// The ledger is the single owner of the block files and every cache derived from them.
// blockchain.ind holds one 40-byte record per block (hash + offset into blockchain.dat),
// blockchain.dat is just the raw blocks back to back.
// Every public operation first takes a hold on the lock coordinator with the depth the
// caller says it can tolerate, then works on the state behind a short-lived mutex.

use crate::core::block::INITIAL_PREV_BLOCK;
use crate::core::{Block, Hash32, LockCoordinator, LockHold, Rejection, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::caches::{read_or_empty, write_file, Caches, FREE_CACHE};
use crate::storage::checkpoint;
use crate::storage::meta::LedgerMeta;
use crate::storage::record_store::{FixedRecord, FixedRecordStore, ScalableRecordStore};
use crate::storage::records::{FreeTx, IndexRecord, RecentHash};
use crate::utils::current_unix_time;
use crate::wallet::Address;
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const INDEX_FILE: &str = "blockchain.ind";
pub const DATA_FILE: &str = "blockchain.dat";

/// Free transactions older than this (local clock) are dropped
pub const FREE_TX_TTL_SECS: u64 = 600;
/// Block times may go backwards by at most this much between neighbours
const MAX_TIME_STEP_BACK: u64 = 60;
const RECENT_HASHES: usize = 10;

/// Side effects attached to ledger mutations.
///
/// Observers are called while the ledger state is held and must not call
/// back into the ledger. An error from an observer is returned to the caller
/// of the mutation.
pub trait LedgerObserver: Send + Sync {
    fn on_block_added(&self, _block: &Block, _id: u32) -> Result<()> {
        Ok(())
    }

    /// Blocks from `new_length` on were removed
    fn on_blocks_removed(&self, _new_length: u32) -> Result<()> {
        Ok(())
    }

    fn on_cache_save(&self) -> Result<()> {
        Ok(())
    }

    fn on_before_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn on_checkpoint_saved(&self, _slot: &Path) -> Result<()> {
        Ok(())
    }

    fn on_checkpoint_loaded(&self, _slot: &Path) -> Result<()> {
        Ok(())
    }

    /// Everything derived so far is about to be replayed from block 0
    fn on_reset(&self) -> Result<()> {
        Ok(())
    }
}

/// What a cache rewrite body changed, so the right files get persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheChanges {
    appended_from: Option<u32>,
    rewritten: bool,
}

impl CacheChanges {
    /// Blocks from `from_id` on were appended
    pub fn mark_appended(&mut self, from_id: u32) {
        self.appended_from = Some(self.appended_from.map_or(from_id, |f| f.min(from_id)));
    }

    /// Caches changed anywhere, e.g. after a rollback
    pub fn mark_rewritten(&mut self) {
        self.rewritten = true;
    }

    pub fn is_empty(&self) -> bool {
        self.appended_from.is_none() && !self.rewritten
    }

    fn merge(&mut self, other: CacheChanges) {
        if let Some(from) = other.appended_from {
            self.mark_appended(from);
        }
        self.rewritten |= other.rewritten;
    }
}

/// Answer to "which blocks come after this hash"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlocksAfter {
    /// `(hash, raw)` pairs in chain order
    Blocks(Vec<(Hash32, Vec<u8>)>),
    /// The hash is not in this ledger
    NoBlock { ledger_length: u32 },
    /// The hash is the tip
    NoBlockAfter,
}

/// Byte images of the ledger's size and block-derived caches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub length: u32,
    pub data_size: u64,
    pub times: Vec<u8>,
    pub coins: Vec<u8>,
    pub spent: Vec<u8>,
    pub txs: Vec<u8>,
}

struct LedgerState {
    index_file: File,
    data_file: File,
    index: FixedRecordStore<IndexRecord>,
    data_size: u64,
    caches: Caches,
    free: ScalableRecordStore<FreeTx>,
    free_dirty: bool,
    recent: FixedRecordStore<RecentHash>,
    pending: CacheChanges,
    meta: LedgerMeta,
}

impl LedgerState {
    /// Opens the files and repairs a torn tail. The returned flag is true
    /// when the cache files cannot be trusted.
    fn open(dir: &Path) -> Result<(LedgerState, bool)> {
        fs::create_dir_all(dir)?;
        let mut index_file = open_rw(&dir.join(INDEX_FILE))?;
        let data_file = open_rw(&dir.join(DATA_FILE))?;

        let mut index_bytes = Vec::new();
        index_file.read_to_end(&mut index_bytes)?;
        let whole = index_bytes.len() - index_bytes.len() % IndexRecord::SIZE;
        if whole != index_bytes.len() {
            warn!(target: "ledger", "Dropping {} bytes of a torn index record", index_bytes.len() - whole);
        }
        let index = FixedRecordStore::from_bytes(&index_bytes[..whole])?;
        let data_size = data_file.metadata()?.len();
        let meta = LedgerMeta::load(dir)?;

        let mut state = LedgerState {
            index_file,
            data_file,
            index,
            data_size,
            caches: Caches::new(),
            free: ScalableRecordStore::new(),
            free_dirty: false,
            recent: FixedRecordStore::new(),
            pending: CacheChanges::default(),
            meta,
        };
        state.repair_tail()?;

        let mut needs_rebuild = !state.meta.caches_match(state.length());
        if !needs_rebuild {
            match Caches::load(dir) {
                Ok(caches) if caches.times.len() == state.index.len() => state.caches = caches,
                Ok(_) => needs_rebuild = true,
                Err(e) => {
                    warn!(target: "ledger", "Cache files unreadable, rebuilding: {e}");
                    needs_rebuild = true;
                }
            }
        }
        match ScalableRecordStore::from_bytes(&read_or_empty(&dir.join(FREE_CACHE))?) {
            Ok(free) => state.free = free,
            Err(e) => warn!(target: "ledger", "Discarding unreadable free pool: {e}"),
        }
        let len = state.index.len();
        for id in len.saturating_sub(RECENT_HASHES)..len {
            if let Some(record) = state.index.get(id) {
                state.remember_recent(record.hash, id as u32);
            }
        }
        Ok((state, needs_rebuild))
    }

    // The index record is written before the block bytes, so a crash can
    // only leave the last block short or missing.
    fn repair_tail(&mut self) -> Result<()> {
        while let Some(last) = self.index.last() {
            let id = self.length() - 1;
            if last.offset < self.data_size && self.read_block(id).is_ok() {
                break;
            }
            warn!(target: "ledger", "Dropping unreadable tail block {id}");
            self.truncate(id)?;
        }
        if self.index.is_empty() && self.data_size > 0 {
            self.truncate(0)?;
        }
        Ok(())
    }

    fn length(&self) -> u32 {
        self.index.len() as u32
    }

    fn span(&self, id: u32) -> Option<(u64, u64)> {
        let record = self.index.get(id as usize)?;
        let end = self
            .index
            .get(id as usize + 1)
            .map_or(self.data_size, |next| next.offset);
        Some((record.offset, end.saturating_sub(record.offset)))
    }

    fn hash_at(&self, id: u32) -> Option<Hash32> {
        self.index.get(id as usize).map(|record| record.hash)
    }

    fn read_raw(&mut self, id: u32) -> Result<Option<(Hash32, Vec<u8>)>> {
        let (Some(hash), Some((offset, len))) = (self.hash_at(id), self.span(id)) else {
            return Ok(None);
        };
        let mut raw = vec![0u8; len as usize];
        self.data_file.seek(SeekFrom::Start(offset))?;
        self.data_file.read_exact(&mut raw)?;
        Ok(Some((hash, raw)))
    }

    fn read_block(&mut self, id: u32) -> Result<Option<Block>> {
        let Some((hash, raw)) = self.read_raw(id)? else {
            return Ok(None);
        };
        Block::from_raw(hash, &raw)
            .map(Some)
            .map_err(|e| BlockchainError::Io(format!("block {id} in {DATA_FILE} is unreadable: {e}")))
    }

    fn id_for_hash(&self, hash: &Hash32) -> Option<u32> {
        if let Some(recent) = self.recent.iter().rev().find(|r| r.hash == *hash) {
            return Some(recent.id);
        }
        self.index
            .iter()
            .rposition(|record| record.hash == *hash)
            .map(|id| id as u32)
    }

    fn remember_recent(&mut self, hash: Hash32, id: u32) {
        self.recent.push(&RecentHash { hash, id });
        if self.recent.len() > RECENT_HASHES {
            self.recent.remove(0);
        }
    }

    fn write_block(&mut self, hash: Hash32, raw: &[u8]) -> Result<u32> {
        let id = self.length();
        let record = IndexRecord {
            hash,
            offset: self.data_size,
        };
        let mut encoded = [0u8; IndexRecord::SIZE];
        record.write_to(&mut encoded);

        self.index_file
            .seek(SeekFrom::Start(u64::from(id) * IndexRecord::SIZE as u64))?;
        self.index_file.write_all(&encoded)?;
        self.index_file.flush()?;
        self.data_file.seek(SeekFrom::Start(self.data_size))?;
        self.data_file.write_all(raw)?;
        self.data_file.flush()?;

        self.index.push(&record);
        self.data_size += raw.len() as u64;
        Ok(id)
    }

    fn truncate(&mut self, new_length: u32) -> Result<()> {
        let new_data_size = match new_length {
            0 => 0,
            _ => self
                .index
                .get(new_length as usize)
                .map_or(self.data_size, |record| record.offset),
        };
        self.index_file
            .set_len(u64::from(new_length) * IndexRecord::SIZE as u64)?;
        self.data_file.set_len(new_data_size)?;
        self.index.truncate(new_length as usize);
        self.data_size = new_data_size;
        self.recent.retain(|r| r.id < new_length);
        Ok(())
    }

    fn purge_free(&mut self, now: u64) {
        let before = self.free.len();
        self.free
            .retain(|tx| now.saturating_sub(tx.added) <= FREE_TX_TTL_SECS);
        if self.free.len() != before {
            debug!(target: "ledger", "Purged {} expired free transactions", before - self.free.len());
            self.free_dirty = true;
        }
    }

    fn free_transactions(&self) -> Result<Vec<Transaction>> {
        self.free
            .iter()
            .map(|tx| Transaction::from_raw(Some(tx.hash), &tx.raw))
            .collect()
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            length: self.length(),
            data_size: self.data_size,
            times: self.caches.times.as_bytes().to_vec(),
            coins: self.caches.coins.as_bytes().to_vec(),
            spent: self.caches.spent.as_bytes().to_vec(),
            txs: self.caches.txs.as_bytes().to_vec(),
        }
    }
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

pub struct Ledger {
    data_dir: PathBuf,
    lock: LockCoordinator,
    state: Mutex<LedgerState>,
    observers: Vec<Arc<dyn LedgerObserver>>,
}

impl Ledger {
    /// Opens (or creates) the ledger in `data_dir`. Caches that are dirty or
    /// describe another length are rebuilt from the block files.
    pub fn open(
        data_dir: impl AsRef<Path>,
        lock: LockCoordinator,
        observers: Vec<Arc<dyn LedgerObserver>>,
    ) -> Result<Ledger> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let (state, needs_rebuild) = LedgerState::open(&data_dir)?;
        let ledger = Ledger {
            data_dir,
            lock,
            state: Mutex::new(state),
            observers,
        };
        {
            let mut state = ledger.state();
            info!(
                target: "ledger",
                "Opened ledger at {} with {} blocks",
                ledger.data_dir.display(),
                state.length()
            );
            if needs_rebuild {
                ledger.rebuild_locked(&mut state)?;
            }
        }
        Ok(ledger)
    }

    // The state holds plain buffers and file handles, a panic elsewhere does
    // not leave them half-updated in a way the next call cannot read.
    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn lock_coordinator(&self) -> &LockCoordinator {
        &self.lock
    }

    pub fn length(&self) -> u32 {
        self.state().length()
    }

    pub fn data_size(&self) -> u64 {
        self.state().data_size
    }

    fn notify(&self, event: impl Fn(&dyn LedgerObserver) -> Result<()>) -> Result<()> {
        for observer in &self.observers {
            event(observer.as_ref())?;
        }
        Ok(())
    }

    /// Appends an already validated block on top of the tip and returns its id.
    pub fn append(&self, block: &Block, allowable: usize) -> Result<u32> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let expected_prev = match state.length() {
            0 => INITIAL_PREV_BLOCK,
            len => state.hash_at(len - 1).unwrap_or(INITIAL_PREV_BLOCK),
        };
        if *block.get_prev_block_hash() != expected_prev {
            return Err(Rejection::WrongPrevBlock.into());
        }

        let hash = block.hash();
        let id = state.write_block(hash, block.raw()).map_err(|e| {
            error!(target: "ledger", "Failed to write block {}: {e}", HEXLOWER.encode(&hash));
            e
        })?;
        state.caches.apply_block(block, id);
        state.remember_recent(hash, id);
        state.pending.mark_appended(id);

        let confirmed: Vec<Hash32> = block.get_transactions().iter().map(|tx| tx.hash()).collect();
        let before = state.free.len();
        state.free.retain(|tx| !confirmed.contains(&tx.hash));
        if state.free.len() != before {
            state.free_dirty = true;
        }

        self.notify(|o| o.on_block_added(block, id))?;
        info!(target: "ledger", "Added block {} {}", id, HEXLOWER.encode(&hash));
        Ok(id)
    }

    /// Removes the last `count` blocks, undoing them on every cache.
    pub fn remove_tail(&self, count: u32, allowable: usize) -> Result<()> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let length = state.length();
        let count = count.min(length);
        if count == 0 {
            return Ok(());
        }
        let new_length = length - count;
        for id in (new_length..length).rev() {
            let block = state
                .read_block(id)?
                .ok_or_else(|| BlockchainError::Io(format!("block {id} missing from index")))?;
            state.caches.revert_block(&block, id);
        }
        state.truncate(new_length).map_err(|e| {
            error!(target: "ledger", "Failed to truncate ledger to {new_length}: {e}");
            e
        })?;
        state.pending.mark_rewritten();
        self.notify(|o| o.on_blocks_removed(new_length))?;
        info!(target: "ledger", "Removed {count} blocks, length is now {new_length}");
        Ok(())
    }

    pub fn block_by_id(&self, id: u32, allowable: usize) -> Result<Option<Block>> {
        let _hold = self.lock.acquire(allowable)?;
        self.state().read_block(id)
    }

    /// `(hash, raw)` of block `id` as stored
    pub fn raw_by_id(&self, id: u32, allowable: usize) -> Result<Option<(Hash32, Vec<u8>)>> {
        let _hold = self.lock.acquire(allowable)?;
        self.state().read_raw(id)
    }

    pub fn block_by_hash(&self, hash: &Hash32, allowable: usize) -> Result<Option<(u32, Block)>> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let Some(id) = state.id_for_hash(hash) else {
            return Ok(None);
        };
        Ok(state.read_block(id)?.map(|block| (id, block)))
    }

    pub fn tip(&self, allowable: usize) -> Result<Option<(u32, Block)>> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let Some(id) = state.length().checked_sub(1) else {
            return Ok(None);
        };
        Ok(state.read_block(id)?.map(|block| (id, block)))
    }

    pub fn id_for_hash(&self, hash: &Hash32, allowable: usize) -> Result<Option<u32>> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.state().id_for_hash(hash))
    }

    pub fn hash_at(&self, id: u32, allowable: usize) -> Result<Option<Hash32>> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.state().hash_at(id))
    }

    /// Tip hash, or the genesis sentinel for an empty ledger
    pub fn prev_hash_for_next_block(&self, allowable: usize) -> Result<Hash32> {
        let _hold = self.lock.acquire(allowable)?;
        let state = self.state();
        Ok(match state.length() {
            0 => INITIAL_PREV_BLOCK,
            len => state.hash_at(len - 1).unwrap_or(INITIAL_PREV_BLOCK),
        })
    }

    /// Streams blocks `from..to` from disk. The lock hold lives as long as
    /// the iterator.
    pub fn iter_range(&self, from: u32, to: u32, allowable: usize) -> Result<LedgerRange<'_>> {
        LedgerRange::new(self, from, to, false, allowable)
    }

    /// Same blocks as [`Ledger::iter_range`], newest first
    pub fn iter_range_rev(&self, from: u32, to: u32, allowable: usize) -> Result<LedgerRange<'_>> {
        LedgerRange::new(self, from, to, true, allowable)
    }

    /// The transaction with `hash` if it is confirmed in a block `<= as_of`
    pub fn find_transaction(
        &self,
        hash: &Hash32,
        as_of: u32,
        allowable: usize,
    ) -> Result<Option<Transaction>> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let Some(block_id) = state.caches.tx_block(hash, as_of) else {
            return Ok(None);
        };
        let Some(block) = state.read_block(block_id)? else {
            return Ok(None);
        };
        Ok(block
            .get_transactions()
            .iter()
            .find(|tx| tx.hash() == *hash)
            .cloned())
    }

    /// Block id that spent the output, ignoring spends after `as_of`
    pub fn is_output_spent(
        &self,
        tx_hash: &Hash32,
        out_n: u32,
        as_of: u32,
        allowable: usize,
    ) -> Result<Option<u32>> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.state().caches.spent_at(tx_hash, out_n, as_of))
    }

    /// Blocks whose time is in `(since, till]`
    pub fn count_blocks_in_time_window(&self, since: u64, till: u64, allowable: usize) -> Result<u32> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.state().caches.count_blocks_in_time_window(since, till))
    }

    pub fn miner_block_count(&self, miner: &Address, allowable: usize) -> Result<u32> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.state().caches.miner_block_count(miner))
    }

    fn free_state(&self) -> Result<MutexGuard<'_, LedgerState>> {
        let now = current_unix_time()?;
        let mut state = self.state();
        state.purge_free(now);
        Ok(state)
    }

    pub fn is_known_free(&self, hash: &Hash32, allowable: usize) -> Result<bool> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.free_state()?.free.iter().any(|tx| tx.hash == *hash))
    }

    /// Adds a validated transaction to the free pool. Returns false if it
    /// was already there or has already expired.
    pub fn add_free(&self, tx: &Transaction, allowable: usize) -> Result<bool> {
        self.add_free_at(tx, current_unix_time()?, allowable)
    }

    /// [`Ledger::add_free`] with an explicit arrival time
    pub fn add_free_at(&self, tx: &Transaction, added: u64, allowable: usize) -> Result<bool> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.free_state()?;
        let hash = tx.hash();
        if state.free.iter().any(|free| free.hash == hash) {
            return Ok(false);
        }
        state.free.push(&FreeTx {
            hash,
            added,
            raw: tx.raw().to_vec(),
        })?;
        state.purge_free(current_unix_time()?);
        state.free_dirty = true;
        let kept = state.free.iter().any(|free| free.hash == hash);
        Ok(kept)
    }

    pub fn remove_free(&self, hash: &Hash32, allowable: usize) -> Result<bool> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.free_state()?;
        let Some(index) = state.free.position(|tx| tx.hash == *hash) else {
            return Ok(false);
        };
        state.free.remove(index);
        state.free_dirty = true;
        Ok(true)
    }

    /// Free pool in arrival order
    pub fn free_transactions(&self, allowable: usize) -> Result<Vec<Transaction>> {
        let _hold = self.lock.acquire(allowable)?;
        self.free_state()?.free_transactions()
    }

    pub fn free_transactions_rev(&self, allowable: usize) -> Result<Vec<Transaction>> {
        let mut txs = self.free_transactions(allowable)?;
        txs.reverse();
        Ok(txs)
    }

    pub fn is_output_spent_by_free(&self, tx_hash: &Hash32, out_n: u32, allowable: usize) -> Result<bool> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self
            .free_state()?
            .free_transactions()?
            .iter()
            .any(|tx| tx.spends(tx_hash, out_n)))
    }

    fn flush_pending(&self, state: &mut LedgerState) -> Result<()> {
        let length = state.length();
        let pending = state.pending;
        if pending.is_empty() && !state.free_dirty && state.meta.caches_match(length) {
            return Ok(());
        }
        if pending.rewritten || (!state.meta.caches_match(length) && pending.appended_from.is_none()) {
            state.caches.save(&self.data_dir)?;
        } else if let Some(from) = pending.appended_from {
            state.caches.save_appended(&self.data_dir, from)?;
        }
        if state.free_dirty {
            write_file(&self.data_dir.join(FREE_CACHE), state.free.as_bytes())?;
            state.free_dirty = false;
        }
        self.notify(|o| o.on_cache_save())?;
        state.pending = CacheChanges::default();
        state.meta.caches_clean = true;
        state.meta.cached_length = length;
        state.meta.save(&self.data_dir)?;
        debug!(target: "ledger", "Caches saved at length {length}");
        Ok(())
    }

    /// Persists cache changes made outside [`Ledger::with_cache_rewrite`]
    pub fn flush_caches(&self, allowable: usize) -> Result<()> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        self.flush_pending(&mut state)
    }

    /// Final flush at shutdown. Works after termination, but only once no
    /// hold is outstanding.
    pub fn close(&self) -> Result<()> {
        if self.lock.depth() > 0 {
            return Err(BlockchainError::Terminated);
        }
        let mut state = self.state();
        self.flush_pending(&mut state)
    }

    /// Runs a mutation bracketed by cache persistence. Pending writes are
    /// flushed and the caches marked dirty before `body` runs; afterwards the
    /// changes it declared are written and the caches marked clean, all
    /// before the hold is released.
    pub fn with_cache_rewrite<T>(
        &self,
        allowable: usize,
        body: impl FnOnce(&mut CacheChanges) -> Result<T>,
    ) -> Result<T> {
        let _hold = self.lock.acquire(allowable)?;
        {
            let mut state = self.state();
            self.flush_pending(&mut state)?;
            state.meta.caches_clean = false;
            state.meta.save(&self.data_dir)?;
        }

        let mut changes = CacheChanges::default();
        let outcome = body(&mut changes);
        if matches!(&outcome, Err(e) if e.is_fatal()) {
            return outcome;
        }

        let mut state = self.state();
        state.pending.merge(changes);
        self.flush_pending(&mut state)?;
        outcome
    }

    fn rebuild_locked(&self, state: &mut LedgerState) -> Result<()> {
        info!(target: "ledger", "Rebuilding caches for {} blocks", state.length());
        self.notify(|o| o.on_reset())?;
        state.caches.clear();
        for id in 0..state.length() {
            let block = state
                .read_block(id)?
                .ok_or_else(|| BlockchainError::Io(format!("block {id} missing from index")))?;
            state.caches.apply_block(&block, id);
            self.notify(|o| o.on_block_added(&block, id))?;
        }
        state.pending.mark_rewritten();
        state.meta.caches_clean = false;
        self.flush_pending(state)
    }

    /// Recomputes every derived cache from the block files.
    pub fn rebuild_caches(&self, allowable: usize) -> Result<()> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        self.rebuild_locked(&mut state)
    }

    /// True when the in-memory caches equal a fresh rebuild
    pub fn verify_caches(&self, allowable: usize) -> Result<bool> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let mut fresh = Caches::new();
        for id in 0..state.length() {
            if let Some(block) = state.read_block(id)? {
                fresh.apply_block(&block, id);
            }
        }
        Ok(fresh.same_bytes(&state.caches))
    }

    /// First block whose stored hash or `prev_block_hash` link is wrong
    pub fn verify_chain(&self, allowable: usize) -> Result<Option<u32>> {
        let mut expected_prev = INITIAL_PREV_BLOCK;
        for item in self.iter_range(0, u32::MAX, allowable)? {
            let (id, block) = item?;
            if *block.get_prev_block_hash() != expected_prev || block.compute_hash() != block.hash() {
                warn!(target: "ledger", "Chain broken at block {id}");
                return Ok(Some(id));
            }
            expected_prev = block.hash();
        }
        Ok(None)
    }

    /// Block-time ids run 0.. without gaps and times never step back by
    /// more than a minute.
    pub fn verify_time_cache(&self, allowable: usize) -> Result<bool> {
        let _hold = self.lock.acquire(allowable)?;
        let state = self.state();
        if state.caches.times.len() != state.index.len() {
            return Ok(false);
        }
        let mut previous: Option<u64> = None;
        for (expected_id, entry) in state.caches.times.iter().enumerate() {
            if entry.id as usize != expected_id {
                return Ok(false);
            }
            if previous.is_some_and(|prev| entry.time + MAX_TIME_STEP_BACK < prev) {
                return Ok(false);
            }
            previous = Some(entry.time);
        }
        Ok(true)
    }

    pub fn cache_snapshot(&self, allowable: usize) -> Result<CacheSnapshot> {
        let _hold = self.lock.acquire(allowable)?;
        Ok(self.state().snapshot())
    }

    /// Serves the catch-up protocol: up to `max_count` blocks after `hash`,
    /// stopping before `max_bytes` of raw data (at least one block is sent).
    pub fn blocks_after(
        &self,
        hash: &Hash32,
        max_count: usize,
        max_bytes: usize,
        allowable: usize,
    ) -> Result<BlocksAfter> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let length = state.length();
        let start = if *hash == INITIAL_PREV_BLOCK {
            0
        } else {
            match state.id_for_hash(hash) {
                Some(id) => id + 1,
                None => {
                    return Ok(BlocksAfter::NoBlock {
                        ledger_length: length,
                    })
                }
            }
        };
        if start >= length {
            return Ok(BlocksAfter::NoBlockAfter);
        }
        let mut blocks = Vec::new();
        let mut bytes = 0usize;
        for id in start..length {
            if blocks.len() >= max_count {
                break;
            }
            let Some((block_hash, raw)) = state.read_raw(id)? else {
                break;
            };
            if !blocks.is_empty() && bytes + raw.len() > max_bytes {
                break;
            }
            bytes += raw.len();
            blocks.push((block_hash, raw));
        }
        Ok(BlocksAfter::Blocks(blocks))
    }

    /// Copies the ledger files into the next checkpoint slot.
    pub fn save_checkpoint(&self, allowable: usize) -> Result<PathBuf> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        self.notify(|o| o.on_before_checkpoint())?;
        state.meta.caches_clean = false;
        self.flush_pending(&mut state)?;
        let slot = checkpoint::next_slot(state.meta.last_checkpoint);
        let path = checkpoint::write_slot(&self.data_dir, slot)?;
        state.meta.last_checkpoint = Some(slot);
        state.meta.save(&self.data_dir)?;
        self.notify(|o| o.on_checkpoint_saved(&path))?;
        Ok(path)
    }

    /// Restores the most recent ready checkpoint. Returns `None` when there
    /// is none. Observers are replayed from block 0 afterwards.
    pub fn load_checkpoint(&self, allowable: usize) -> Result<Option<PathBuf>> {
        let _hold = self.lock.acquire(allowable)?;
        let mut state = self.state();
        let Some(slot) = checkpoint::restorable_slots(&self.data_dir, state.meta.last_checkpoint)
            .into_iter()
            .next()
        else {
            warn!(target: "ledger", "No ready checkpoint to load");
            return Ok(None);
        };
        let path = checkpoint::restore_slot(&self.data_dir, slot)?;

        let mut meta = state.meta.clone();
        meta.caches_clean = false;
        meta.save(&self.data_dir)?;
        let (restored, _) = LedgerState::open(&self.data_dir)?;
        *state = restored;
        state.meta.last_checkpoint = Some(slot);
        self.rebuild_locked(&mut state)?;
        self.notify(|o| o.on_checkpoint_loaded(&path))?;
        info!(target: "ledger", "Loaded checkpoint {} with {} blocks", path.display(), state.length());
        Ok(Some(path))
    }
}

/// Forward or reverse stream of `(id, block)` read from disk on demand
pub struct LedgerRange<'a> {
    ledger: &'a Ledger,
    _hold: LockHold<'a>,
    front: u32,
    back: u32,
    reverse: bool,
}

impl<'a> LedgerRange<'a> {
    fn new(ledger: &'a Ledger, from: u32, to: u32, reverse: bool, allowable: usize) -> Result<Self> {
        let hold = ledger.lock.acquire(allowable)?;
        let back = to.min(ledger.length());
        Ok(LedgerRange {
            ledger,
            _hold: hold,
            front: from.min(back),
            back,
            reverse,
        })
    }
}

impl Iterator for LedgerRange<'_> {
    type Item = Result<(u32, Block)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let id = if self.reverse {
            self.back -= 1;
            self.back
        } else {
            self.front += 1;
            self.front - 1
        };
        match self.ledger.state().read_block(id) {
            Ok(Some(block)) => Some(Ok((id, block))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
