//! Catch-up protocol.
//!
//! Each cycle asks the peers for the blocks after the local tip and appends
//! whatever validates. A peer that does not know the local tip but has a
//! longer chain is evidence of a fork; when such a cycle accepts nothing the
//! local tip is assumed orphaned and a few blocks are rolled back.

use crate::core::{Block, Hash32, ValidationContext};
use crate::error::{BlockchainError, Result};
use crate::network::Network;
use crate::storage::{BlocksAfter, Ledger};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Most blocks dropped by one rollback
pub const MAX_ROLLBACK: u32 = 8;
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    RequestingBatch,
    ValidatingBatch,
    RollingBack,
}

/// Result of one request/validate round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub accepted: u32,
    pub fork_detected: bool,
    pub rolled_back: u32,
    pub converged: bool,
}

impl CycleOutcome {
    /// A cycle that changed the ledger is followed by another one
    pub fn should_continue(&self) -> bool {
        self.accepted > 0 || self.rolled_back > 0
    }
}

/// Synchronization status shared by the node's components
pub struct SyncStatus {
    ready: AtomicBool,
    first_ready: AtomicBool,
    promiscuous: AtomicBool,
    last_block_added: Mutex<Instant>,
}

impl SyncStatus {
    pub fn new(promiscuous: bool) -> SyncStatus {
        SyncStatus {
            ready: AtomicBool::new(false),
            first_ready: AtomicBool::new(false),
            promiscuous: AtomicBool::new(promiscuous),
            last_block_added: Mutex::new(Instant::now()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Marks the node ready; true only for the first call. Transaction
    /// checks are never skipped after this.
    pub fn mark_ready(&self) -> bool {
        self.promiscuous.store(false, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        !self.first_ready.swap(true, Ordering::SeqCst)
    }

    /// A node is not ready while a sync cycle is in progress
    pub fn clear_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::SeqCst)
    }

    pub fn block_added(&self) {
        *self.last_block_added.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn since_last_block(&self) -> Duration {
        self.last_block_added
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

type FirstSyncCallback = Box<dyn FnOnce() + Send>;

pub struct Synchronizer {
    ledger: Arc<Ledger>,
    network: Arc<dyn Network>,
    status: Arc<SyncStatus>,
    terminated: Arc<AtomicBool>,
    batch_size: usize,
    running: AtomicBool,
    state: Mutex<SyncState>,
    on_first_sync: Mutex<Option<FirstSyncCallback>>,
}

/// Clears the re-entrancy flag however the sync loop exits
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Synchronizer {
    pub fn new(
        ledger: Arc<Ledger>,
        network: Arc<dyn Network>,
        status: Arc<SyncStatus>,
        terminated: Arc<AtomicBool>,
        batch_size: usize,
    ) -> Synchronizer {
        Synchronizer {
            ledger,
            network,
            status,
            terminated,
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
            state: Mutex::new(SyncState::Idle),
            on_first_sync: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Runs once, the first time the node converges with its peers
    pub fn on_first_sync(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_first_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Runs cycles until one leaves the ledger unchanged. Returns at once if
    /// another sync is already running.
    pub fn sync(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target: "sync", "Sync already running");
            return Ok(());
        }
        let _running = RunningGuard(&self.running);

        while !self.is_terminated() {
            let outcome = match self.sync_cycle() {
                Ok(outcome) => outcome,
                Err(BlockchainError::Terminated) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(target: "sync", "Sync cycle failed: {e}");
                    break;
                }
            };
            if !outcome.should_continue() {
                break;
            }
        }
        Ok(())
    }

    /// One request/validate round, plus a rollback when a fork is detected
    /// and nothing could be appended.
    pub fn sync_cycle(&self) -> Result<CycleOutcome> {
        let result = self.run_cycle();
        self.set_state(SyncState::Idle);
        result
    }

    fn run_cycle(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        self.status.clear_ready();
        self.set_state(SyncState::RequestingBatch);
        let tip_hash = self.ledger.prev_hash_for_next_block(0)?;
        let local_length = self.ledger.length();
        let answers = self.network.request_blocks_after(&tip_hash, self.batch_size)?;

        for answer in answers {
            match answer {
                BlocksAfter::Blocks(blocks) => {
                    self.set_state(SyncState::ValidatingBatch);
                    outcome.accepted += self.validate_batch(blocks)?;
                }
                BlocksAfter::NoBlockAfter => outcome.converged = true,
                BlocksAfter::NoBlock { ledger_length } if ledger_length > local_length => {
                    debug!(target: "sync", "Peer with {ledger_length} blocks does not know our tip");
                    outcome.fork_detected = true;
                }
                BlocksAfter::NoBlock { .. } => {}
            }
        }

        if outcome.accepted > 0 {
            return Ok(outcome);
        }
        // A peer that agrees with our tip outweighs one that reports a fork
        if outcome.converged {
            if self.status.mark_ready() {
                info!(target: "sync", "Synchronized with peers at {} blocks", self.ledger.length());
                let callback = self
                    .on_first_sync
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                if let Some(callback) = callback {
                    callback();
                }
            }
        } else if outcome.fork_detected && !self.is_terminated() {
            self.set_state(SyncState::RollingBack);
            outcome.rolled_back = self.roll_back()?;
        }
        Ok(outcome)
    }

    fn roll_back(&self) -> Result<u32> {
        let ledger = &self.ledger;
        let count = ledger.with_cache_rewrite(0, |changes| {
            let count = MAX_ROLLBACK.min(ledger.length());
            ledger.remove_tail(count, 1)?;
            changes.mark_rewritten();
            Ok(count)
        })?;
        warn!(target: "sync", "Fork detected, rolled back {count} blocks to {}", ledger.length());
        Ok(count)
    }

    /// Appends blocks in order until one fails validation. Returns how many
    /// were accepted.
    fn validate_batch(&self, blocks: Vec<(Hash32, Vec<u8>)>) -> Result<u32> {
        let mut accepted = 0;
        for (hash, raw) in blocks {
            if self.is_terminated() {
                break;
            }
            if !self.accept_block(hash, &raw)? {
                break;
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    fn accept_block(&self, hash: Hash32, raw: &[u8]) -> Result<bool> {
        let ledger = &self.ledger;
        let _hold = ledger.lock_coordinator().acquire(0)?;
        if ledger.id_for_hash(&hash, 1)?.is_some() {
            // Several peers may send the same blocks
            return Ok(true);
        }
        let rejected = |e: BlockchainError| -> Result<bool> {
            match e {
                BlockchainError::Consensus(reason) => {
                    warn!(target: "sync", "Rejected block {}: {reason}", HEXLOWER.encode(&hash));
                    Ok(false)
                }
                other => Err(other),
            }
        };
        let block = match Block::from_raw(hash, raw) {
            Ok(block) => block,
            Err(e) => return rejected(e),
        };
        let ref_id = ledger.length().checked_sub(1);
        let ctx = ValidationContext::current()?.with_promiscuous(self.status.is_promiscuous());
        if let Err(e) = block.validate_after(ledger, ref_id, &ctx, 1) {
            return rejected(e);
        }
        ledger.with_cache_rewrite(1, |changes| {
            let id = ledger.append(&block, 2)?;
            changes.mark_appended(id);
            Ok(())
        })?;
        self.status.block_added();
        Ok(true)
    }

    /// Periodic trigger: every `interval` checks when a block was last
    /// accepted and forces a sync once that is `stall_timeout` ago. A fatal
    /// error stops the node.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        interval: Duration,
        stall_timeout: Duration,
    ) -> Result<JoinHandle<()>> {
        let synchronizer = Arc::clone(self);
        thread::Builder::new()
            .name("sync-watchdog".to_string())
            .spawn(move || loop {
                let started = Instant::now();
                while started.elapsed() < interval {
                    if synchronizer.is_terminated() {
                        return;
                    }
                    thread::sleep(SLEEP_SLICE.min(interval));
                }
                if synchronizer.is_terminated() {
                    return;
                }
                let stalled = synchronizer.status.since_last_block();
                if stalled < stall_timeout {
                    continue;
                }
                warn!(target: "sync", "No block accepted for {}s, forcing sync", stalled.as_secs());
                if let Err(e) = synchronizer.sync() {
                    error!(target: "sync", "Stopping after fatal error: {e}");
                    synchronizer.terminated.store(true, Ordering::SeqCst);
                    synchronizer.ledger.lock_coordinator().terminate();
                    return;
                }
            })
            .map_err(|e| BlockchainError::Io(format!("Failed to spawn watchdog: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackNetwork;
    use crate::testnet::{create_test_ledger, extend_chain};
    use crate::wallet::Wallet;
    use std::sync::atomic::AtomicUsize;

    /// Loopback network that counts block requests
    struct CountingNetwork {
        inner: LoopbackNetwork,
        requests: AtomicUsize,
    }

    impl CountingNetwork {
        fn new() -> CountingNetwork {
            CountingNetwork {
                inner: LoopbackNetwork::new(1 << 20),
                requests: AtomicUsize::new(0),
            }
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl Network for CountingNetwork {
        fn request_blocks_after(&self, hash: &Hash32, count: usize) -> Result<Vec<BlocksAfter>> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.inner.request_blocks_after(hash, count)
        }

        fn broadcast_block_found(&self, hash: &Hash32, raw: &[u8]) -> Result<()> {
            self.inner.broadcast_block_found(hash, raw)
        }

        fn broadcast_transaction(&self, hash: &Hash32, raw: &[u8]) -> Result<()> {
            self.inner.broadcast_transaction(hash, raw)
        }
    }

    fn synchronizer_for(ledger: &Arc<Ledger>, network: Arc<dyn Network>) -> Synchronizer {
        Synchronizer::new(
            Arc::clone(ledger),
            network,
            Arc::new(SyncStatus::new(false)),
            Arc::new(AtomicBool::new(false)),
            DEFAULT_BATCH_SIZE,
        )
    }

    fn copy_chain(from: &Ledger, to: &Ledger) {
        for id in 0..from.length() {
            to.append(&from.block_by_id(id, 0).unwrap().unwrap(), 0).unwrap();
        }
    }

    #[test]
    fn test_status_ready_once() {
        let status = SyncStatus::new(true);
        assert!(status.is_promiscuous());
        assert!(!status.is_ready());
        assert!(status.mark_ready());
        assert!(!status.mark_ready());
        assert!(status.is_ready());
        assert!(!status.is_promiscuous());
    }

    #[test]
    fn test_cycle_continuation() {
        assert!(!CycleOutcome::default().should_continue());
        let accepted = CycleOutcome {
            accepted: 1,
            ..CycleOutcome::default()
        };
        assert!(accepted.should_continue());
        let rolled = CycleOutcome {
            rolled_back: 2,
            fork_detected: true,
            ..CycleOutcome::default()
        };
        assert!(rolled.should_continue());
    }

    #[test]
    fn test_convergence_outweighs_fork() {
        let (local, _local_dir) = create_test_ledger().unwrap();
        extend_chain(&local, &Wallet::new().unwrap().get_address(), 3).unwrap();
        let (agreeing, _agreeing_dir) = create_test_ledger().unwrap();
        copy_chain(&local, &agreeing);
        let (forked, _forked_dir) = create_test_ledger().unwrap();
        extend_chain(&forked, &Wallet::new().unwrap().get_address(), 5).unwrap();

        let network = Arc::new(CountingNetwork::new());
        network.inner.add_peer(agreeing);
        network.inner.add_peer(forked);
        let synchronizer = synchronizer_for(&local, network);

        let outcome = synchronizer.sync_cycle().unwrap();
        assert!(outcome.converged);
        assert!(outcome.fork_detected);
        assert_eq!(outcome.rolled_back, 0);
        assert!(!outcome.should_continue());
        assert_eq!(local.length(), 3);
        assert!(synchronizer.status.is_ready());
        assert_eq!(synchronizer.state(), SyncState::Idle);
    }

    #[test]
    fn test_rollback_limited_to_ledger_length() {
        let (local, _local_dir) = create_test_ledger().unwrap();
        extend_chain(&local, &Wallet::new().unwrap().get_address(), 3).unwrap();
        let (peer, _peer_dir) = create_test_ledger().unwrap();
        extend_chain(&peer, &Wallet::new().unwrap().get_address(), 6).unwrap();

        let network = Arc::new(CountingNetwork::new());
        network.inner.add_peer(Arc::clone(&peer));
        let synchronizer = synchronizer_for(&local, network);

        let outcome = synchronizer.sync_cycle().unwrap();
        assert!(outcome.fork_detected);
        assert_eq!(outcome.rolled_back, 3);
        assert_eq!(local.length(), 0);
        assert!(!synchronizer.status.is_ready());

        synchronizer.sync().unwrap();
        assert_eq!(local.length(), 6);
        assert_eq!(local.hash_at(5, 0).unwrap(), peer.hash_at(5, 0).unwrap());
        assert!(synchronizer.status.is_ready());
    }

    #[test]
    fn test_sync_is_not_reentrant() {
        let (local, _dir) = create_test_ledger().unwrap();
        let network = Arc::new(CountingNetwork::new());
        let synchronizer = synchronizer_for(&local, network.clone());

        synchronizer.running.store(true, Ordering::SeqCst);
        synchronizer.sync().unwrap();
        assert_eq!(network.requests(), 0);

        synchronizer.running.store(false, Ordering::SeqCst);
        synchronizer.sync().unwrap();
        assert_eq!(network.requests(), 1);
        assert!(!synchronizer.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_watchdog_waits_for_stall() {
        let (local, _dir) = create_test_ledger().unwrap();
        let network = Arc::new(CountingNetwork::new());
        let synchronizer = Arc::new(synchronizer_for(&local, network.clone()));

        let handle = synchronizer
            .spawn_watchdog(Duration::from_millis(20), Duration::from_millis(400))
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(network.requests(), 0);

        thread::sleep(Duration::from_millis(600));
        assert!(network.requests() > 0);

        synchronizer.terminated.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
