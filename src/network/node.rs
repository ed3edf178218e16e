use crate::config::Config;
use crate::core::LockCoordinator;
use crate::error::{BlockchainError, Result};
use crate::network::{BlockProcessor, Network, SyncStatus, Synchronizer, TxProcessor};
use crate::storage::{Ledger, LedgerObserver, SledTransactionIndex};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Session state shared by a node's components. Passed around explicitly;
/// nothing here is global.
#[derive(Clone)]
pub struct NodeContext {
    config: Arc<Config>,
    terminated: Arc<AtomicBool>,
    status: Arc<SyncStatus>,
}

impl NodeContext {
    pub fn new(config: Config) -> NodeContext {
        let status = SyncStatus::new(config.is_promiscuous_initial_sync());
        NodeContext {
            config: Arc::new(config),
            terminated: Arc::new(AtomicBool::new(false)),
            status: Arc::new(status),
        }
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn get_status(&self) -> &Arc<SyncStatus> {
        &self.status
    }

    pub fn get_terminated(&self) -> &Arc<AtomicBool> {
        &self.terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// A running ledger node: the ledger with its secondary index, the block and
/// transaction processors, and the synchronizer.
pub struct Node {
    context: NodeContext,
    ledger: Arc<Ledger>,
    index: Arc<SledTransactionIndex>,
    processor: BlockProcessor,
    tx_processor: TxProcessor,
    synchronizer: Arc<Synchronizer>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn open(config: Config, network: Arc<dyn Network>) -> Result<Node> {
        let context = NodeContext::new(config);
        let config = context.get_config();
        let lock = LockCoordinator::new("ledger", Arc::clone(context.get_terminated()));
        let index = Arc::new(SledTransactionIndex::open(config.get_index_dir())?);
        let observers: Vec<Arc<dyn LedgerObserver>> = vec![index.clone()];
        let ledger = Arc::new(Ledger::open(config.get_data_dir(), lock, observers)?);

        let processor = BlockProcessor::new(
            Arc::clone(&ledger),
            Arc::clone(&network),
            Arc::clone(context.get_status()),
        );
        let tx_processor = TxProcessor::new(Arc::clone(&ledger), Arc::clone(&network));
        let synchronizer = Arc::new(Synchronizer::new(
            Arc::clone(&ledger),
            network,
            Arc::clone(context.get_status()),
            Arc::clone(context.get_terminated()),
            config.get_blocks_per_request(),
        ));
        info!(target: "node", "Opened ledger at {} with {} blocks", config.get_data_dir().display(), ledger.length());
        Ok(Node {
            context,
            ledger,
            index,
            processor,
            tx_processor,
            synchronizer,
            watchdog: Mutex::new(None),
        })
    }

    /// Runs a first sync, then starts the stall watchdog
    pub fn start(&self) -> Result<()> {
        let mut watchdog = self.watchdog.lock().unwrap_or_else(|e| e.into_inner());
        if watchdog.is_some() {
            return Ok(());
        }
        self.synchronizer.sync()?;
        let config = self.context.get_config();
        *watchdog = Some(
            self.synchronizer
                .spawn_watchdog(config.get_sync_interval(), config.get_stall_timeout())?,
        );
        Ok(())
    }

    /// Signals termination, waits for in-flight ledger work up to the
    /// configured timeout and flushes caches.
    pub fn shutdown(&self) -> Result<()> {
        info!(target: "node", "Shutting down");
        self.context.get_terminated().store(true, Ordering::SeqCst);
        self.ledger.lock_coordinator().terminate();
        let timeout = self.context.get_config().get_shutdown_timeout();
        if !self.ledger.lock_coordinator().wait_idle(timeout) {
            warn!(target: "node", "Ledger still busy after {}s, exiting anyway", timeout.as_secs());
            return Err(BlockchainError::Terminated);
        }
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = watchdog {
            if handle.join().is_err() {
                warn!(target: "node", "Sync watchdog panicked");
            }
        }
        self.ledger.close()?;
        self.index.flush()
    }

    pub fn get_context(&self) -> &NodeContext {
        &self.context
    }

    pub fn get_ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn get_index(&self) -> &SledTransactionIndex {
        &self.index
    }

    pub fn get_processor(&self) -> &BlockProcessor {
        &self.processor
    }

    pub fn get_tx_processor(&self) -> &TxProcessor {
        &self.tx_processor
    }

    pub fn get_synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackNetwork;
    use crate::testnet::{create_temp_dir, extend_chain};
    use crate::wallet::Wallet;
    use std::time::Duration;

    fn open_node(dir: &std::path::Path, network: Arc<LoopbackNetwork>) -> Node {
        let config = Config::default()
            .with_data_dir(dir)
            .with_sync_interval(Duration::from_secs(1));
        Node::open(config, network).unwrap()
    }

    #[test]
    fn test_open_index_and_shutdown() {
        let dir = create_temp_dir().unwrap();
        let node = open_node(dir.path(), Arc::new(LoopbackNetwork::new(1 << 20)));
        let miner = Wallet::new().unwrap().get_address();
        extend_chain(node.get_ledger(), &miner, 2).unwrap();
        assert!(node.get_index().balance(&miner).unwrap() > 0);

        node.start().unwrap();
        node.shutdown().unwrap();
        assert!(node.get_context().is_terminated());
        assert_eq!(node.get_ledger().length(), 2);
    }

    #[test]
    fn test_synchronizes_from_peer() {
        let peer_dir = create_temp_dir().unwrap();
        let peer = open_node(peer_dir.path(), Arc::new(LoopbackNetwork::new(1 << 20)));
        let miner = Wallet::new().unwrap().get_address();
        extend_chain(peer.get_ledger(), &miner, 3).unwrap();

        let network = Arc::new(LoopbackNetwork::new(1 << 20));
        network.add_peer(Arc::clone(peer.get_ledger()));
        let dir = create_temp_dir().unwrap();
        let node = open_node(dir.path(), network);
        assert!(node.get_context().get_status().is_promiscuous());

        node.get_synchronizer().sync().unwrap();
        assert_eq!(node.get_ledger().length(), 3);
        assert!(node.get_context().get_status().is_ready());
        assert!(!node.get_context().get_status().is_promiscuous());
        assert_eq!(node.get_index().balance(&miner).unwrap(), peer.get_index().balance(&miner).unwrap());
    }
}
