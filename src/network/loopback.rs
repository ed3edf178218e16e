use crate::core::Hash32;
use crate::error::{BlockchainError, Result};
use crate::network::Network;
use crate::storage::{BlocksAfter, Ledger};
use data_encoding::HEXLOWER;
use log::{debug, warn};
use std::sync::{Arc, RwLock};

/// Something this node announced to its peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    BlockFound { hash: Hash32, raw: Vec<u8> },
    Transaction { hash: Hash32, raw: Vec<u8> },
}

/// In-process network: peers are other ledgers opened in the same process.
/// Requests are answered straight from the peers' ledgers and broadcasts are
/// recorded instead of sent.
pub struct LoopbackNetwork {
    peers: RwLock<Vec<Arc<Ledger>>>,
    max_packet_bytes: usize,
    sent: RwLock<Vec<Broadcast>>,
}

impl LoopbackNetwork {
    pub fn new(max_packet_bytes: usize) -> LoopbackNetwork {
        LoopbackNetwork {
            peers: RwLock::new(vec![]),
            max_packet_bytes,
            sent: RwLock::new(vec![]),
        }
    }

    pub fn add_peer(&self, peer: Arc<Ledger>) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if !peers.iter().any(|p| Arc::ptr_eq(p, &peer)) {
            peers.push(peer);
        }
    }

    pub fn evict_peer(&self, peer: &Arc<Ledger>) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.retain(|p| !Arc::ptr_eq(p, peer));
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.sent.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, broadcast: Broadcast) {
        self.sent
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(broadcast);
    }
}

impl Network for LoopbackNetwork {
    fn request_blocks_after(&self, hash: &Hash32, count: usize) -> Result<Vec<BlocksAfter>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut answers = Vec::with_capacity(peers.len());
        for peer in peers {
            match peer.blocks_after(hash, count, self.max_packet_bytes, 0) {
                Ok(answer) => answers.push(answer),
                // An unreachable peer is skipped, the rest still answer
                Err(e) => warn!(target: "sync", "Peer {} did not answer: {e}", peer.data_dir().display()),
            }
        }
        if answers.is_empty() && self.peer_count() > 0 {
            return Err(BlockchainError::Network("no peer answered".to_string()));
        }
        Ok(answers)
    }

    fn broadcast_block_found(&self, hash: &Hash32, raw: &[u8]) -> Result<()> {
        debug!(target: "processor", "Broadcasting block {}", HEXLOWER.encode(hash));
        self.record(Broadcast::BlockFound {
            hash: *hash,
            raw: raw.to_vec(),
        });
        Ok(())
    }

    fn broadcast_transaction(&self, hash: &Hash32, raw: &[u8]) -> Result<()> {
        debug!(target: "processor", "Broadcasting transaction {}", HEXLOWER.encode(hash));
        self.record(Broadcast::Transaction {
            hash: *hash,
            raw: raw.to_vec(),
        });
        Ok(())
    }
}
