// Block wire layout:
//
//   hash(32) | version(1) | prevBlockHash(32) | time(8) | target(32) | nonce(8)
//   | txCount(4) | txHash(32) x txCount | [txLength(4) | txRaw] x txCount
//
// The data file stores everything after the hash. Version 2 hashes only the
// header and the tx-hash list, version 1 hashes the whole raw block.

use crate::core::difficulty::{next_target, Target, RETARGET_INTERVAL, RETARGET_WINDOW_SECS};
use crate::core::transaction::MAX_FUTURE_DRIFT_SECS;
use crate::core::{Hash32, Rejection, Transaction, TxRole, ValidationContext};
use crate::error::{BlockchainError, Result};
use crate::storage::Ledger;
use crate::utils::{double_sha256, ByteReader};
use crate::wallet::Address;
use data_encoding::HEXLOWER;
use log::debug;
use once_cell::sync::OnceCell;
use std::fmt;

/// version + prev hash + time + target + nonce + tx count
pub const BLOCK_HEADER_LENGTH: usize = 1 + 32 + 8 + 32 + 8 + 4;
pub const MAX_BLOCK_SIZE: usize = 1_048_576;
/// `prevBlockHash` of the genesis block
pub const INITIAL_PREV_BLOCK: Hash32 = [0xFF; 32];
/// A block may be this many seconds older than its parent
pub const MAX_PAST_DRIFT_SECS: u64 = 60;
pub const CURRENT_VERSION: u8 = 2;

#[derive(Clone)]
pub struct Block {
    version: u8,
    prev_block_hash: Hash32,
    time: u64,
    target: Target,
    nonce: u64,
    transactions: Vec<Transaction>,
    claimed_hash: Option<Hash32>,
    hash: OnceCell<Hash32>,
    raw: OnceCell<Vec<u8>>,
}

impl Block {
    pub fn new(prev_block_hash: Hash32, time: u64, target: Target) -> Block {
        Self::with_version(CURRENT_VERSION, prev_block_hash, time, target)
    }

    pub fn with_version(version: u8, prev_block_hash: Hash32, time: u64, target: Target) -> Block {
        Block {
            version,
            prev_block_hash,
            time,
            target,
            nonce: 0,
            transactions: vec![],
            claimed_hash: None,
            hash: OnceCell::new(),
            raw: OnceCell::new(),
        }
    }

    fn touch(&mut self) {
        self.claimed_hash = None;
        self.hash = OnceCell::new();
        self.raw = OnceCell::new();
    }

    pub fn set_prev_block_hash(&mut self, prev_block_hash: Hash32) {
        self.prev_block_hash = prev_block_hash;
        self.touch();
    }

    pub fn set_time(&mut self, time: u64) {
        self.time = time;
        self.touch();
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = target;
        self.touch();
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
        self.touch();
    }

    pub fn add_transaction(&mut self, tx: Transaction) {
        self.transactions.push(tx);
        self.touch();
    }

    /// Puts the coinbase in front of transactions already collected
    pub fn add_first_transaction(&mut self, tx: Transaction) {
        self.transactions.insert(0, tx);
        self.touch();
    }

    pub fn get_version(&self) -> u8 {
        self.version
    }

    pub fn get_prev_block_hash(&self) -> &Hash32 {
        &self.prev_block_hash
    }

    pub fn get_time(&self) -> u64 {
        self.time
    }

    pub fn get_target(&self) -> &Target {
        &self.target
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Address paid by the coinbase, used for fork tie-breaking
    pub fn miner_address(&self) -> Option<Address> {
        self.transactions
            .first()
            .and_then(|tx| tx.get_output(0))
            .map(|out| out.address)
    }

    /// Serialized block without the leading hash, as stored in the data file
    pub fn raw(&self) -> &[u8] {
        self.raw.get_or_init(|| self.encode())
    }

    fn encode(&self) -> Vec<u8> {
        let bodies: usize = self.transactions.iter().map(|tx| 4 + tx.raw_len()).sum();
        let mut raw =
            Vec::with_capacity(BLOCK_HEADER_LENGTH + 32 * self.transactions.len() + bodies);
        raw.push(self.version);
        raw.extend_from_slice(&self.prev_block_hash);
        raw.extend_from_slice(&self.time.to_be_bytes());
        raw.extend_from_slice(self.target.as_bytes());
        raw.extend_from_slice(&self.nonce.to_be_bytes());
        raw.extend_from_slice(&(self.transactions.len() as u32).to_be_bytes());
        for tx in &self.transactions {
            raw.extend_from_slice(&tx.hash());
        }
        for tx in &self.transactions {
            let tx_raw = tx.raw();
            raw.extend_from_slice(&(tx_raw.len() as u32).to_be_bytes());
            raw.extend_from_slice(tx_raw);
        }
        raw
    }

    pub fn compute_hash(&self) -> Hash32 {
        *self.hash.get_or_init(|| {
            let raw = self.raw();
            if self.version == 1 {
                double_sha256(raw)
            } else {
                let end = (BLOCK_HEADER_LENGTH + 32 * self.transactions.len()).min(raw.len());
                double_sha256(&raw[..end])
            }
        })
    }

    pub fn hash(&self) -> Hash32 {
        self.claimed_hash.unwrap_or_else(|| self.compute_hash())
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash())
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let raw = self.raw();
        let mut wire = Vec::with_capacity(32 + raw.len());
        wire.extend_from_slice(&self.hash());
        wire.extend_from_slice(raw);
        wire
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Block> {
        if bytes.len() < 32 {
            return Err(Rejection::WrongData.into());
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[..32]);
        Self::from_raw(hash, &bytes[32..])
    }

    /// Re-materializes a stored or received block. The given hash is kept
    /// as-is, validation recomputes and compares it.
    pub fn from_raw(hash: Hash32, raw: &[u8]) -> Result<Block> {
        Self::decode(hash, raw).map_err(|e| match e {
            BlockchainError::Serialization(_) => BlockchainError::Consensus(Rejection::WrongData),
            other => other,
        })
    }

    fn decode(hash: Hash32, raw: &[u8]) -> Result<Block> {
        let mut reader = ByteReader::new(raw);
        let version = reader.read_u8()?;
        let prev_block_hash = reader.read_array::<32>()?;
        let time = reader.read_u64()?;
        let target = Target::from_bytes(reader.read_array::<32>()?);
        let nonce = reader.read_u64()?;
        let tx_count = reader.read_u32()? as usize;
        if tx_count == 0 {
            return Err(Rejection::WrongData.into());
        }
        let hash_list = reader.read_slice(tx_count.saturating_mul(32))?;

        let mut transactions = Vec::with_capacity(tx_count.min(4096));
        for tx_hash in hash_list.chunks_exact(32) {
            let size = reader.read_u32()? as usize;
            if size == 0 {
                return Err(Rejection::WrongData.into());
            }
            let mut claimed = [0u8; 32];
            claimed.copy_from_slice(tx_hash);
            transactions.push(Transaction::from_raw(Some(claimed), reader.read_slice(size)?)?);
        }
        if reader.remaining() != 0 {
            return Err(Rejection::WrongData.into());
        }

        let block = Block {
            version,
            prev_block_hash,
            time,
            target,
            nonce,
            transactions,
            claimed_hash: Some(hash),
            hash: OnceCell::new(),
            raw: OnceCell::new(),
        };
        let _ = block.raw.set(raw.to_vec());
        Ok(block)
    }

    /// Runs the block through every consensus check against the ledger as
    /// of block `ref_id` (`None` when the ledger is empty). The first failing
    /// check decides the rejection.
    pub fn validate_after(
        &self,
        ledger: &Ledger,
        ref_id: Option<u32>,
        ctx: &ValidationContext,
        allowable: usize,
    ) -> Result<()> {
        if self.transactions.is_empty() {
            return Err(Rejection::WrongData.into());
        }
        if self.raw().len() > MAX_BLOCK_SIZE {
            return Err(Rejection::TooBigBlock.into());
        }
        if self.version != 1 && self.version != 2 {
            return Err(Rejection::WrongVersion.into());
        }
        if self.compute_hash() != self.hash() {
            return Err(Rejection::WrongHash.into());
        }

        let previous = match ref_id {
            Some(id) => Some(
                ledger
                    .block_by_id(id, allowable)?
                    .ok_or(Rejection::WrongPrevBlock)?,
            ),
            None => None,
        };
        let expected_prev = previous.as_ref().map_or(INITIAL_PREV_BLOCK, |b| b.hash());
        if self.prev_block_hash != expected_prev {
            return Err(Rejection::WrongPrevBlock.into());
        }

        if self.time > ctx.now + MAX_FUTURE_DRIFT_SECS {
            return Err(Rejection::WrongTime.into());
        }
        if let Some(previous) = &previous {
            if self.time + MAX_PAST_DRIFT_SECS < previous.time {
                return Err(Rejection::WrongTime.into());
            }
        }

        let target = expected_target(ledger, previous.as_ref().zip(ref_id), allowable)?;
        if self.target != target {
            return Err(Rejection::WrongDiff.into());
        }
        if !self.target.is_met_by(&self.hash()) {
            return Err(Rejection::TooEasyHash.into());
        }

        if ctx.promiscuous {
            debug!("Skipping transaction checks for block {}", self.hash_hex());
            return Ok(());
        }
        let mut fees: u64 = 0;
        for (index, tx) in self.transactions.iter().enumerate().skip(1) {
            let fee = tx
                .validate_after(ledger, ref_id, TxRole::InBlock { block: self, index }, ctx, allowable)
                .map_err(|e| wrap_tx_rejection(e, index))?;
            fees = fees
                .checked_add(fee)
                .ok_or_else(|| BlockchainError::from(Rejection::WrongFee.in_tx(index)))?;
        }
        self.transactions[0]
            .validate_after(ledger, ref_id, TxRole::Coinbase { fees }, ctx, allowable)
            .map_err(|e| wrap_tx_rejection(e, 0))?;
        Ok(())
    }
}

/// Target the block after `previous` (block and its id) must declare. The
/// genesis block uses the easiest target.
pub fn expected_target(
    ledger: &Ledger,
    previous: Option<(&Block, u32)>,
    allowable: usize,
) -> Result<Target> {
    let Some((previous, id)) = previous else {
        return Ok(Target::EASIEST);
    };
    let next_id = id + 1;
    let in_window = if next_id % RETARGET_INTERVAL == 0 {
        ledger.count_blocks_in_time_window(
            previous.time.saturating_sub(RETARGET_WINDOW_SECS),
            previous.time,
            allowable,
        )?
    } else {
        0
    };
    Ok(next_target(next_id, &previous.target, in_window))
}

fn wrap_tx_rejection(err: BlockchainError, index: usize) -> BlockchainError {
    match err {
        BlockchainError::Consensus(rejection) => {
            BlockchainError::Consensus(rejection.in_tx(index))
        }
        other => other,
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash() && self.raw() == other.raw()
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash_hex())
            .field("version", &self.version)
            .field("prev", &HEXLOWER.encode(&self.prev_block_hash))
            .field("time", &self.time)
            .field("nonce", &self.nonce)
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn sample_block(version: u8) -> Block {
        let address = Address::from_public_key(&[5u8; 65]);
        let mut block = Block::with_version(version, INITIAL_PREV_BLOCK, 1_000, Target::EASIEST);
        block.add_transaction(Transaction::new_coinbase(1_000, address, 50).unwrap());
        block.add_transaction(Transaction::new_coinbase(1_001, address, 7).unwrap());
        block
    }

    #[test]
    fn test_raw_layout() {
        let block = sample_block(2);
        let raw = block.raw();
        assert_eq!(raw[0], 2);
        assert_eq!(&raw[1..33], &INITIAL_PREV_BLOCK);
        assert_eq!(&raw[33..41], &1_000u64.to_be_bytes());
        assert_eq!(&raw[41..73], Target::EASIEST.as_bytes());
        assert_eq!(&raw[81..85], &2u32.to_be_bytes());
        assert_eq!(&raw[85..117], &block.get_transactions()[0].hash());
        let first_len = block.get_transactions()[0].raw_len() as u32;
        assert_eq!(&raw[149..153], &first_len.to_be_bytes());
    }

    #[test]
    fn test_version_two_hashes_header_and_tx_list_only() {
        let block = sample_block(2);
        let header_end = BLOCK_HEADER_LENGTH + 32 * 2;
        assert_eq!(block.hash(), double_sha256(&block.raw()[..header_end]));

        let v1 = sample_block(1);
        assert_eq!(v1.hash(), double_sha256(v1.raw()));
    }

    #[test]
    fn test_setters_invalidate_hash() {
        let mut block = sample_block(2);
        let before = block.hash();
        block.set_nonce(1);
        assert_ne!(block.hash(), before);
        block.set_nonce(0);
        assert_eq!(block.hash(), before);
        block.set_time(1_001);
        assert_ne!(block.hash(), before);
    }

    #[test]
    fn test_wire_roundtrip() {
        for version in [1, 2] {
            let block = sample_block(version);
            let restored = Block::from_wire(&block.to_wire()).unwrap();
            assert_eq!(restored, block);
            assert_eq!(restored.compute_hash(), block.hash());
            assert_eq!(restored.get_time(), 1_000);
            assert_eq!(restored.get_target(), &Target::EASIEST);
            assert_eq!(restored.get_transactions().len(), 2);
            assert_eq!(restored.raw(), block.raw());
        }
    }

    #[test]
    fn test_roundtrip_with_signed_transaction() {
        let wallet = Wallet::new().unwrap();
        let mut block = sample_block(2);
        let mut tx = Transaction::new(1_002);
        tx.add_output(wallet.get_address(), 10).unwrap();
        tx.add_input([4u8; 32], 1, &wallet).unwrap();
        block.add_transaction(tx.clone());
        let restored = Block::from_raw(block.hash(), block.raw()).unwrap();
        assert_eq!(restored.get_transactions()[2], tx);
    }

    #[test]
    fn test_malformed_blocks_are_wrong_data() {
        let block = sample_block(2);
        let raw = block.raw();
        for bad in [&raw[..50], &raw[..raw.len() - 1]] {
            assert!(matches!(
                Block::from_raw([0u8; 32], bad),
                Err(BlockchainError::Consensus(Rejection::WrongData))
            ));
        }
        let mut empty = raw[..BLOCK_HEADER_LENGTH].to_vec();
        empty[81..85].copy_from_slice(&0u32.to_be_bytes());
        assert!(Block::from_raw([0u8; 32], &empty).is_err());
    }

    #[test]
    fn test_first_transaction_and_miner() {
        let miner = Address::from_public_key(&[8u8; 65]);
        let mut block = sample_block(2);
        block.add_first_transaction(Transaction::new_coinbase(999, miner, 1).unwrap());
        assert_eq!(block.miner_address(), Some(miner));
        assert!(Block::new(INITIAL_PREV_BLOCK, 0, Target::EASIEST)
            .miner_address()
            .is_none());
    }
}
