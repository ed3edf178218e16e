//! Record types of the ledger index and its derived caches.
//!
//! All integers are big-endian. The widths below are the exact on-disk
//! widths of `blockchain.ind` and the `*.cache` files.

use crate::core::Hash32;
use crate::error::{BlockchainError, Result};
use crate::storage::record_store::{FixedRecord, ScalableRecord, SortedRecord};
use crate::utils::ByteReader;
use crate::wallet::{Address, ADDRESS_LEN};

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn hash32(bytes: &[u8]) -> Hash32 {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[..32]);
    hash
}

/// One entry of `blockchain.ind`: block hash and its offset in `blockchain.dat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub hash: Hash32,
    pub offset: u64,
}

impl FixedRecord for IndexRecord {
    const SIZE: usize = 40;

    fn write_to(&self, out: &mut [u8]) {
        out[..32].copy_from_slice(&self.hash);
        out[32..40].copy_from_slice(&self.offset.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        IndexRecord {
            hash: hash32(bytes),
            offset: be_u64(&bytes[32..]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTime {
    pub id: u32,
    pub time: u64,
}

impl FixedRecord for BlockTime {
    const SIZE: usize = 12;

    fn write_to(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.id.to_be_bytes());
        out[4..12].copy_from_slice(&self.time.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        BlockTime {
            id: be_u32(bytes),
            time: be_u64(&bytes[4..]),
        }
    }
}

/// Number of blocks whose coinbase paid `address`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinerCoins {
    pub address: Address,
    pub count: u32,
}

impl FixedRecord for MinerCoins {
    const SIZE: usize = ADDRESS_LEN + 4;

    fn write_to(&self, out: &mut [u8]) {
        out[..ADDRESS_LEN].copy_from_slice(self.address.as_bytes());
        out[ADDRESS_LEN..Self::SIZE].copy_from_slice(&self.count.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut address = [0u8; ADDRESS_LEN];
        address.copy_from_slice(&bytes[..ADDRESS_LEN]);
        MinerCoins {
            address: Address::from_bytes(address),
            count: be_u32(&bytes[ADDRESS_LEN..]),
        }
    }
}

/// Recently appended block, consulted before scanning the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentHash {
    pub hash: Hash32,
    pub id: u32,
}

impl FixedRecord for RecentHash {
    const SIZE: usize = 36;

    fn write_to(&self, out: &mut [u8]) {
        out[..32].copy_from_slice(&self.hash);
        out[32..36].copy_from_slice(&self.id.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        RecentHash {
            hash: hash32(bytes),
            id: be_u32(&bytes[32..]),
        }
    }
}

/// Output `out_n` of `tx_hash` was spent by a transaction in block `spent_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpentOutput {
    pub tx_hash: Hash32,
    pub out_n: u32,
    pub spent_at: u32,
}

impl FixedRecord for SpentOutput {
    const SIZE: usize = 40;

    fn write_to(&self, out: &mut [u8]) {
        out[..32].copy_from_slice(&self.tx_hash);
        out[32..36].copy_from_slice(&self.out_n.to_be_bytes());
        out[36..40].copy_from_slice(&self.spent_at.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        SpentOutput {
            tx_hash: hash32(bytes),
            out_n: be_u32(&bytes[32..]),
            spent_at: be_u32(&bytes[36..]),
        }
    }
}

impl SortedRecord for SpentOutput {
    type Key = Hash32;

    fn key(&self) -> Hash32 {
        self.tx_hash
    }
}

/// Transaction `tx_hash` is confirmed in block `block_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub tx_hash: Hash32,
    pub block_id: u32,
}

impl FixedRecord for TxLocation {
    const SIZE: usize = 36;

    fn write_to(&self, out: &mut [u8]) {
        out[..32].copy_from_slice(&self.tx_hash);
        out[32..36].copy_from_slice(&self.block_id.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        TxLocation {
            tx_hash: hash32(bytes),
            block_id: be_u32(&bytes[32..]),
        }
    }
}

impl SortedRecord for TxLocation {
    type Key = Hash32;

    fn key(&self) -> Hash32 {
        self.tx_hash
    }
}

/// Unconfirmed transaction in the free pool with its local arrival time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeTx {
    pub hash: Hash32,
    pub added: u64,
    pub raw: Vec<u8>,
}

impl ScalableRecord for FreeTx {
    fn encoded_len(&self) -> usize {
        32 + 8 + 4 + self.raw.len()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.added.to_be_bytes());
        out.extend_from_slice(&(self.raw.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.raw);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let hash = reader.read_array::<32>()?;
        let added = reader.read_u64()?;
        let len = reader.read_u32()? as usize;
        let raw = reader.read_slice(len)?.to_vec();
        if reader.remaining() != 0 {
            return Err(BlockchainError::CacheCorrupted(
                "trailing bytes in free transaction record".to_string(),
            ));
        }
        Ok(FreeTx { hash, added, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record_store::{FixedRecordStore, ScalableRecordStore, SortedRecordStore};

    #[test]
    fn test_index_record_layout() {
        let record = IndexRecord {
            hash: [7u8; 32],
            offset: 0x0102_0304_0506_0708,
        };
        let mut raw = [0u8; 40];
        record.write_to(&mut raw);
        assert_eq!(&raw[32..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(IndexRecord::read_from(&raw), record);
    }

    #[test]
    fn test_miner_coins_width() {
        let record = MinerCoins {
            address: Address::from_public_key(&[3u8; 65]),
            count: 9,
        };
        let mut store = FixedRecordStore::new();
        store.push(&record);
        assert_eq!(store.as_bytes().len(), 29);
        assert_eq!(store.get(0), Some(record));
    }

    #[test]
    fn test_spent_outputs_group_by_hash() {
        let mut store = SortedRecordStore::new();
        for (hash, out_n, spent_at) in [(5u8, 0, 1), (2, 1, 2), (5, 1, 3), (9, 0, 3)] {
            store.insert(&SpentOutput {
                tx_hash: [hash; 32],
                out_n,
                spent_at,
            });
        }
        let spent: Vec<_> = store.all_equal_to(&[5u8; 32]);
        assert_eq!(spent.len(), 2);
        assert_eq!(spent[0].spent_at, 1);
        assert_eq!(spent[1].spent_at, 3);
        assert_eq!(store.get(0).map(|r| r.tx_hash), Some([2u8; 32]));
    }

    #[test]
    fn test_free_tx_store_roundtrip() {
        let mut store = ScalableRecordStore::new();
        store
            .push(&FreeTx {
                hash: [1u8; 32],
                added: 42,
                raw: vec![],
            })
            .unwrap();
        store
            .push(&FreeTx {
                hash: [2u8; 32],
                added: 43,
                raw: vec![0xAB; 300],
            })
            .unwrap();
        let restored: ScalableRecordStore<FreeTx> =
            ScalableRecordStore::from_bytes(store.as_bytes()).unwrap();
        assert_eq!(restored.as_bytes(), store.as_bytes());
        assert_eq!(restored.get(1).map(|tx| tx.raw.len()), Some(300));
    }
}
