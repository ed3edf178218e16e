//! Data storage and persistence
//!
//! The ledger's block files, the derived caches rebuilt from them,
//! checkpoints, and the sled-backed secondary transaction index.

pub mod caches;
pub mod checkpoint;
pub mod ledger;
pub mod meta;
pub mod output_index;
pub mod record_store;
pub mod records;

pub use caches::Caches;
pub use ledger::{
    BlocksAfter, CacheChanges, CacheSnapshot, Ledger, LedgerObserver, LedgerRange, DATA_FILE,
    FREE_TX_TTL_SECS, INDEX_FILE,
};
pub use meta::LedgerMeta;
pub use output_index::{SledTransactionIndex, TransactionIndex, UnspentOutput};
pub use record_store::{
    FixedRecord, FixedRecordStore, ScalableRecord, ScalableRecordStore, SortedRecord,
    SortedRecordStore,
};
