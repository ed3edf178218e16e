use crate::error::Result;
use crate::storage::caches::{read_or_empty, write_file};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const META_FILE: &str = "ledger.json";

/// Bookkeeping kept next to the ledger files in `ledger.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    /// False while a cache rewrite is in progress
    pub caches_clean: bool,
    /// Ledger length the cache files describe
    pub cached_length: u32,
    /// Checkpoint slot written most recently
    pub last_checkpoint: Option<u8>,
}

impl LedgerMeta {
    /// A missing or unreadable file yields a dirty default, which forces a
    /// cache rebuild.
    pub fn load(dir: &Path) -> Result<LedgerMeta> {
        let bytes = read_or_empty(&dir.join(META_FILE))?;
        if bytes.is_empty() {
            return Ok(LedgerMeta::default());
        }
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Ok(meta),
            Err(e) => {
                log::warn!(target: "ledger", "Ignoring unreadable {META_FILE}: {e}");
                Ok(LedgerMeta::default())
            }
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_file(&dir.join(META_FILE), &json)
    }

    /// Caches can be trusted for a ledger of `length` blocks
    pub fn caches_match(&self, length: u32) -> bool {
        self.caches_clean && self.cached_length == length
    }
}
