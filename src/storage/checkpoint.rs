//! Alternating checkpoint slots.
//!
//! A checkpoint is a plain copy of the index, data and cache files into
//! `checkpoints/1` or `checkpoints/2`. The zero-byte `ready` marker is
//! written last and removed first, so a slot without it is never restored.

use crate::error::{BlockchainError, Result};
use crate::storage::caches::{read_or_empty, CACHE_FILES};
use crate::storage::ledger::{DATA_FILE, INDEX_FILE};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const READY_MARKER: &str = "ready";
pub const SLOTS: [u8; 2] = [1, 2];

pub fn slot_dir(data_dir: &Path, slot: u8) -> PathBuf {
    data_dir.join(CHECKPOINTS_DIR).join(slot.to_string())
}

pub fn is_ready(data_dir: &Path, slot: u8) -> bool {
    slot_dir(data_dir, slot).join(READY_MARKER).is_file()
}

/// Slot the next checkpoint goes to: never the one written last
pub fn next_slot(last: Option<u8>) -> u8 {
    match last {
        Some(1) => 2,
        _ => 1,
    }
}

/// Ready slots, most recent first
pub fn restorable_slots(data_dir: &Path, last: Option<u8>) -> Vec<u8> {
    let preferred = last.unwrap_or(1);
    let mut order = vec![preferred, next_slot(Some(preferred))];
    order.retain(|slot| is_ready(data_dir, *slot));
    order
}

fn ledger_files() -> impl Iterator<Item = &'static str> {
    [INDEX_FILE, DATA_FILE].into_iter().chain(CACHE_FILES)
}

/// Copies the ledger files into `slot` and marks it ready.
pub fn write_slot(data_dir: &Path, slot: u8) -> Result<PathBuf> {
    let dir = slot_dir(data_dir, slot);
    fs::create_dir_all(&dir)?;
    let marker = dir.join(READY_MARKER);
    if marker.exists() {
        fs::remove_file(&marker)?;
    }
    for name in ledger_files() {
        fs::write(dir.join(name), read_or_empty(&data_dir.join(name))?)?;
    }
    fs::write(&marker, b"")?;
    info!(target: "ledger", "Checkpoint written to {}", dir.display());
    Ok(dir)
}

/// Copies the files of a ready `slot` back over the ledger files.
pub fn restore_slot(data_dir: &Path, slot: u8) -> Result<PathBuf> {
    let dir = slot_dir(data_dir, slot);
    if !is_ready(data_dir, slot) {
        return Err(BlockchainError::Io(format!(
            "checkpoint slot {} is not ready",
            dir.display()
        )));
    }
    for name in ledger_files() {
        let bytes = read_or_empty(&dir.join(name))?;
        fs::write(data_dir.join(name), bytes)?;
    }
    info!(target: "ledger", "Checkpoint restored from {}", dir.display());
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_slots_alternate() {
        assert_eq!(next_slot(None), 1);
        assert_eq!(next_slot(Some(1)), 2);
        assert_eq!(next_slot(Some(2)), 1);
    }

    #[test]
    fn test_write_and_restore_slot() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), [1u8; 40]).unwrap();
        fs::write(dir.path().join(DATA_FILE), b"block").unwrap();

        assert!(restorable_slots(dir.path(), None).is_empty());
        write_slot(dir.path(), 1).unwrap();
        assert!(is_ready(dir.path(), 1));
        assert_eq!(restorable_slots(dir.path(), Some(1)), vec![1]);

        fs::write(dir.path().join(DATA_FILE), b"changed").unwrap();
        restore_slot(dir.path(), 1).unwrap();
        assert_eq!(fs::read(dir.path().join(DATA_FILE)).unwrap(), b"block");
    }

    #[test]
    fn test_slot_without_marker_is_not_restored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(slot_dir(dir.path(), 2)).unwrap();
        assert!(restore_slot(dir.path(), 2).is_err());
    }
}
