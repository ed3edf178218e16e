use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DATA_DIR_KEY: &str = "LEDGER_DATA_DIR";
const NODE_ID_KEY: &str = "NODE_ID";

static DEFAULT_DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    data_dir: PathBuf,
    /// Skip transaction checks until the first sync completes
    promiscuous_initial_sync: bool,
    sync_interval_secs: u64,
    stall_timeout_secs: u64,
    shutdown_timeout_secs: u64,
    blocks_per_request: usize,
    max_blocks_packet_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            promiscuous_initial_sync: true,
            sync_interval_secs: 10,
            stall_timeout_secs: 120,
            shutdown_timeout_secs: 10,
            blocks_per_request: 64,
            max_blocks_packet_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Reads `path` if given, then applies environment overrides.
    /// `LEDGER_DATA_DIR` wins over `NODE_ID`, which selects `data/node_<id>`.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml(&text)?
            }
            None => Config::default(),
        };
        if let Ok(node_id) = env::var(NODE_ID_KEY) {
            config.data_dir = PathBuf::from(DEFAULT_DATA_DIR).join(format!("node_{node_id}"));
        }
        if let Ok(dir) = env::var(DATA_DIR_KEY) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        if config.blocks_per_request == 0 {
            return Err(BlockchainError::Config(
                "blocks_per_request must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Config {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_promiscuous_initial_sync(mut self, enabled: bool) -> Config {
        self.promiscuous_initial_sync = enabled;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Config {
        self.sync_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn get_data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Where the sled secondary index lives
    pub fn get_index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn is_promiscuous_initial_sync(&self) -> bool {
        self.promiscuous_initial_sync
    }

    pub fn get_sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn get_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn get_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn get_blocks_per_request(&self) -> usize {
        self.blocks_per_request
    }

    pub fn get_max_blocks_packet_bytes(&self) -> usize {
        self.max_blocks_packet_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.get_data_dir(), Path::new("data"));
        assert_eq!(config.get_sync_interval(), Duration::from_secs(10));
        assert_eq!(config.get_stall_timeout(), Duration::from_secs(120));
        assert_eq!(config.get_blocks_per_request(), 64);
        assert!(config.is_promiscuous_initial_sync());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml("data_dir = \"/tmp/ledger\"\nsync_interval_secs = 3\n").unwrap();
        assert_eq!(config.get_data_dir(), Path::new("/tmp/ledger"));
        assert_eq!(config.get_sync_interval(), Duration::from_secs(3));
        assert_eq!(config.get_shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.get_index_dir(), Path::new("/tmp/ledger/index"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml("blocks_per_request = 0").is_err());
        assert!(Config::from_toml("sync_interval_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "promiscuous_initial_sync = false\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.is_promiscuous_initial_sync());
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
