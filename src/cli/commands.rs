use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "architect-ledger")]
pub struct Opt {
    #[arg(long = "config", global = true, help = "TOML configuration file")]
    pub config: Option<PathBuf>,
    #[arg(
        long = "data-dir",
        global = true,
        help = "Ledger directory, overrides the configuration"
    )]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "info", about = "Print ledger length, tip and cache state")]
    Info,
    #[command(name = "printchain", about = "Print blocks of the ledger")]
    Printchain {
        #[arg(long = "from", default_value_t = 0, help = "First block id")]
        from: u32,
        #[arg(long = "count", help = "Number of blocks to print")]
        count: Option<u32>,
    },
    #[command(
        name = "getbalance",
        about = "Get the confirmed balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The address")]
        address: String,
    },
    #[command(name = "reindex", about = "Rebuild caches and the transaction index")]
    Reindex,
    #[command(name = "verify", about = "Check block links and derived caches")]
    Verify,
    #[command(name = "savecheckpoint", about = "Snapshot the ledger files")]
    SaveCheckpoint,
    #[command(name = "loadcheckpoint", about = "Restore the latest checkpoint")]
    LoadCheckpoint,
    #[command(name = "newaddress", about = "Generate a key and print its address")]
    NewAddress,
    #[command(name = "sync", about = "Catch up from ledgers in other directories")]
    Sync {
        #[arg(long = "peer", required = true, help = "Data directory of a peer ledger")]
        peers: Vec<PathBuf>,
    },
    #[command(name = "mine", about = "Mine blocks on top of the tip")]
    Mine {
        #[arg(long = "address", help = "Address receiving the reward")]
        address: String,
        #[arg(long = "count", default_value_t = 1, help = "Number of blocks")]
        count: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_printchain_range() {
        let opt = Opt::parse_from(["architect-ledger", "printchain", "--from", "3", "--count", "2"]);
        match opt.command {
            Command::Printchain { from, count } => {
                assert_eq!(from, 3);
                assert_eq!(count, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_data_dir_and_peers() {
        let opt = Opt::parse_from([
            "architect-ledger",
            "sync",
            "--peer",
            "/a",
            "--peer",
            "/b",
            "--data-dir",
            "/tmp/node",
        ]);
        assert_eq!(opt.data_dir, Some(PathBuf::from("/tmp/node")));
        match opt.command {
            Command::Sync { peers } => assert_eq!(peers.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Opt::try_parse_from(["architect-ledger", "sync"]).is_err());
    }
}
