// Entry point for the ledger node CLI.
// Every command opens the node on the configured data directory, does its
// work and shuts the node down so caches are flushed before exit.
use architect_ledger::core::monetary::conversions::format_satoshis;
use architect_ledger::core::{LockCoordinator, ProofOfWork};
use architect_ledger::storage::Ledger;
use architect_ledger::utils::current_unix_time;
use architect_ledger::{
    Address, BlockchainError, Command, Config, LoopbackNetwork, Node, Opt, Result, SubmitOutcome,
    Wallet,
};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::process;
use std::sync::Arc;

fn main() {
    // Info level by default, RUST_LOG still refines it per target
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    if let Err(e) = run(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    // newaddress never touches the ledger
    if let Command::NewAddress = opt.command {
        let wallet = Wallet::new()?;
        println!("Your new address: {}", wallet.get_address());
        return Ok(());
    }

    let mut config = Config::load(opt.config.as_deref())?;
    if let Some(dir) = opt.data_dir {
        config = config.with_data_dir(dir);
    }
    let network = Arc::new(LoopbackNetwork::new(config.get_max_blocks_packet_bytes()));
    let node = Node::open(config, network.clone())?;
    let outcome = run_command(&node, &network, opt.command);
    let closed = node.shutdown();
    outcome.and(closed)
}

fn run_command(node: &Node, network: &LoopbackNetwork, command: Command) -> Result<()> {
    let ledger = node.get_ledger();
    match command {
        Command::Info => {
            println!("Data directory: {}", ledger.data_dir().display());
            println!("Blocks: {}", ledger.length());
            println!("Data size: {} bytes", ledger.data_size());
            if let Some((id, tip)) = ledger.tip(0)? {
                println!("Tip: #{id} {}", tip.hash_hex());
                println!("Tip time: {}", tip.get_time());
                println!("Target: {}", tip.get_target());
            }
            println!("Free transactions: {}", ledger.free_transactions(0)?.len());
            println!("Indexed transactions: {}", node.get_index().count_transactions());
        }
        Command::Printchain { from, count } => {
            let to = match count {
                Some(count) => from.saturating_add(count).min(ledger.length()),
                None => ledger.length(),
            };
            for item in ledger.iter_range(from, to, 0)? {
                let (id, block) = item?;
                println!("Block #{id} {}", block.hash_hex());
                println!("  prev: {}", data_encoding::HEXLOWER.encode(block.get_prev_block_hash()));
                println!("  version: {}, time: {}, nonce: {}", block.get_version(), block.get_time(), block.get_nonce());
                println!("  target: {}", block.get_target());
                for tx in block.get_transactions() {
                    println!("  tx {}", tx.hash_hex());
                    for input in tx.get_inputs() {
                        println!(
                            "    in  {}:{}",
                            data_encoding::HEXLOWER.encode(&input.ref_tx_hash),
                            input.ref_out
                        );
                    }
                    for output in tx.get_outputs() {
                        println!("    out {} {}", output.address, output.value);
                    }
                }
                println!();
            }
        }
        Command::GetBalance { address } => {
            let parsed: Address = address.parse()?;
            let balance = node.get_index().balance(&parsed)?;
            println!("Balance of {address}: {balance} ({})", format_satoshis(balance));
        }
        Command::Reindex => {
            ledger.rebuild_caches(0)?;
            println!(
                "Reindexed {} blocks, {} transactions",
                ledger.length(),
                node.get_index().count_transactions()
            );
        }
        Command::Verify => {
            match ledger.verify_chain(0)? {
                Some(id) => println!("Chain is broken at block #{id}"),
                None => println!("Chain links are intact"),
            }
            println!("Caches match block files: {}", ledger.verify_caches(0)?);
            println!("Time cache is consistent: {}", ledger.verify_time_cache(0)?);
        }
        Command::SaveCheckpoint => {
            let path = ledger.save_checkpoint(0)?;
            println!("Saved checkpoint {}", path.display());
        }
        Command::LoadCheckpoint => match ledger.load_checkpoint(0)? {
            Some(path) => println!("Loaded checkpoint {} with {} blocks", path.display(), ledger.length()),
            None => println!("No checkpoint to load"),
        },
        Command::NewAddress => {}
        Command::Sync { peers } => {
            for dir in peers {
                let peer = Ledger::open(&dir, LockCoordinator::standalone("peer"), vec![])?;
                info!(target: "node", "Peer {} has {} blocks", dir.display(), peer.length());
                network.add_peer(Arc::new(peer));
            }
            node.get_synchronizer().sync()?;
            println!("Ledger has {} blocks", ledger.length());
        }
        Command::Mine { address, count } => {
            let miner: Address = address.parse()?;
            let stop = node.get_context().get_terminated();
            for _ in 0..count {
                let tip_id = ledger.length().checked_sub(1);
                let candidates = ledger.free_transactions(0)?;
                let template = ProofOfWork::block_template(
                    ledger,
                    tip_id,
                    &miner,
                    current_unix_time()?,
                    candidates,
                    0,
                )?;
                let block = ProofOfWork::new_proof_of_work(template)
                    .run(stop)
                    .ok_or(BlockchainError::Terminated)?;
                match node.get_processor().submit(block.hash(), block.raw(), "local")? {
                    SubmitOutcome::Accepted { id } => println!("Mined block #{id} {}", block.hash_hex()),
                    other => println!("Mined block {} was not accepted: {other:?}", block.hash_hex()),
                }
            }
        }
    }
    Ok(())
}
