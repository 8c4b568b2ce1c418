//! Aphelion node binary.
//!
//! Runs the event-processing core with persistent storage and the
//! streaming-sync seeder, plus the operational side doors.
//!
//! Usage:
//!   aphelion node                     # run a node (default)
//!   aphelion checkconfig              # validate the network rules
//!   aphelion fixdirty                 # try to fix a dirty DB
//!   aphelion export <file> [--from N --to M]
//!   aphelion import <file>

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use aphelion::config::Rules;
use aphelion::engine::NullEngine;
use aphelion::genesis::{apply_genesis, fake_genesis, FakeBlockProc};
use aphelion::processor::{NullEmitter, Processor};
use aphelion::recovery;
use aphelion::store::{Store, StoreConfig, StoreError};
use aphelion::stream::seeder::{Seeder, SeederConfig};

/// Aphelion DAG-chain node.
#[derive(Parser, Debug)]
#[command(name = "aphelion", version, about = "Aphelion leaderless aBFT DAG node")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, default_value = "./aphelion-data", global = true)]
    data_dir: PathBuf,

    /// Use fakenet rules (local development network).
    #[arg(long, global = true)]
    fakenet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (default).
    Node,
    /// Validate the configured network rules.
    Checkconfig,
    /// Try to fix a dirty DB by reverting to the last closed epoch.
    Fixdirty,
    /// Export stored events to a file (`.zst` compresses).
    Export {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        from: u32,
        #[arg(long, default_value_t = u32::MAX)]
        to: u32,
    },
    /// Import events from a file (`.zst` decompresses).
    Import { file: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let rules = if cli.fakenet {
        Rules::fakenet()
    } else {
        Rules::mainnet()
    };

    let result = match cli.command.unwrap_or(Command::Node) {
        Command::Node => run_node(&cli.data_dir, rules),
        Command::Checkconfig => check_config(&rules),
        Command::Fixdirty => fix_dirty(&cli.data_dir),
        Command::Export { file, from, to } => export(&cli.data_dir, &file, from, to),
        Command::Import { file } => import(&cli.data_dir, &file, rules),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn open_store(data_dir: &PathBuf) -> Result<Store, StoreError> {
    Store::open(&data_dir.join(recovery::GOSSIP_DB), StoreConfig::default())
}

fn make_processor(data_dir: &PathBuf, rules: Rules) -> Result<Processor, Box<dyn std::error::Error>> {
    let store = open_store(data_dir)?;
    if store.is_dirty()? {
        return Err("dirty database detected, run `aphelion fixdirty`".into());
    }
    if store.get_genesis_atropos()?.is_none() {
        if rules.network_id != aphelion::config::FAKE_NETWORK_ID {
            return Err("store is empty and no genesis was supplied".into());
        }
        let (genesis, _) = fake_genesis(3, rules.clone());
        let (atropos, _) = apply_genesis(&store, &genesis, &mut FakeBlockProc::new())?;
        tracing::info!(atropos = %atropos, "Applied fakenet genesis");
    }
    Ok(Processor::new(
        Arc::new(store),
        Box::new(NullEngine),
        rules,
        Arc::new(NullEmitter),
    )?)
}

fn run_node(data_dir: &PathBuf, rules: Rules) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let processor = make_processor(data_dir, rules)?;
        tracing::info!(
            epoch = processor.current_epoch(),
            data = %data_dir.display(),
            "Starting Aphelion node"
        );

        let seeder = Seeder::start(SeederConfig::default(), processor.store().clone());

        tokio::signal::ctrl_c().await?;
        tracing::info!("Ctrl-C received, shutting down");
        processor.stop();
        seeder.stop().await;
        processor.store().commit()?;
        Ok(())
    })
}

fn check_config(rules: &Rules) -> Result<(), Box<dyn std::error::Error>> {
    rules.validate()?;
    tracing::info!(network = %rules.name, "Configuration is valid");
    Ok(())
}

fn fix_dirty(data_dir: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    // the EVM collaborator is wired at the launcher level; a standalone
    // core assumes the state trie is present and lets it re-verify later
    let epoch = recovery::fix_dirty(data_dir, &|_| true)?;
    tracing::info!(epoch, "Fixing done");
    Ok(())
}

fn export(
    data_dir: &PathBuf,
    file: &PathBuf,
    from: u32,
    to: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(data_dir)?;
    let written = aphelion::export::export_events_to_path(&store, file, from, to)?;
    tracing::info!(events = written, file = %file.display(), "Export done");
    Ok(())
}

fn import(
    data_dir: &PathBuf,
    file: &PathBuf,
    rules: Rules,
) -> Result<(), Box<dyn std::error::Error>> {
    let processor = make_processor(data_dir, rules)?;
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    ctrlc_handler(move || signal_cancel.cancel());
    let stats = aphelion::export::import_events_from_path(&processor, file, &cancel)?;
    processor.store().commit()?;
    tracing::info!(
        imported = stats.imported,
        skipped = stats.skipped,
        "Import done"
    );
    Ok(())
}

/// Install a SIGINT hook without pulling in a runtime: a small thread
/// parked on the tokio signal future.
fn ctrlc_handler(on_signal: impl FnOnce() + Send + 'static) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
        {
            Ok(runtime) => runtime,
            Err(_) => return,
        };
        let _ = runtime.block_on(tokio::signal::ctrl_c());
        on_signal();
    });
}
