//! planb-node - run a Plan B storage node, or hand it a part
//!
//! Usage:
//!   planb-node <config.json>
//!   planb-node <config.json> --stage <part-dir> [--owner <id>]
//!   planb-node <config.json> --get <map> <key>
//!   planb-node <config.json> --info <map>

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use planb::maintenance;
use planb::receive::ReceiveDir;
use planb::transfer::now_ms;
use planb::{
    FileDbFactory, FileDescriptor, MergeProcessor, PlanBConfig, SharedConfig, ShardManager,
    StagingFileStore, StatePaths,
};

fn print_usage() {
    println!("planb-node {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: planb-node <config.json> [command]");
    println!();
    println!("Commands:");
    println!("  (none)                           Run the node until SIGINT/SIGTERM (SIGHUP reloads config)");
    println!("  --stage <part-dir> [--owner <id>]  Hand a part to the node's receive directory");
    println!("  --get <map> <key>                Print the current value of a key");
    println!("  --info <map>                     Print shard information as JSON");
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("planb-node {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    if args.len() < 2 || args[1].starts_with("--") {
        eprintln!("Error: the first argument must be the config file");
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let config = PlanBConfig::read_from(&config_path)
        .with_context(|| format!("reading config {}", config_path.display()))?;

    if let Some(part) = arg_after(&args, "--stage") {
        let owner = match arg_after(&args, "--owner") {
            Some(id) => id.parse::<i64>().with_context(|| format!("bad owner id '{}'", id))?,
            None => 0,
        };
        return stage(&config, Path::new(part), owner);
    }
    if let Some(map) = arg_after(&args, "--get") {
        let Some(key) = args.iter().position(|a| a == "--get").and_then(|i| args.get(i + 2)) else {
            bail!("--get needs <map> <key>");
        };
        let manager = open_manager(&config)?;
        match manager.get(map, key.as_bytes(), now_ms())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(none)"),
        }
        manager.shutdown();
        return Ok(());
    }
    if let Some(map) = arg_after(&args, "--info") {
        let manager = open_manager(&config)?;
        println!("{}", manager.get_info(map)?);
        manager.shutdown();
        return Ok(());
    }

    run(&config_path, config)
}

fn stage(config: &PlanBConfig, part: &Path, owner: i64) -> anyhow::Result<()> {
    let descriptor = FileDescriptor::for_path(now_ms(), owner, part)
        .with_context(|| format!("hashing {}", part.display()))?;
    let receive_dir = StatePaths::new(&config.path).receive_dir();
    let dest = ReceiveDir::drop_off(&receive_dir, &descriptor, part)?;
    println!("{}", dest.display());
    Ok(())
}

fn open_manager(config: &PlanBConfig) -> anyhow::Result<ShardManager> {
    if !config.is_storage_node() {
        bail!(
            "node '{}' is not a storage node; reader nodes need a transfer client and run embedded",
            config.this_node
        );
    }
    let paths = StatePaths::new(&config.path);
    paths.ensure_dirs()?;
    Ok(ShardManager::new(
        config.clone().fixed(),
        paths,
        None,
        Arc::new(FileDbFactory),
    ))
}

fn run(config_path: &Path, config: PlanBConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), node = %config.this_node, path = %config.path.display(), "starting planb-node");
    if !config.is_storage_node() {
        bail!(
            "node '{}' is not a storage node; reader nodes need a transfer client and run embedded",
            config.this_node
        );
    }

    let shared = SharedConfig::new(config);
    let provider = shared.provider();
    let paths = StatePaths::new(&shared.current().path);
    paths.ensure_dirs()?;

    let manager = Arc::new(ShardManager::new(
        Arc::clone(&provider),
        paths.clone(),
        None,
        Arc::new(FileDbFactory),
    ));
    let loaded = manager.load_existing()?;
    info!(shards = loaded, "loaded existing shards");

    let staging = Arc::new(StagingFileStore::open(&paths.staging_dir())?);
    let receive = Arc::new(ReceiveDir::open(&paths.receive_dir(), Arc::clone(&staging))?);
    let merger = Arc::new(MergeProcessor::new(
        Arc::clone(&provider),
        staging,
        Arc::clone(&manager),
    ))
    .start()?;
    let receiver = receive.start(Arc::clone(&provider))?;
    let maintainer = maintenance::start(Arc::clone(&provider), Arc::clone(&manager))?;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP]).context("registering signal handlers")?;
    for signal in signals.forever() {
        if signal == SIGHUP {
            match PlanBConfig::read_from(config_path) {
                Ok(next) => {
                    shared.update(next);
                    info!("config reloaded");
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping current config"),
            }
            continue;
        }
        info!(signal, "shutting down");
        break;
    }

    receiver.stop();
    merger.stop();
    maintainer.stop();
    manager.shutdown();
    info!("stopped");
    Ok(())
}
