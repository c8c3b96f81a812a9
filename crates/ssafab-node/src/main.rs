//! ssafabd: the subnet administration distribution daemon.
//!
//! Brings up a core (or combined core+access) node: acquires the
//! single-instance lock, loads configuration, starts the engine, and
//! runs until SIGINT/SIGTERM. Exit codes: 0 on normal shutdown, 1 on
//! configuration or initialization failure (including lock-file
//! contention).

mod lockfile;
mod provider;

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use ssafab_config::FabricConfig;
use ssafab_core::{Node, PortDesc};
use ssafab_db::HalfWorldComputer;
use ssafab_mad::LoopbackFabric;
use ssafab_types::{Gid, Lid, NodeType};
use tracing::{error, info, warn};

use crate::lockfile::LockFile;
use crate::provider::AddrFileProvider;

#[derive(Parser, Debug)]
#[command(name = "ssafabd", about = "Subnet administration distribution daemon")]
struct Args {
    /// Configuration file (TOML).
    #[arg(long, default_value = "/etc/rdma/ssafab.toml")]
    config: PathBuf,

    /// Legacy flat `key value` option file, used instead of --config.
    #[arg(long)]
    legacy_config: Option<PathBuf>,

    /// Local port GID (IPv6 notation).
    #[arg(long, default_value = "::ffff:127.0.0.1")]
    gid: Ipv6Addr,

    /// Local port LID.
    #[arg(long, default_value_t = 1)]
    lid: u16,

    /// Log to stderr instead of the configured log file.
    #[arg(long)]
    stderr: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Startup failures also go to stderr: logging may not be
            // up yet.
            eprintln!("ssafabd: {e:#}");
            error!(error = %format!("{e:#}"), "startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.legacy_config {
        Some(path) => FabricConfig::load_legacy(path)?,
        None => FabricConfig::load(&args.config)?,
    };
    init_logging(&config, args.stderr)?;
    info!(config = %args.config.display(), "ssafab daemon starting");
    log_options(&config);

    let _lock = LockFile::acquire(&config.node.lock_file)?;

    let node_type = config.node.parsed_node_type()?;
    let config = Arc::new(config);

    // Discovery and MAD I/O live outside this workspace; the daemon
    // runs the in-process fabric and the address-preload extractor.
    let fabric = LoopbackFabric::new();
    let gid = Gid::from_ipv6(args.gid);
    let lid = Lid::new(args.lid);
    let port = PortDesc {
        gid,
        lid,
        sm_lid: lid,
        sm_sl: 0,
    };
    let mad: Arc<dyn ssafab_mad::MadPort + Send + Sync> = Arc::new(fabric.register(lid));

    let provider: Arc<dyn ssafab_core::SubnetProvider> = if config.addr.addr_preload {
        Arc::new(AddrFileProvider::load(config.addr.addr_data_file.clone())?)
    } else {
        warn!("addr_preload disabled; starting with an empty address table");
        Arc::new(provider_from_empty()?)
    };

    let computer: Option<Arc<dyn ssafab_db::PrdbComputer>> = node_type
        .contains(NodeType::ACCESS)
        .then(|| Arc::new(HalfWorldComputer) as Arc<dyn ssafab_db::PrdbComputer>);

    let handle = Node::start(
        Arc::clone(&config),
        node_type,
        vec![(port, mad)],
        Some(provider),
        computer,
    )
    .context("starting node")?;

    // Subnet-up: run the first extraction.
    handle.trigger_extract().context("first extraction")?;

    wait_for_shutdown()?;
    handle.shutdown();
    info!("that's all folks!");
    Ok(())
}

fn provider_from_empty() -> Result<AddrFileProvider> {
    let dir = std::env::temp_dir().join("ssafab-empty-hosts");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("hosts");
    if !path.exists() {
        std::fs::write(&path, "# empty address table\n")?;
    }
    AddrFileProvider::load(path)
}

fn init_logging(config: &FabricConfig, stderr: bool) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let level = match config.log.log_level {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log.log_file)
            .with_context(|| format!("opening log file {}", config.log.log_file.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .init();
    }
    Ok(())
}

fn log_options(config: &FabricConfig) {
    info!(lock_file = %config.node.lock_file.display(), "option");
    info!(node_type = %config.node.node_type, "option");
    info!(
        smdb_port = config.net.smdb_port,
        prdb_port = config.net.prdb_port,
        admin_port = config.net.admin_port,
        keepalive = config.net.keepalive,
        "option"
    );
    info!(
        join_timeout = config.timing.join_timeout,
        rejoin_timeout = config.timing.rejoin_timeout,
        reconnect_timeout = config.timing.reconnect_timeout,
        reconnect_max_count = config.timing.reconnect_max_count,
        "option"
    );
    info!(
        smdb_dump = config.dump.smdb_dump,
        prdb_dump = config.dump.prdb_dump,
        err_smdb_dump = config.dump.err_smdb_dump,
        distrib_tree_level = config.dump.distrib_tree_level,
        "option"
    );
    info!(
        addr_preload = config.addr.addr_preload,
        addr_data_file = %config.addr.addr_data_file.display(),
        "option"
    );
}

fn wait_for_shutdown() -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    info!("shutdown signal received");
    Ok(())
}
