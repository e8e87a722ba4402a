//! # Phantom
//!
//! Device-event processing core for DaemonOS: enumerates `/sys`, watches
//! the kernel's netlink uevent stream, matches rules, manages `/dev`
//! nodes and symlinks, and runs the associated builtins and external
//! programs.
//!
//! ## Modules
//!
//! - **device**: sysfs enumeration and the in-memory device table
//! - **format**: `$name`/`%c` format string expansion
//! - **spawn**: supervised external program execution
//! - **event**: per-event state and the rule/node/run orchestrator
//! - **rules**: rule file parsing and matching
//! - **node**: `/dev` node and priority-ledgered symlink management
//! - **netif**: network interface renaming over rtnetlink
//! - **db**: persisted per-device record and tag index
//! - **builtin**: in-process builtin commands (`hwdb`, `path_id`, ...)
//! - **watch**: inotify watch suspend/resume around event processing
//! - **netlink_monitor**: kernel uevent receiver
//! - **ipc**: control-socket surface (list/info/trigger)

mod builtin;
mod db;
mod device;
mod event;
mod format;
mod hwdb;
mod ipc;
mod netif;
mod netlink_monitor;
mod node;
mod platform;
mod rules;
mod spawn;
mod watch;

use anyhow::Result;
use clap::{Parser, Subcommand};
use device::{Action, DeviceDatabase};
use event::Orchestrator;
use platform::Platform;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "phantom", version, about)]
struct Args {
    /// Rules directory
    #[arg(short, long, env = "PHANTOM_RULES_DIR", default_value = "/grimoire/system/phantom.d")]
    rules_dir: PathBuf,

    /// Run-state directory (device db, tag index, symlink ledgers)
    #[arg(long, env = "PHANTOM_STATE_DIR", default_value = "/run/phantom")]
    state_dir: PathBuf,

    /// Control socket path
    #[arg(short, long, env = "PHANTOM_SOCKET", default_value = "/run/phantom/phantom.sock")]
    socket: PathBuf,

    /// Seconds before a spawned program is killed
    #[arg(long, env = "PHANTOM_EVENT_TIMEOUT", default_value_t = 180)]
    event_timeout: u64,

    /// Seconds before a warning is logged for a slow spawned program
    #[arg(long, env = "PHANTOM_EVENT_TIMEOUT_WARN", default_value_t = 60)]
    event_timeout_warn: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all devices
    List {
        #[arg(short, long)]
        subsystem: Option<String>,
    },
    /// Show device info
    Info { path: String },
    /// Trigger device events
    Trigger {
        #[arg(short, long)]
        subsystem: Option<String>,
        #[arg(short, long, default_value = "change")]
        action: String,
    },
    /// Wait for the event queue to settle
    Settle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let platform = Platform::detect();
    info!("phantom v{} starting on {}", env!("CARGO_PKG_VERSION"), platform.name());

    if let Some(cmd) = args.command {
        return handle_client_command(&args.socket, cmd).await;
    }

    run_daemon(args).await
}

async fn handle_client_command(socket: &PathBuf, cmd: Commands) -> Result<()> {
    let client = ipc::PhantomClient::new(socket.clone());

    match cmd {
        Commands::List { subsystem } => {
            let devices = client.list_devices(subsystem.as_deref()).await?;
            println!("{:<50} {:<15} {:<20}", "PATH", "SUBSYSTEM", "DRIVER");
            println!("{}", "-".repeat(90));
            for dev in devices {
                println!(
                    "{:<50} {:<15} {:<20}",
                    dev.syspath,
                    dev.subsystem.as_deref().unwrap_or("-"),
                    dev.driver.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Info { path } => {
            let info = client.get_device(&path).await?;
            println!("Path:       {}", info.syspath);
            println!("Subsystem:  {}", info.subsystem.as_deref().unwrap_or("-"));
            println!("Driver:     {}", info.driver.as_deref().unwrap_or("-"));
            println!("Dev Node:   {}", info.devnode.as_deref().unwrap_or("-"));
            if !info.properties.is_empty() {
                println!("Properties:");
                for (key, value) in &info.properties {
                    println!("  {}={}", key, value);
                }
            }
        }
        Commands::Trigger { subsystem, action } => {
            client.trigger(subsystem.as_deref(), &action).await?;
            println!("trigger sent");
        }
        Commands::Settle => {
            client.settle().await?;
            println!("settled");
        }
    }

    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    std::fs::create_dir_all(&args.state_dir)?;

    let devices = Arc::new(RwLock::new(DeviceDatabase::new()));

    let mut rule_set = rules::RuleSet::new();
    if let Err(e) = rule_set.load_directory(&args.rules_dir) {
        warn!("failed to load some rules: {}", e);
    }
    info!("loaded {} rules from {:?}", rule_set.rule_count(), args.rules_dir);

    info!("enumerating devices...");
    {
        let mut db = devices.write().await;
        let count = db.enumerate()?;
        info!("found {} devices", count);
    }

    let orchestrator = Arc::new(Orchestrator::new(
        rule_set,
        db::Db::new(&args.state_dir),
        node::NodeManager::new(&args.state_dir),
        watch::WatchManager::new()?,
        builtin::BuiltinRegistry::new(),
        args.event_timeout.saturating_mul(1_000_000),
        args.event_timeout_warn.saturating_mul(1_000_000),
    ));

    // Settle the initial enumeration through the same orchestration path
    // an observed uevent would take, so /dev and the db reflect reality
    // before the daemon starts accepting control connections.
    {
        let snapshot: Vec<_> = devices.read().await.all().cloned().collect();
        let mut db = devices.write().await;
        for dev in snapshot {
            if let Err(e) = orchestrator.execute(dev, &mut db, &HashMap::new()).await {
                warn!("failed to process initial device: {}", e);
            }
        }
    }

    let devices_clone = devices.clone();
    let orchestrator_clone = orchestrator.clone();
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = run_event_loop(devices_clone, orchestrator_clone).await {
            error!("netlink monitor error: {}", e);
        }
    });

    let server = ipc::PhantomServer::new(args.socket.clone(), devices.clone());
    info!("phantom ready on {:?}", args.socket);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("control socket error: {}", e);
            }
        }
        _ = monitor_handle => {
            info!("netlink monitor exited");
        }
    }

    Ok(())
}

async fn run_event_loop(devices: Arc<RwLock<DeviceDatabase>>, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let mut monitor = netlink_monitor::NetlinkMonitor::new()?;
    info!("netlink monitor started");

    loop {
        match monitor.recv_device().await {
            Ok(Some(dev)) => {
                info!("device event: {} {} ({})", dev.action, dev.devpath, dev.subsystem.as_deref().unwrap_or("unknown"));

                let mut db = devices.write().await;
                if let Err(e) = orchestrator.execute(dev, &mut db, &HashMap::new()).await {
                    warn!("failed to process device event: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("netlink receive error: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}
