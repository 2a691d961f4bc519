/*!
 * netweave Network Construct Daemon
 * VLANs, bridges and bonds on netplan, served over a Unix socket
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::info;

use netweave_daemon::config::DaemonConfig;
use netweave_daemon::construct::ConstructController;
use netweave_daemon::exec::{CommandExecutor, SystemExecutor};
use netweave_daemon::ipc::IpcServer;
use netweave_daemon::netplan::store::ConfigStore;
use netweave_daemon::network::inventory::Inventory;

#[derive(Parser)]
#[command(name = "netweaved")]
#[command(about = "netweave Network Construct Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/netweave/netweaved.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Check daemon status
    Status,
    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "netweave_daemon={log_level},netweaved={log_level}"
        ))
        .init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
        Commands::Stop => stop_daemon(&config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("netweave daemon starting...");

    let executor: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor::new());
    let inventory = Arc::new(Inventory::new(
        Arc::clone(&executor),
        config.inventory_settings(),
    ));
    let store = ConfigStore::new(config.store_settings(), Arc::clone(&executor));
    let controller = Arc::new(ConstructController::new(
        store,
        inventory,
        executor,
        config.controller_settings(),
    ));
    info!(
        "Managing {}/{}-*.yaml",
        config.netplan.directory.display(),
        config.netplan.vendor_prefix
    );

    let socket = Path::new(&config.socket_path);
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    // a previous run that did not shut down cleanly leaves the socket behind
    if socket.exists() {
        std::fs::remove_file(socket)
            .with_context(|| format!("Cannot remove stale socket {}", socket.display()))?;
    }
    let listener = UnixListener::bind(socket)
        .with_context(|| format!("Cannot bind {}", socket.display()))?;
    let ipc_server = IpcServer::new(listener, controller);

    info!("netweave daemon ready on socket: {}", config.socket_path);

    // Run the server
    ipc_server.run().await?;

    let _ = std::fs::remove_file(socket);
    info!("netweave daemon stopped");
    Ok(())
}

/// One request, one response line
async fn roundtrip(config: &DaemonConfig, request: &str) -> Result<serde_json::Value> {
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .with_context(|| format!("netweaved is not listening on {}", config.socket_path))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(request.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;
    if line.trim().is_empty() {
        bail!("netweaved closed the connection without answering");
    }
    Ok(serde_json::from_str(&line)?)
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    let reply = roundtrip(config, r#"{"type":"Ping"}"#).await?;
    println!(
        "netweaved {} is running on {}",
        reply["version"].as_str().unwrap_or("(unknown version)"),
        config.socket_path
    );
    Ok(())
}

async fn stop_daemon(config: &DaemonConfig) -> Result<()> {
    let reply = roundtrip(config, r#"{"type":"Shutdown"}"#).await?;
    println!(
        "{}",
        reply["message"].as_str().unwrap_or("Shutdown requested")
    );
    Ok(())
}
