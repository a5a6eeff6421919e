//! Handover - zero-downtime generation handoff demo service
//!
//! Runs a line-echo service as one generation of a handover chain. Start a
//! second `handover serve` with the same `--dir` and `--listen` specs and it
//! takes over the listening sockets from the first, which then drains its
//! open connections and exits.

use clap::{Parser, Subcommand};
use handover_core::{
    error::{HandoverError, Result},
    FileCoordinator, Generation, HandoverConfig, ListenSpec, OwnerStatus, Upgrader,
    UpgraderOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "handover")]
#[command(about = "Zero-downtime process generation handoff", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "HANDOVER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve as the next generation, inheriting listeners from the current one
    Serve {
        /// Coordination directory shared by all generations
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Listener spec, `tcp:<addr>:<label>` or `unix:<path>:<label>` (repeatable)
        #[arg(long = "listen", value_name = "SPEC")]
        listen: Vec<String>,

        /// Seconds to wait for a successor's readiness byte
        #[arg(long)]
        ready_timeout_secs: Option<u64>,

        /// Seconds to let open connections finish after handing off
        #[arg(long)]
        drain_timeout_secs: Option<u64>,
    },

    /// Show which process owns a coordination directory
    Status {
        /// Coordination directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::new(format!(
        "handover={0},handover_core={0}",
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Handover v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = HandoverConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            dir,
            listen,
            ready_timeout_secs,
            drain_timeout_secs,
        } => {
            if let Some(dir) = dir {
                config.coordination_dir = dir;
            }
            if !listen.is_empty() {
                config.listen = listen;
            }
            if let Some(secs) = ready_timeout_secs {
                config.ready_timeout_secs = secs;
            }
            if let Some(secs) = drain_timeout_secs {
                config.drain_timeout_secs = secs;
            }
            serve(config).await
        }
        Commands::Status { dir } => {
            let dir = dir.unwrap_or(config.coordination_dir);
            match FileCoordinator::owner_status(&dir)? {
                OwnerStatus::Running { pid } => println!("Owner: {} (running)", pid),
                OwnerStatus::Stale { pid } => println!("Owner: {} (not running, stale)", pid),
                OwnerStatus::NotRunning => println!("No owner in {}", dir.display()),
            }
            Ok(())
        }
    }
}

/// Run one generation: inherit, serve, and drain once a successor takes over
async fn serve(config: HandoverConfig) -> Result<()> {
    let specs = config.listen_specs()?;
    if specs.is_empty() {
        return Err(HandoverError::Other(
            "No listeners configured, pass --listen tcp:<addr>:<label>".to_string(),
        ));
    }

    let dir = config.coordination_dir.clone();
    let coordinator = FileCoordinator::new();

    // The handoff itself is blocking socket I/O.
    let (generation, fds) = tokio::task::block_in_place(|| Generation::start(&coordinator, &dir))?;
    let fds = Arc::new(fds);

    // Every accept loop and connection holds a sender; the receiver sees
    // `None` once all of them are gone.
    let (alive_tx, mut alive_rx) = mpsc::channel::<()>(1);
    let mut accept_tasks = Vec::with_capacity(specs.len());

    for spec in &specs {
        let task = match spec {
            ListenSpec::Tcp { addr, label } => {
                let listener = fds.listen_tcp(addr, label)?;
                listener.set_nonblocking(true)?;
                let listener = tokio::net::TcpListener::from_std(listener)?;
                info!("Serving '{}' on tcp {}", label, listener.local_addr()?);
                tokio::spawn(accept_tcp(listener, alive_tx.clone()))
            }
            ListenSpec::Unix { path, label } => {
                let listener = fds.listen_unix(path, label)?;
                listener.set_nonblocking(true)?;
                let listener = tokio::net::UnixListener::from_std(listener)?;
                info!("Serving '{}' on unix {}", label, path.display());
                tokio::spawn(accept_unix(listener, alive_tx.clone()))
            }
        };
        accept_tasks.push(task);
    }
    fds.close_unused();

    let mut upgrader = Upgrader::listen(
        coordinator.socket_path(&dir),
        Arc::clone(&fds),
        UpgraderOptions {
            ready_timeout: config.ready_timeout(),
        },
    )
    .await?;
    tokio::task::block_in_place(|| generation.ready())?;
    info!("Generation {} is serving", std::process::id());

    let mut upgraded = upgrader.upgraded();
    tokio::select! {
        result = upgraded.wait_for(|done| *done) => {
            if result.is_ok() {
                info!("Successor took over, draining connections");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    for task in &accept_tasks {
        task.abort();
    }
    upgrader.stop().await;
    drop(alive_tx);

    match tokio::time::timeout(config.drain_timeout(), alive_rx.recv()).await {
        Ok(_) => info!("All connections drained"),
        Err(_) => warn!(
            "Drain timeout of {}s elapsed with connections still open",
            config.drain_timeout_secs
        ),
    }

    Ok(())
}

async fn accept_tcp(listener: tokio::net::TcpListener, alive: mpsc::Sender<()>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                tokio::spawn(handle_connection(stream, alive.clone()));
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

async fn accept_unix(listener: tokio::net::UnixListener, alive: mpsc::Sender<()>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("Accepted unix connection");
                tokio::spawn(handle_connection(stream, alive.clone()));
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

/// Echo each line back, tagged with the pid of the generation that served it
async fn handle_connection<S>(stream: S, _alive: mpsc::Sender<()>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let pid = std::process::id();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply = format!("[{}] {}\n", pid, line);
                if let Err(e) = writer.write_all(reply.as_bytes()).await {
                    debug!("Failed to write reply: {}", e);
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!("Failed to read from connection: {}", e);
                return;
            }
        }
    }
}
