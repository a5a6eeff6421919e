//! Predecessor side of the handoff
//!
//! Once a generation owns the coordination directory it listens on its
//! handoff socket. A successor that connects is sent the manifest and the
//! descriptors of every active listener, and the upgrade completes when the
//! successor answers with the readiness byte. The serving code watches
//! [`Upgrader::upgraded`] to know when to stop accepting and drain.
//!
//! The exchange itself is blocking socket I/O, so each handshake runs on the
//! blocking pool while the accept loop stays an async task that can be told
//! to stop at any point.

use crate::error::{HandoverError, Result};
use crate::protocol;
use crate::registry::Fds;
use std::net::Shutdown;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upgrader settings
#[derive(Debug, Clone)]
pub struct UpgraderOptions {
    /// How long a connected successor may take to signal readiness
    /// (`Duration::ZERO` waits forever)
    pub ready_timeout: Duration,
}

impl Default for UpgraderOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Serves handoffs to successor generations
pub struct Upgrader {
    socket_path: PathBuf,
    upgraded: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Upgrader {
    /// Bind the handoff socket and start accepting successors
    pub async fn listen(
        socket_path: impl Into<PathBuf>,
        fds: Arc<Fds>,
        options: UpgraderOptions,
    ) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.exists() {
            warn!("Removing stale handoff socket {}", socket_path.display());
            tokio::fs::remove_file(&socket_path).await?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            HandoverError::Other(format!(
                "Failed to bind handoff socket {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }

        info!("Accepting successors on {}", socket_path.display());

        let (upgraded_tx, upgraded_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_successors(
            listener,
            fds,
            options,
            upgraded_tx,
            shutdown_rx,
        ));

        Ok(Self {
            socket_path,
            upgraded: upgraded_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    /// Path of the handoff socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Flips to `true` once a successor has signalled readiness
    pub fn upgraded(&self) -> watch::Receiver<bool> {
        self.upgraded.clone()
    }

    /// Whether a successor has taken over
    pub fn is_upgraded(&self) -> bool {
        *self.upgraded.borrow()
    }

    /// Stop accepting successors and remove the socket
    ///
    /// A successor still in the middle of a handoff has its connection shut
    /// down, so this returns without waiting for its readiness byte.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Upgrader task failed: {}", e);
            }
        }
        self.remove_socket();
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed handoff socket {}", self.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove handoff socket: {}", e),
        }
    }
}

impl Drop for Upgrader {
    fn drop(&mut self) {
        // The task winds itself down once it sees the signal.
        self.shutdown.send_replace(true);
        if self.task.take().is_some() {
            self.remove_socket();
        }
    }
}

async fn accept_successors(
    listener: UnixListener,
    fds: Arc<Fds>,
    options: UpgraderOptions,
    upgraded: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    error!("Failed to accept successor connection: {}", e);
                    continue;
                }
            },
        };

        match hand_off(stream, &fds, &options, &mut shutdown).await {
            Ok(true) => {
                info!("Successor is ready, handoff complete");
                upgraded.send_replace(true);
                break;
            }
            Ok(false) => {
                debug!("Stopped with a successor mid-handoff");
                break;
            }
            Err(e) => {
                // The successor aborts on its side; keep serving and wait for
                // the next one.
                warn!("Handoff to successor failed: {}", e);
            }
        }
    }
}

/// Run one handshake on the blocking pool
///
/// Returns `Ok(false)` if shutdown was requested before the successor
/// answered; its connection is shut down so the blocking side returns.
async fn hand_off(
    stream: UnixStream,
    fds: &Arc<Fds>,
    options: &UpgraderOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let canceller = stream.try_clone()?;

    let fds = Arc::clone(fds);
    let options = options.clone();
    let mut exchange =
        tokio::task::spawn_blocking(move || serve_successor(stream, &fds, &options));

    tokio::select! {
        joined = &mut exchange => {
            joined.map_err(|e| HandoverError::Other(format!("Handoff task failed: {}", e)))??;
            Ok(true)
        }
        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
            if let Err(e) = canceller.shutdown(Shutdown::Both) {
                debug!("Failed to shut down successor connection: {}", e);
            }
            // The exchange fails fast on the closed socket; its error is moot.
            let _ = exchange.await;
            Ok(false)
        }
    }
}

fn serve_successor(
    mut stream: std::os::unix::net::UnixStream,
    fds: &Fds,
    options: &UpgraderOptions,
) -> Result<()> {
    let (names, descriptors) = fds.snapshot()?;
    info!("Successor connected, sending {} descriptors", names.len());
    debug!("Sending files: {:?}", names);

    protocol::send_manifest(&mut stream, &names)?;
    protocol::send_descriptors(&mut stream, &descriptors)?;

    let timeout = Some(options.ready_timeout).filter(|t| !t.is_zero());
    stream.set_read_timeout(timeout)?;
    protocol::await_ready(&mut stream)
}
