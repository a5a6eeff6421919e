//! Handover - zero-downtime process generation handoff
//!
//! Lets a long-running network service be replaced by a new process without
//! dropping connections: the new generation inherits the old one's listening
//! sockets over a private Unix socket, and ownership of the coordination
//! directory moves over only once the new generation is ready to serve.
//!
//! # Architecture
//!
//! - **Registry**: descriptor identities, the manifest codec, and [`Fds`]
//! - **Coordinator**: the lock collaborator ([`Coordinator`], [`FileCoordinator`])
//! - **Protocol**: manifest, descriptor transfer, and readiness byte
//! - **Controller**: the [`Generation`] sequence a new process follows
//! - **Upgrader**: the old generation's side of the handoff
//!
//! # Example
//!
//! ```no_run
//! use handover_core::{FileCoordinator, Generation, Upgrader, UpgraderOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> handover_core::Result<()> {
//!     let dir = Path::new("/run/myservice");
//!     let coordinator = FileCoordinator::new();
//!
//!     // The handoff is blocking socket I/O.
//!     let (generation, fds) =
//!         tokio::task::block_in_place(|| Generation::start(&coordinator, dir))?;
//!     let fds = Arc::new(fds);
//!     let listener = fds.listen_tcp("0.0.0.0:8080", "main")?;
//!     fds.close_unused();
//!
//!     let mut upgrader = Upgrader::listen(
//!         coordinator.socket_path(dir),
//!         Arc::clone(&fds),
//!         UpgraderOptions::default(),
//!     )
//!     .await?;
//!     tokio::task::block_in_place(|| generation.ready())?;
//!
//!     // serve on `listener` until `upgrader.upgraded()` flips, then drain
//!     upgrader.stop().await;
//!     # drop(listener);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod upgrader;

// Re-export commonly used types
pub use crate::config::{HandoverConfig, ListenSpec};
pub use crate::controller::{Generation, GenerationState};
pub use crate::coordinator::{Coordinator, FileCoordinator, FileLockHandle, OwnerStatus, Predecessor};
pub use crate::error::{HandoverError, Phase, Result};
pub use crate::protocol::{DescriptorTransport, HandoffChannel, READY_SIGNAL};
pub use crate::registry::{FileName, Fds, InheritedFile};
pub use crate::upgrader::{Upgrader, UpgraderOptions};
