//! Coordination lock collaborator
//!
//! Decides which process in a chain of generations owns the shared
//! coordination directory. The generation controller only uses the four
//! operations of [`Coordinator`]; how the lock lives on disk is up to the
//! implementation ([`FileCoordinator`] is the one this crate ships).

mod file;

pub use file::{FileCoordinator, FileLockHandle, OwnerStatus};

use crate::error::Result;
use crate::protocol::HandoffChannel;
use std::path::Path;

/// Outcome of looking for the previous generation
#[derive(Debug)]
pub enum Predecessor<C> {
    /// Connected to the current owner's handoff socket
    Connected(C),
    /// No live owner: this is the first generation
    NotFound,
}

/// Lock manager a generation consults while taking over
pub trait Coordinator {
    /// This process's claim on the coordination directory
    type Handle;

    /// Channel to the predecessor
    type Channel: HandoffChannel;

    /// Take (or wait for) the coordination lock for `dir`
    fn acquire_or_join(&self, dir: &Path) -> Result<Self::Handle>;

    /// Connect to the current owner, if there is one
    fn connect_predecessor(&self, handle: &mut Self::Handle)
        -> Result<Predecessor<Self::Channel>>;

    /// Record this process as the owner
    fn promote_to_owner(&self, handle: &mut Self::Handle) -> Result<()>;

    /// Give up the lock so the next generation can start its handoff
    fn release(&self, handle: Self::Handle) -> Result<()>;
}
