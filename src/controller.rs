//! Generation controller
//!
//! Drives one process through its handoff:
//!
//! ```text
//! acquire → connect → receive manifest → receive descriptors
//!         → [caller builds listeners] → signal ready → promote → release
//! ```
//!
//! Readiness is always signalled before promotion, and promotion always
//! happens before release, so the predecessor never sees the lock released
//! before it has seen the successor's readiness byte.

use crate::coordinator::{Coordinator, Predecessor};
use crate::error::{HandoverError, Phase, Result};
use crate::protocol;
use crate::registry::Fds;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Where a generation is in its handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Acquiring the coordination lock
    Starting,
    /// Looking for the previous generation
    AwaitingPredecessor,
    /// Receiving the manifest and descriptors
    Inheriting,
    /// Caller is building listeners; not yet the owner
    Serving,
    /// Signalling readiness and taking ownership
    Owner,
    /// Handoff finished
    Done,
}

/// One process's participation in the generation chain
///
/// Holds the coordination lock from [`Generation::start`] until
/// [`Generation::ready`] releases it. Dropped early (an error, or the caller
/// bailing out), it releases the lock without promoting.
pub struct Generation<'c, C: Coordinator> {
    coordinator: &'c C,
    handle: Option<C::Handle>,
    channel: Option<C::Channel>,
    state: GenerationState,
}

impl<'c, C: Coordinator> Generation<'c, C> {
    /// A generation that has not touched the coordination directory yet
    pub fn new(coordinator: &'c C) -> Self {
        Self {
            coordinator,
            handle: None,
            channel: None,
            state: GenerationState::Starting,
        }
    }

    /// Take the lock and inherit whatever the predecessor hands over
    ///
    /// Returns once the inherited descriptors are available; the caller
    /// then builds its listeners from the returned [`Fds`] and calls
    /// [`Generation::ready`].
    pub fn start(coordinator: &'c C, dir: &Path) -> Result<(Self, Fds)> {
        let mut generation = Self::new(coordinator);
        let fds = generation.inherit(dir)?;
        Ok((generation, fds))
    }

    /// Run the `Starting` through `Inheriting` steps on a new generation
    pub fn inherit(&mut self, dir: &Path) -> Result<Fds> {
        if self.state != GenerationState::Starting {
            return Err(HandoverError::lock(
                Phase::Acquire,
                format!("generation already started (state {:?})", self.state),
            ));
        }

        debug!("Starting generation in {}", dir.display());
        self.handle = Some(self.coordinator.acquire_or_join(dir)?);
        self.state = GenerationState::AwaitingPredecessor;

        let predecessor = self.with_handle(Phase::Connect, |c, h| c.connect_predecessor(h))?;

        let mut channel = match predecessor {
            Predecessor::NotFound => {
                info!("No predecessor found, starting with an empty descriptor set");
                self.state = GenerationState::Serving;
                return Ok(Fds::new());
            }
            Predecessor::Connected(channel) => channel,
        };

        self.state = GenerationState::Inheriting;
        info!("Connected to predecessor, getting descriptors");

        // On error the channel goes out of scope here, before the caller's
        // drop of `self` releases the lock.
        let names = protocol::receive_manifest(&mut channel)?;
        debug!("Expecting files: {:?}", names);
        let files = protocol::receive_descriptors(&mut channel, &names)?;
        info!("Got {} descriptors from predecessor", files.len());

        self.channel = Some(channel);
        self.state = GenerationState::Serving;
        Ok(Fds::from_inherited(files))
    }

    /// Current state
    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Whether a predecessor is waiting for our readiness byte
    pub fn has_predecessor(&self) -> bool {
        self.channel.is_some()
    }

    /// Declare readiness and take over ownership
    ///
    /// Signals the predecessor (if any) and closes the channel, then
    /// promotes this process to owner, then releases the lock.
    pub fn ready(mut self) -> Result<()> {
        // Only a generation that finished inheriting may take over.
        if self.state != GenerationState::Serving {
            return Err(HandoverError::lock(
                Phase::Promote,
                format!("generation cannot take ownership in state {:?}", self.state),
            ));
        }
        self.state = GenerationState::Owner;

        if let Some(mut channel) = self.channel.take() {
            let signalled = protocol::send_ready_signal(&mut channel);
            drop(channel);
            if let Err(e) = signalled {
                error!("Failed to signal readiness, giving up the handoff: {}", e);
                return Err(e);
            }
            info!("Notified the predecessor we're ready");
        }

        self.with_handle(Phase::Promote, |c, h| c.promote_to_owner(h))?;

        let handle = self
            .handle
            .take()
            .ok_or_else(|| HandoverError::lock(Phase::Release, "lock handle already released"))?;
        self.coordinator.release(handle)?;
        self.state = GenerationState::Done;

        info!("Unlocked coordination directory");
        Ok(())
    }

    fn with_handle<T, F>(&mut self, phase: Phase, f: F) -> Result<T>
    where
        F: FnOnce(&'c C, &mut C::Handle) -> Result<T>,
    {
        let coordinator = self.coordinator;
        match self.handle.as_mut() {
            Some(handle) => f(coordinator, handle),
            None => Err(HandoverError::lock(phase, "lock handle already released")),
        }
    }
}

impl<C: Coordinator> Drop for Generation<'_, C> {
    fn drop(&mut self) {
        // Close the channel first: the predecessor must see the failed
        // handoff before the lock frees up for another successor.
        self.channel.take();

        if let Some(handle) = self.handle.take() {
            warn!(
                "Generation stopped in state {:?} before taking ownership, releasing lock",
                self.state
            );
            if let Err(e) = self.coordinator.release(handle) {
                error!("Failed to release coordination lock: {}", e);
            }
        }
    }
}
