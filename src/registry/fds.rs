//! Per-process table of inheritable listeners

use super::{FileName, InheritedFile, NETWORK_TCP, NETWORK_UNIX};
use crate::error::Result;
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct FdsInner {
    /// Received from the predecessor and not yet claimed by a listener
    inherited: HashMap<FileName, InheritedFile>,

    /// Descriptors this generation serves on, in registration order
    active: Vec<(FileName, OwnedFd)>,
}

/// Listeners this generation owns and will pass to its successor
///
/// Shared between the serving code and the [`Upgrader`](crate::Upgrader)
/// thread, so every method takes `&self`.
#[derive(Default)]
pub struct Fds {
    inner: Mutex<FdsInner>,
}

impl Fds {
    /// Empty registry for the first generation of a deployment
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with descriptors received from a predecessor
    pub fn from_inherited(inherited: HashMap<FileName, InheritedFile>) -> Self {
        Self {
            inner: Mutex::new(FdsInner {
                inherited,
                active: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FdsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Names received from the predecessor that have not been claimed yet
    pub fn inherited_names(&self) -> Vec<FileName> {
        let mut names: Vec<FileName> = self.lock().inherited.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is either inherited or actively served
    pub fn contains(&self, name: &FileName) -> bool {
        let inner = self.lock();
        inner.inherited.contains_key(name) || inner.active.iter().any(|(n, _)| n == name)
    }

    /// Number of descriptors the registry holds (inherited plus active)
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.inherited.len() + inner.active.len()
    }

    /// Whether no descriptor is held at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TCP listener for `addr`, reusing the inherited socket when one matches
    pub fn listen_tcp(&self, addr: &str, label: &str) -> Result<TcpListener> {
        let name = FileName::new(NETWORK_TCP, addr, label);
        let fd = self.claim_or_bind(&name, || {
            let listener = TcpListener::bind(addr)?;
            Ok(OwnedFd::from(listener))
        })?;
        Ok(TcpListener::from(fd))
    }

    /// Unix stream listener at `path`, reusing the inherited socket when one matches
    pub fn listen_unix(&self, path: impl AsRef<Path>, label: &str) -> Result<UnixListener> {
        let path = path.as_ref();
        let name = FileName::new(NETWORK_UNIX, path.display().to_string(), label);
        let fd = self.claim_or_bind(&name, || {
            if path.exists() {
                // A predecessor that is still alive hands its socket over
                // instead, so whatever is on disk here is stale.
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            Ok(OwnedFd::from(listener))
        })?;
        Ok(UnixListener::from(fd))
    }

    /// Resolve `name` to a descriptor the caller owns, keeping a duplicate for handoff
    fn claim_or_bind<F>(&self, name: &FileName, bind: F) -> Result<OwnedFd>
    where
        F: FnOnce() -> Result<OwnedFd>,
    {
        let mut inner = self.lock();

        if let Some((_, fd)) = inner.active.iter().find(|(n, _)| n == name) {
            debug!("Reusing active listener {}", name);
            return Ok(fd.try_clone()?);
        }

        let fd = match inner.inherited.remove(name) {
            Some(file) => {
                info!("Using inherited listener {} (fd {})", name, file.fd());
                file.into_owned_fd()
            }
            None => {
                let fd = bind()?;
                info!("Bound new listener {}", name);
                fd
            }
        };

        inner.active.push((name.clone(), fd.try_clone()?));
        Ok(fd)
    }

    /// Close inherited descriptors no listener claimed, returning their names
    pub fn close_unused(&self) -> Vec<FileName> {
        let mut inner = self.lock();
        let mut names: Vec<FileName> = inner.inherited.drain().map(|(name, _)| name).collect();
        names.sort();
        for name in &names {
            warn!("Closing inherited descriptor nobody claimed: {}", name);
        }
        names
    }

    /// Manifest and duplicated descriptors, in manifest order, for a successor
    pub fn snapshot(&self) -> Result<(Vec<FileName>, Vec<OwnedFd>)> {
        let inner = self.lock();
        let mut names = Vec::with_capacity(inner.active.len());
        let mut fds = Vec::with_capacity(inner.active.len());
        for (name, fd) in &inner.active {
            names.push(name.clone());
            fds.push(fd.try_clone()?);
        }
        Ok((names, fds))
    }
}
