//! Common test utilities and helpers
//!
//! Instrumented fakes for the coordinator and the handoff channel. Both
//! append to one shared [`EventLog`] so tests can assert the cross-component
//! call order.

#![allow(dead_code)]

use handover_core::{
    Coordinator, DescriptorTransport, FileName, HandoffChannel, HandoverError, Phase,
    Predecessor, Result,
};
use std::io::{self, Cursor, Read, Write};
use std::net::TcpListener;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Something a fake observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquire,
    Connect,
    Read(usize),
    RecvFds(usize),
    Write(Vec<u8>),
    Flush,
    CloseChannel,
    Promote,
    Release,
}

/// Shared, ordered record of fake calls
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Position of the first event matching `pred`
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.events().contains(event)
    }

    /// Every byte written to a channel, in order
    pub fn written(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write(bytes) => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// In-memory handoff channel with canned inbound bytes and descriptors
pub struct FakeChannel {
    inbound: Cursor<Vec<u8>>,
    fds: Vec<OwnedFd>,
    log: EventLog,
    pub fail_writes: bool,
}

impl FakeChannel {
    pub fn new(log: &EventLog, inbound: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        Self {
            inbound: Cursor::new(inbound),
            fds,
            log: log.clone(),
            fail_writes: false,
        }
    }
}

impl Read for FakeChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inbound.read(buf)?;
        self.log.push(Event::Read(n));
        Ok(n)
    }
}

impl Write for FakeChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "predecessor went away"));
        }
        self.log.push(Event::Write(buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.log.push(Event::Flush);
        Ok(())
    }
}

impl DescriptorTransport for FakeChannel {
    fn recv_fds(&mut self, count: usize, _labels: &[String]) -> io::Result<Vec<OwnedFd>> {
        self.log.push(Event::RecvFds(count));
        Ok(std::mem::take(&mut self.fds))
    }

    fn send_fds(&mut self, _fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fake channel only receives",
        ))
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.log.push(Event::CloseChannel);
    }
}

/// Opaque handle handed out by [`FakeCoordinator`]
#[derive(Debug)]
pub struct FakeHandle;

/// Coordinator that hands out one prepared predecessor channel
pub struct FakeCoordinator<C> {
    log: EventLog,
    predecessor: Mutex<Option<C>>,
    pub fail_acquire: bool,
    pub fail_promote: bool,
}

impl<C> FakeCoordinator<C> {
    pub fn new(log: &EventLog, predecessor: Option<C>) -> Self {
        Self {
            log: log.clone(),
            predecessor: Mutex::new(predecessor),
            fail_acquire: false,
            fail_promote: false,
        }
    }
}

impl<C: HandoffChannel> Coordinator for FakeCoordinator<C> {
    type Handle = FakeHandle;
    type Channel = C;

    fn acquire_or_join(&self, _dir: &Path) -> Result<FakeHandle> {
        if self.fail_acquire {
            return Err(HandoverError::Lock {
                phase: Phase::Acquire,
                reason: "lock directory unavailable".to_string(),
            });
        }
        self.log.push(Event::Acquire);
        Ok(FakeHandle)
    }

    fn connect_predecessor(&self, _handle: &mut FakeHandle) -> Result<Predecessor<C>> {
        self.log.push(Event::Connect);
        Ok(match self.predecessor.lock().unwrap().take() {
            Some(channel) => Predecessor::Connected(channel),
            None => Predecessor::NotFound,
        })
    }

    fn promote_to_owner(&self, _handle: &mut FakeHandle) -> Result<()> {
        if self.fail_promote {
            return Err(HandoverError::Lock {
                phase: Phase::Promote,
                reason: "owner file not writable".to_string(),
            });
        }
        self.log.push(Event::Promote);
        Ok(())
    }

    fn release(&self, _handle: FakeHandle) -> Result<()> {
        self.log.push(Event::Release);
        Ok(())
    }
}

/// Length-prefixed manifest bytes, as a predecessor would send them
pub fn framed_manifest(json: &str) -> Vec<u8> {
    let mut bytes = (json.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(json.as_bytes());
    bytes
}

/// `n` live descriptors (bound TCP listeners)
pub fn listener_fds(n: usize) -> Vec<OwnedFd> {
    (0..n)
        .map(|_| OwnedFd::from(TcpListener::bind("127.0.0.1:0").unwrap()))
        .collect()
}

pub fn example_names() -> Vec<FileName> {
    vec![
        FileName::new("tcp", "0.0.0.0:8080", "main"),
        FileName::new("unix", "/run/app.sock", "admin"),
    ]
}

pub const EXAMPLE_MANIFEST: &str =
    r#"[["tcp","0.0.0.0:8080","main"],["unix","/run/app.sock","admin"]]"#;
