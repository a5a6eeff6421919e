//! Handoff channel protocol
//!
//! The exchange between two generations over one private Unix stream:
//!
//! 1. predecessor → successor: 4-byte big-endian manifest length, then the
//!    JSON manifest (see [`crate::registry`])
//! 2. predecessor → successor: the descriptors, in manifest order, as one
//!    `SCM_RIGHTS` message (skipped when the manifest is empty)
//! 3. successor → predecessor: the single byte [`READY_SIGNAL`]
//!
//! The manifest is read with exact-length reads straight off the channel and
//! the descriptors with a separate ancillary-data receive. Never put a
//! buffered reader in front of the channel: it would swallow the byte the
//! descriptors ride on, and the kernel drops them with it.

mod unix;

use crate::error::{HandoverError, Phase, Result};
use crate::registry::{decode_manifest, encode_manifest, FileName, InheritedFile};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tracing::{debug, error};

/// Byte the successor sends once it is ready to serve
pub const READY_SIGNAL: u8 = 42;

/// Largest manifest payload accepted from a predecessor
pub const MAX_MANIFEST_BYTES: usize = 1 << 20;

/// Most descriptors one handoff can carry (the kernel's `SCM_MAX_FD`)
pub const MAX_DESCRIPTORS: usize = 253;

/// Data byte that carries the ancillary descriptor message
pub(crate) const FD_PLACEHOLDER: u8 = 0;

/// Out-of-band descriptor transfer over a channel
pub trait DescriptorTransport {
    /// Receive the descriptors of one transfer
    ///
    /// Returns whatever the kernel delivered, which may differ from `count`
    /// if the other side misbehaves. `labels` are for diagnostics only.
    fn recv_fds(&mut self, count: usize, labels: &[String]) -> io::Result<Vec<OwnedFd>>;

    /// Send `fds` as one transfer
    fn send_fds(&mut self, fds: &[BorrowedFd<'_>]) -> io::Result<()>;
}

/// A channel able to carry one handoff: ordered bytes plus descriptors
pub trait HandoffChannel: Read + Write + DescriptorTransport {}

impl<T: Read + Write + DescriptorTransport> HandoffChannel for T {}

/// Read the length-prefixed manifest sent by the predecessor
pub fn receive_manifest<C: Read + ?Sized>(channel: &mut C) -> Result<Vec<FileName>> {
    let mut prefix = [0u8; 4];
    channel.read_exact(&mut prefix).map_err(|e| {
        HandoverError::protocol(
            Phase::Manifest,
            format!("could not read length of manifest: {}", e),
        )
    })?;

    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_MANIFEST_BYTES {
        return Err(HandoverError::protocol(
            Phase::Manifest,
            format!(
                "manifest length {} exceeds limit of {} bytes",
                length, MAX_MANIFEST_BYTES
            ),
        ));
    }

    let mut payload = vec![0u8; length];
    channel.read_exact(&mut payload).map_err(|e| {
        HandoverError::protocol(
            Phase::Manifest,
            format!("unable to read {} bytes of manifest: {}", length, e),
        )
    })?;

    decode_manifest(&payload)
}

/// Receive one descriptor per manifest entry
pub fn receive_descriptors<C: DescriptorTransport + ?Sized>(
    channel: &mut C,
    names: &[FileName],
) -> Result<HashMap<FileName, InheritedFile>> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }
    if names.len() > MAX_DESCRIPTORS {
        return Err(HandoverError::protocol(
            Phase::Descriptors,
            format!(
                "manifest names {} descriptors, at most {} can be transferred",
                names.len(),
                MAX_DESCRIPTORS
            ),
        ));
    }

    let labels: Vec<String> = names.iter().map(ToString::to_string).collect();
    let received = channel.recv_fds(names.len(), &labels).map_err(|e| {
        HandoverError::protocol(
            Phase::Descriptors,
            format!("could not receive descriptors: {}", e),
        )
    })?;

    if received.len() != names.len() {
        error!(
            "Got {} descriptors, but the manifest named {}: {:?}",
            received.len(),
            names.len(),
            labels
        );
        // `received` drops here, closing every descriptor we did get.
        return Err(HandoverError::ResourceMismatch {
            expected: names.len(),
            received: received.len(),
        });
    }

    let files = names
        .iter()
        .zip(labels)
        .zip(received)
        .map(|((name, label), fd)| (name.clone(), InheritedFile::new(fd, label)))
        .collect();
    Ok(files)
}

/// Tell the predecessor this generation is ready to serve
pub fn send_ready_signal<C: Write + ?Sized>(channel: &mut C) -> Result<()> {
    channel
        .write_all(&[READY_SIGNAL])
        .and_then(|_| channel.flush())
        .map_err(|e| {
            HandoverError::protocol(
                Phase::ReadySignal,
                format!("can't notify predecessor: {}", e),
            )
        })
}

/// Write the length-prefixed manifest (predecessor side)
pub fn send_manifest<C: Write + ?Sized>(channel: &mut C, names: &[FileName]) -> Result<()> {
    let payload = encode_manifest(names)?;
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_MANIFEST_BYTES)
        .ok_or_else(|| {
            HandoverError::protocol(
                Phase::Manifest,
                format!("manifest of {} bytes is too large", payload.len()),
            )
        })?;

    channel
        .write_all(&length.to_be_bytes())
        .and_then(|_| channel.write_all(&payload))
        .and_then(|_| channel.flush())
        .map_err(|e| {
            HandoverError::protocol(Phase::Manifest, format!("can't send manifest: {}", e))
        })?;
    debug!("Sent manifest of {} names", names.len());
    Ok(())
}

/// Transfer descriptors in manifest order (predecessor side)
pub fn send_descriptors<C: DescriptorTransport + ?Sized>(
    channel: &mut C,
    fds: &[OwnedFd],
) -> Result<()> {
    if fds.is_empty() {
        return Ok(());
    }
    if fds.len() > MAX_DESCRIPTORS {
        return Err(HandoverError::protocol(
            Phase::Descriptors,
            format!(
                "{} descriptors exceed the limit of {}",
                fds.len(),
                MAX_DESCRIPTORS
            ),
        ));
    }

    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(AsFd::as_fd).collect();
    channel.send_fds(&borrowed).map_err(|e| {
        HandoverError::protocol(
            Phase::Descriptors,
            format!("can't send descriptors: {}", e),
        )
    })
}

/// Block until the successor sends its readiness byte (predecessor side)
pub fn await_ready<C: Read + ?Sized>(channel: &mut C) -> Result<()> {
    let mut byte = [0u8; 1];
    channel.read_exact(&mut byte).map_err(|e| {
        HandoverError::protocol(
            Phase::ReadySignal,
            format!("successor did not signal readiness: {}", e),
        )
    })?;

    if byte[0] != READY_SIGNAL {
        return Err(HandoverError::protocol(
            Phase::ReadySignal,
            format!("unexpected readiness byte {}", byte[0]),
        ));
    }
    Ok(())
}
