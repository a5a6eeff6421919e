//! `SCM_RIGHTS` descriptor passing over Unix stream sockets

use super::{DescriptorTransport, FD_PLACEHOLDER, MAX_DESCRIPTORS};
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::debug;

#[cfg(target_os = "linux")]
fn recv_flags() -> MsgFlags {
    // Received descriptors must not leak into children we exec.
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(not(target_os = "linux"))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

impl DescriptorTransport for UnixStream {
    fn recv_fds(&mut self, count: usize, labels: &[String]) -> io::Result<Vec<OwnedFd>> {
        debug!("Waiting for {} descriptors: {:?}", count, labels);

        let mut placeholder = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut placeholder)];
        // Room for the largest transfer so a sender that overshoots is still
        // seen (and its extra descriptors closed) instead of truncated.
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_DESCRIPTORS]);

        let msg = loop {
            match recvmsg::<()>(
                self.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                recv_flags(),
            ) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };

        let mut received = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                received.extend(raw_fds.into_iter().map(|fd| {
                    // SAFETY: the kernel installed this descriptor in our table
                    // for this message; nothing else refers to it yet.
                    unsafe { OwnedFd::from_raw_fd(fd) }
                }));
            }
        }

        #[cfg(not(target_os = "linux"))]
        for fd in &received {
            set_cloexec(fd)?;
        }

        // Only check for truncation after taking ownership of what did arrive.
        if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor message truncated",
            ));
        }
        if msg.bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed before descriptors arrived",
            ));
        }

        Ok(received)
    }

    fn send_fds(&mut self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let placeholder = [FD_PLACEHOLDER];
        let iov = [IoSlice::new(&placeholder)];
        let cmsgs = [ControlMessage::ScmRights(&raw_fds)];

        let sent = loop {
            match sendmsg::<()>(self.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };
        if sent != placeholder.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "descriptor message not sent",
            ));
        }

        debug!("Sent {} descriptors", raw_fds.len());
        Ok(())
    }
}
