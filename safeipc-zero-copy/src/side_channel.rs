// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// Out-of-band path from the slot server to one receiver.
///
/// Delivery of a published slot is a best-effort nudge (receivers also
/// poll the ring); a transport-level failure on it is how the server
/// learns that the peer is gone.
pub trait SideChannel: Send {
    /// Announces a newly published slot to the receiver.
    fn notify(&mut self, slot_index: u64) -> io::Result<()>;

    /// Closes the channel; no notification is delivered afterwards.
    fn close(&mut self);

    /// True while asynchronous work on the channel is still pending.
    fn is_in_use(&self) -> bool;
}

/// Side channel over the duplicated connection socket: each published
/// slot index is written as 8 little-endian bytes.
#[derive(Debug)]
pub struct SocketSideChannel {
    fd: Option<OwnedFd>,
}

impl SocketSideChannel {
    pub fn new(fd: OwnedFd) -> SocketSideChannel {
        SocketSideChannel { fd: Some(fd) }
    }
}

impl SideChannel for SocketSideChannel {
    fn notify(&mut self, slot_index: u64) -> io::Result<()> {
        let Some(fd) = self.fd.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel closed"));
        };
        let bytes = slot_index.to_le_bytes();
        loop {
            let written = Errno::result(unsafe {
                libc::send(
                    fd.as_raw_fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                    libc::MSG_NOSIGNAL,
                )
            });
            match written {
                Ok(_) => return Ok(()),
                // A full socket only means the receiver is slow; it will
                // pick the slot up from the ring.
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32)),
            }
        }
    }

    fn close(&mut self) {
        self.fd = None;
    }

    fn is_in_use(&self) -> bool {
        false
    }
}
