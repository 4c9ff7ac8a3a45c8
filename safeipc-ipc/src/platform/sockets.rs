// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use safeipc_common::OsError;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// A bound, listening Unix domain socket. The filesystem name is removed
/// again when the socket is dropped.
#[derive(Debug)]
pub struct ListeningSocket {
    fd: OwnedFd,
    path: PathBuf,
}

impl ListeningSocket {
    /// Creates, binds and starts listening on `path`.
    ///
    /// A stale socket file from a previous crashed instance is detected by
    /// the bind failing; recovery policy (removing the file) is left to
    /// the deployment, matching the address-in-use error contract.
    pub fn bind(path: &Path) -> Result<ListeningSocket, OsError> {
        let sock = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| OsError::from_errno(e, "socket"))?;
        let addr = UnixAddr::new(path).map_err(|e| OsError::from_errno(e, "socket address"))?;
        bind(sock.as_raw_fd(), &addr).map_err(|e| OsError::from_errno(e, "bind"))?;
        // 128 trips the range check in nix 0.29, see nix-rust/nix#2500.
        let backlog = Backlog::new(127).map_err(|e| OsError::from_errno(e, "listen backlog"))?;
        if let Err(errno) = listen(&sock, backlog) {
            _ = std::fs::remove_file(path);
            return Err(OsError::from_errno(errno, "listen"));
        }
        Ok(ListeningSocket {
            fd: sock,
            path: path.to_path_buf(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Accepts one pending connection without blocking.
    ///
    /// `Ok(None)` means no connection is pending (or the accept was
    /// interrupted); any other error is returned for classification by
    /// the caller.
    pub fn accept(&self) -> Result<Option<OwnedFd>, Errno> {
        loop {
            match accept4(
                self.fd.as_raw_fd(),
                SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            ) {
                Ok(fd) => return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
                Err(Errno::EAGAIN) => return Ok(None),
                Err(Errno::EINTR) => continue,
                // The connection died between readiness and accept.
                Err(Errno::ECONNABORTED) => return Ok(None),
                Err(errno) => return Err(errno),
            }
        }
    }
}

impl Drop for ListeningSocket {
    fn drop(&mut self) {
        _ = std::fs::remove_file(&self.path);
    }
}
