// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::OsError;
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::os::fd::AsFd;

/// Identity of the process on the other end of a Unix domain socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Reads `SO_PEERCRED` of a connected Unix domain socket.
pub fn read_peer_credentials<F: AsFd>(socket: &F) -> Result<Credentials, OsError> {
    let creds =
        getsockopt(socket, PeerCredentials).map_err(|e| OsError::from_errno(e, "SO_PEERCRED"))?;
    Ok(Credentials {
        uid: creds.uid(),
        gid: creds.gid(),
        pid: creds.pid(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn loopback_pair_reports_own_identity() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = read_peer_credentials(&a).unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid, nix::unistd::getgid().as_raw());
        assert_eq!(creds.pid, nix::unistd::getpid().as_raw());
    }
}
