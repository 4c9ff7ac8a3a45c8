// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use std::io;

/// Category of an operating-system-level failure.
///
/// Every fallible server operation maps its OS errors onto exactly one of
/// these kinds. `Resource` is the only kind that latches a running server
/// (see `safeipc_ipc::server`); per-peer faults are never reported through
/// this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Error that maps to no other category.
    Unexpected,
    /// The caller lacks the privileges for the operation.
    Privileges,
    /// The requested address is not available or already in use.
    AddressNotAvailable,
    /// A system resource limit was reached.
    Resource,
    /// The file system does not support a required operation or failed.
    FsEnv,
}

/// An OS-level error with its classified kind.
///
/// Carries the raw errno so latched server status can be cloned out to
/// every caller of `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{context}: {kind:?} (errno: {errno:?})")]
pub struct OsError {
    pub kind: ErrorKind,
    pub context: &'static str,
    pub errno: Option<Errno>,
}

impl OsError {
    pub fn new(kind: ErrorKind, context: &'static str) -> Self {
        Self {
            kind,
            context,
            errno: None,
        }
    }

    pub fn from_errno(errno: Errno, context: &'static str) -> Self {
        Self {
            kind: classify_errno(errno),
            context,
            errno: Some(errno),
        }
    }

    pub fn from_io(err: &io::Error, context: &'static str) -> Self {
        match err.raw_os_error() {
            Some(raw) => Self::from_errno(Errno::from_raw(raw), context),
            None => Self::new(ErrorKind::Unexpected, context),
        }
    }
}

/// Maps an errno onto the five-kind taxonomy.
pub fn classify_errno(errno: Errno) -> ErrorKind {
    match errno {
        Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM | Errno::EAGAIN => {
            ErrorKind::Resource
        }
        Errno::EACCES | Errno::EPERM => ErrorKind::Privileges,
        Errno::EADDRINUSE | Errno::EADDRNOTAVAIL | Errno::ENOENT | Errno::ENOTDIR => {
            ErrorKind::AddressNotAvailable
        }
        Errno::EROFS | Errno::EIO | Errno::ENOTSUP | Errno::ENOSPC | Errno::EFBIG => {
            ErrorKind::FsEnv
        }
        _ => ErrorKind::Unexpected,
    }
}
