// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client side of the connection establishment.
//!
//! Connects to a server address, runs the three-message handshake and
//! maps all three shared-memory rings. Unlike the server side this is
//! plain blocking IO: a connecting client has nothing else to do until
//! the server answers.

use crate::channel::IpcChannelResources;
use crate::platform::shm::{MappedMem, NamedShmHandle};
use crate::protocol::{
    agree_s2c_size, ClientToServer1, ClientToServer2, ServerToClient1, ProtocolVersion,
    MIN_BUFFER_SIZE, PROTOCOL_VERSION,
};
use safeipc_common::{ErrorKind, OsError, UnicastAddress};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Tunables of one connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Requested server-to-client ring size; the server clamps it into
    /// its own limits, never below the protocol minimum.
    pub requested_s2c_size: u64,
    /// Size of the client-created client-to-server ring.
    pub c2s_size: usize,
    /// Socket read/write budget for each handshake step.
    pub io_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            requested_s2c_size: MIN_BUFFER_SIZE,
            c2s_size: MIN_BUFFER_SIZE as usize,
            io_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// An established client-side connection with all three rings mapped.
#[derive(Debug)]
pub struct ClientConnection {
    socket: UnixStream,
    /// Created by this client; the name is removed when the connection
    /// is dropped.
    c2s_region: MappedMem,
    s2c_region: MappedMem,
    notification_region: MappedMem,
    agreed_s2c_size: u64,
    protocol: ProtocolVersion,
}

impl ClientConnection {
    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    pub fn c2s_region(&self) -> &MappedMem {
        &self.c2s_region
    }

    pub fn s2c_region(&self) -> &MappedMem {
        &self.s2c_region
    }

    pub fn notification_region(&self) -> &MappedMem {
        &self.notification_region
    }

    pub fn agreed_s2c_size(&self) -> u64 {
        self.agreed_s2c_size
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Reads one slot-notification index from the connection socket (the
    /// zero-copy side channel writes these).
    pub fn read_slot_notification(&mut self) -> Result<u64, OsError> {
        let mut bytes = [0u8; 8];
        self.socket
            .read_exact(&mut bytes)
            .map_err(|e| OsError::from_io(&e, "notification read"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// True if the server-side resources describe this very connection.
    pub fn matches_resources(&self, resources: &IpcChannelResources) -> bool {
        self.c2s_region.id() == resources.c2s_shm_id
            && self.s2c_region.id() == resources.s2c_shm_id()
            && self.notification_region.id() == resources.notification_shm_id()
            && self.agreed_s2c_size == resources.s2c_buffer_size
    }
}

/// Connects to the server at `address` and establishes a connection.
pub fn connect(
    address: UnicastAddress,
    runtime_dir: &Path,
    options: ConnectOptions,
) -> Result<ClientConnection, OsError> {
    let path = address.socket_path(runtime_dir);
    let mut socket =
        UnixStream::connect(&path).map_err(|e| OsError::from_io(&e, "connect"))?;
    socket
        .set_read_timeout(options.io_timeout)
        .map_err(|e| OsError::from_io(&e, "socket timeout"))?;
    socket
        .set_write_timeout(options.io_timeout)
        .map_err(|e| OsError::from_io(&e, "socket timeout"))?;

    let c2s_region = NamedShmHandle::create(options.c2s_size)?.map()?;

    socket
        .write_all(
            &ClientToServer1 {
                version: PROTOCOL_VERSION,
                requested_s2c_size: options.requested_s2c_size,
                c2s_shm_id: c2s_region.id(),
            }
            .encode(),
        )
        .map_err(|e| OsError::from_io(&e, "handshake write"))?;

    let mut frame = [0u8; 4 + ServerToClient1::WIRE_SIZE];
    socket
        .read_exact(&mut frame)
        .map_err(|e| OsError::from_io(&e, "handshake read"))?;
    let reply = ServerToClient1::decode(&frame[4..])
        .map_err(|_| OsError::new(ErrorKind::Unexpected, "malformed server reply"))?;
    debug!(agreed = reply.agreed_s2c_size, "server accepted connection");

    // Sanity: the server must obey the size agreement we can compute
    // ourselves only partially (we do not know its configured maximum).
    if reply.agreed_s2c_size < MIN_BUFFER_SIZE
        || reply.agreed_s2c_size > agree_s2c_size(options.requested_s2c_size, u64::MAX)
    {
        return Err(OsError::new(ErrorKind::Unexpected, "server size agreement"));
    }

    let s2c_region = NamedShmHandle::open(reply.s2c_shm_id)?.map()?;
    let notification_region = NamedShmHandle::open(reply.notification_shm_id)?.map()?;

    socket
        .write_all(&ClientToServer2.encode())
        .map_err(|e| OsError::from_io(&e, "handshake write"))?;

    Ok(ClientConnection {
        socket,
        c2s_region,
        s2c_region,
        notification_region,
        agreed_s2c_size: reply.agreed_s2c_size,
        protocol: PROTOCOL_VERSION,
    })
}
