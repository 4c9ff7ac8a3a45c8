// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::channel::IpcChannelResources;
use safeipc_common::{Credentials, ErrorKind, OsError};
use safeipc_reactor::{Callback, DispatcherId, Events, ReactorDispatcher};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// A fully established SafeIPC connection.
///
/// Produced by `Server::init_next` from a completed handshake: the
/// socket is attached to the reactor, the shared-memory resources are
/// owned here and the peer identity has been read from the socket.
pub struct Connection {
    socket: Option<OwnedFd>,
    resources: IpcChannelResources,
    peer_credentials: Credentials,
    dispatcher: Arc<ReactorDispatcher>,
    reactor_id: Option<DispatcherId>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_credentials)
            .field("resources", &self.resources)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        socket: OwnedFd,
        resources: IpcChannelResources,
        peer_credentials: Credentials,
        dispatcher: Arc<ReactorDispatcher>,
        events_callback: Callback,
    ) -> Result<Connection, OsError> {
        let reactor_id = dispatcher
            .register_fd(socket.as_raw_fd(), Events::READABLE, events_callback)
            .map_err(OsError::from)?;
        Ok(Connection {
            socket: Some(socket),
            resources,
            peer_credentials,
            dispatcher,
            reactor_id: Some(reactor_id),
        })
    }

    pub fn peer_credentials(&self) -> Credentials {
        self.peer_credentials
    }

    pub fn resources(&self) -> &IpcChannelResources {
        &self.resources
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Duplicates the connection socket for an out-of-band writer (the
    /// zero-copy side channel delivers slot notifications through it).
    pub fn notification_writer(&self) -> Result<OwnedFd, OsError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| OsError::new(ErrorKind::Unexpected, "connection already closed"))?;
        socket
            .try_clone()
            .map_err(|e| OsError::from_io(&e, "dup connection socket"))
    }

    /// Adjusts the monitored readiness of the connection socket.
    pub fn set_events(&self, events: Events) {
        if let Some(id) = self.reactor_id {
            self.dispatcher.set_events(id, events);
        }
    }

    /// Detaches from the reactor and closes the socket. The
    /// shared-memory resources are released when the connection is
    /// dropped.
    pub fn close(&mut self) {
        if let Some(id) = self.reactor_id.take() {
            self.dispatcher.unregister(id);
        }
        self.socket = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
