// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-client handshake state machine.
//!
//! Driven entirely by reactor callbacks: socket readiness advances the
//! exchange, the establishment timer aborts it. Terminal states are
//! `Established` (resources extractable) and `Error` (resources
//! released).

use crate::channel::IpcChannelResources;
use crate::platform::shm::NamedShmHandle;
use crate::platform::shm::ShmId;
use crate::protocol::{
    agree_s2c_size, ClientToServer1, ClientToServer2, FrameReader, FrameWriter, ProtocolVersion,
    ReadProgress, ServerToClient1, WriteProgress, NOTIFICATION_RING_SIZE, PROTOCOL_VERSION,
};
use safeipc_reactor::{DispatcherId, Events, ReactorDispatcher, TimerId, TimerManager};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    WaitingClientToServer1,
    SendingServerToClient1,
    WaitingClientToServer2,
    Established,
    Error,
}

/// What a socket-event pass ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Still in flight; `transitioned` on the step says whether the
    /// establishment timer has to be re-armed.
    Pending,
    Established,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Step {
    pub transitioned: bool,
    pub outcome: Outcome,
}

/// An accepted client connection whose handshake is in flight.
pub struct IncomingConnection {
    state: HandshakeState,
    socket: Option<OwnedFd>,
    pub(crate) reactor_id: Option<DispatcherId>,
    pub(crate) timer_id: Option<TimerId>,
    reader: FrameReader,
    writer: Option<FrameWriter>,
    max_s2c_buffer: u64,
    protocol: Option<ProtocolVersion>,
    c2s_shm_id: Option<ShmId>,
    s2c_region: Option<NamedShmHandle>,
    notification_region: Option<NamedShmHandle>,
    agreed_s2c_size: u64,
}

impl IncomingConnection {
    pub(crate) fn new(socket: OwnedFd, max_s2c_buffer: u64) -> IncomingConnection {
        IncomingConnection {
            state: HandshakeState::WaitingClientToServer1,
            socket: Some(socket),
            reactor_id: None,
            timer_id: None,
            reader: FrameReader::default(),
            writer: None,
            max_s2c_buffer,
            protocol: None,
            c2s_shm_id: None,
            s2c_region: None,
            notification_region: None,
            agreed_s2c_size: 0,
        }
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn has_error(&self) -> bool {
        self.state == HandshakeState::Error
    }

    pub(crate) fn socket_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Advances the handshake on socket readiness. Called from the
    /// reactor callback registered for the accepted socket.
    pub(crate) fn handle_socket_event(
        &mut self,
        events: Events,
        dispatcher: &ReactorDispatcher,
        timers: &TimerManager,
    ) -> Step {
        if events.contains(Events::ERROR) {
            debug!("handshake socket error event");
            self.fail(dispatcher, timers);
            return Step {
                transitioned: true,
                outcome: Outcome::Failed,
            };
        }

        let before = self.state;
        let result = match self.state {
            HandshakeState::WaitingClientToServer1 => self.drive_receiving(dispatcher),
            HandshakeState::SendingServerToClient1 => self.drive_sending(dispatcher),
            HandshakeState::WaitingClientToServer2 => self.drive_receiving(dispatcher),
            // Terminal; spurious events after unregister are possible
            // within one reactor cycle and ignored.
            HandshakeState::Established | HandshakeState::Error => return Step {
                transitioned: false,
                outcome: Outcome::Pending,
            },
        };

        match result {
            Ok(()) => {}
            Err(()) => {
                self.fail(dispatcher, timers);
                return Step {
                    transitioned: true,
                    outcome: Outcome::Failed,
                };
            }
        }

        if self.state == HandshakeState::Established {
            self.finish(dispatcher, timers);
            return Step {
                transitioned: true,
                outcome: Outcome::Established,
            };
        }

        // A hangup without a completed handshake is a peer fault; data
        // already buffered was processed above.
        if events.contains(Events::HANGUP) {
            debug!("peer hung up during handshake");
            self.fail(dispatcher, timers);
            return Step {
                transitioned: true,
                outcome: Outcome::Failed,
            };
        }

        Step {
            transitioned: self.state != before,
            outcome: Outcome::Pending,
        }
    }

    /// Reads and processes as many frames as the socket has, for both
    /// receive states.
    fn drive_receiving(&mut self, dispatcher: &ReactorDispatcher) -> Result<(), ()> {
        let fd = self.socket_fd().ok_or(())?;
        let progress = self.reader.fill(fd).map_err(|errno| {
            debug!(%errno, "handshake read failed");
        })?;

        self.process_buffered(dispatcher)?;

        if progress == ReadProgress::Eof
            && self.state != HandshakeState::Established
        {
            debug!("peer closed before completing handshake");
            return Err(());
        }
        Ok(())
    }

    fn process_buffered(&mut self, dispatcher: &ReactorDispatcher) -> Result<(), ()> {
        loop {
            if self.state != HandshakeState::WaitingClientToServer1
                && self.state != HandshakeState::WaitingClientToServer2
            {
                return Ok(());
            }
            let frame = self.reader.take_frame().map_err(|err| {
                debug!(%err, "handshake framing violation");
            })?;
            let Some(payload) = frame else {
                return Ok(());
            };
            match self.state {
                HandshakeState::WaitingClientToServer1 => {
                    self.on_client_to_server_1(&payload, dispatcher)?
                }
                HandshakeState::WaitingClientToServer2 => self.on_client_to_server_2(&payload)?,
                _ => return Err(()),
            }
        }
    }

    fn on_client_to_server_1(
        &mut self,
        payload: &[u8],
        dispatcher: &ReactorDispatcher,
    ) -> Result<(), ()> {
        let message = ClientToServer1::decode(payload).map_err(|err| {
            debug!(%err, "malformed first client message");
        })?;
        if !message.version.is_compatible(&PROTOCOL_VERSION) {
            debug!(
                client_major = message.version.major,
                server_major = PROTOCOL_VERSION.major,
                "incompatible protocol version"
            );
            return Err(());
        }

        let agreed = agree_s2c_size(message.requested_s2c_size, self.max_s2c_buffer);
        let s2c_region = NamedShmHandle::create(agreed as usize).map_err(|err| {
            warn!(%err, "failed to create server-to-client region");
        })?;
        let notification_region =
            NamedShmHandle::create(NOTIFICATION_RING_SIZE).map_err(|err| {
                warn!(%err, "failed to create notification region");
            })?;

        let reply = ServerToClient1 {
            agreed_s2c_size: agreed,
            s2c_shm_id: s2c_region.id(),
            notification_shm_id: notification_region.id(),
        };
        trace!(agreed, "first client message accepted");

        self.protocol = Some(message.version);
        self.c2s_shm_id = Some(message.c2s_shm_id);
        self.s2c_region = Some(s2c_region);
        self.notification_region = Some(notification_region);
        self.agreed_s2c_size = agreed;
        self.writer = Some(FrameWriter::new(reply.encode()));
        self.state = HandshakeState::SendingServerToClient1;
        self.drive_sending(dispatcher)
    }

    fn drive_sending(&mut self, dispatcher: &ReactorDispatcher) -> Result<(), ()> {
        let fd = self.socket_fd().ok_or(())?;
        let writer = self.writer.as_mut().ok_or(())?;
        match writer.flush(fd) {
            Ok(WriteProgress::Done) => {
                self.writer = None;
                self.state = HandshakeState::WaitingClientToServer2;
                if let Some(id) = self.reactor_id {
                    dispatcher.set_events(id, Events::READABLE);
                }
                // The acknowledgment may already sit in the read buffer.
                self.process_buffered(dispatcher)
            }
            Ok(WriteProgress::Pending) => {
                if let Some(id) = self.reactor_id {
                    dispatcher.set_events(id, Events::WRITABLE);
                }
                Ok(())
            }
            Err(errno) => {
                debug!(%errno, "handshake write failed");
                Err(())
            }
        }
    }

    fn on_client_to_server_2(&mut self, payload: &[u8]) -> Result<(), ()> {
        ClientToServer2::decode(payload).map_err(|err| {
            debug!(%err, "malformed second client message");
        })?;
        // The peer has both regions open; the server-to-client name can
        // go, the region lives on anonymously.
        if let Some(region) = self.s2c_region.as_mut() {
            region.unlink();
        }
        self.state = HandshakeState::Established;
        Ok(())
    }

    /// Terminal success: stop monitoring and keep resources for
    /// extraction.
    fn finish(&mut self, dispatcher: &ReactorDispatcher, timers: &TimerManager) {
        if let Some(id) = self.reactor_id.take() {
            dispatcher.unregister(id);
        }
        if let Some(id) = self.timer_id.take() {
            timers.cancel(id);
        }
    }

    /// Terminal failure: release everything not extracted yet.
    pub(crate) fn fail(&mut self, dispatcher: &ReactorDispatcher, timers: &TimerManager) {
        self.release(dispatcher, timers);
        self.state = HandshakeState::Error;
    }

    /// Releases owned resources; used on failure and on server stop.
    /// Dropping the region handles unlinks any still-linked names.
    pub(crate) fn release(&mut self, dispatcher: &ReactorDispatcher, timers: &TimerManager) {
        if let Some(id) = self.reactor_id.take() {
            dispatcher.unregister(id);
        }
        if let Some(id) = self.timer_id.take() {
            timers.cancel(id);
        }
        self.socket = None;
        self.writer = None;
        self.s2c_region = None;
        self.notification_region = None;
    }

    /// Takes the socket and channel resources out of an established
    /// connection.
    pub(crate) fn extract_resources(&mut self) -> Option<(OwnedFd, IpcChannelResources)> {
        if self.state != HandshakeState::Established {
            return None;
        }
        let socket = self.socket.take()?;
        let resources = IpcChannelResources {
            protocol: self.protocol?,
            s2c_buffer_size: self.agreed_s2c_size,
            c2s_shm_id: self.c2s_shm_id?,
            s2c_region: self.s2c_region.take()?,
            notification_region: self.notification_region.take()?,
        };
        Some((socket, resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::shm::{NamedShmHandle, SHM_ID_LEN};
    use crate::protocol::MIN_BUFFER_SIZE;
    use safeipc_reactor::Reactor;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, OwnedFd) {
        let (client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server.into())
    }

    fn harness() -> Reactor {
        Reactor::new(8).unwrap()
    }

    fn first_message(requested: u64) -> ClientToServer1 {
        ClientToServer1 {
            version: PROTOCOL_VERSION,
            requested_s2c_size: requested,
            c2s_shm_id: ShmId::from_bytes([3; SHM_ID_LEN]),
        }
    }

    fn drive(conn: &mut IncomingConnection, reactor: &Reactor, events: Events) -> Step {
        conn.handle_socket_event(events, reactor.dispatcher(), reactor.timers())
    }

    fn read_server_reply(client: &mut UnixStream) -> ServerToClient1 {
        let mut frame = vec![0u8; 4 + ServerToClient1::WIRE_SIZE];
        client.read_exact(&mut frame).unwrap();
        ServerToClient1::decode(&frame[4..]).unwrap()
    }

    #[test]
    fn happy_path_produces_established_resources() {
        let reactor = harness();
        let (mut client, server) = pair();
        let mut conn = IncomingConnection::new(server, 1024 * 1024);

        client.write_all(&first_message(8192).encode()).unwrap();
        let step = drive(&mut conn, &reactor, Events::READABLE);
        assert_eq!(step.outcome, Outcome::Pending);
        assert_eq!(conn.state(), HandshakeState::WaitingClientToServer2);

        let reply = read_server_reply(&mut client);
        assert_eq!(reply.agreed_s2c_size, 8192);

        // Both regions are openable before the acknowledgment.
        let s2c = NamedShmHandle::open(reply.s2c_shm_id).unwrap();
        assert!(s2c.size() >= 8192);
        drop(s2c);
        NamedShmHandle::open(reply.notification_shm_id).unwrap();

        client.write_all(&ClientToServer2.encode()).unwrap();
        let step = drive(&mut conn, &reactor, Events::READABLE);
        assert_eq!(step.outcome, Outcome::Established);

        let (_socket, resources) = conn.extract_resources().unwrap();
        assert_eq!(resources.c2s_shm_id, ShmId::from_bytes([3; SHM_ID_LEN]));
        assert_eq!(resources.s2c_shm_id(), reply.s2c_shm_id);
        assert_eq!(resources.notification_shm_id(), reply.notification_shm_id);
        assert_eq!(resources.s2c_buffer_size, 8192);

        // The server-to-client name is unlinked after the acknowledgment,
        // the notification name is not.
        assert!(NamedShmHandle::open(reply.s2c_shm_id).is_err());
        assert!(NamedShmHandle::open(reply.notification_shm_id).is_ok());
    }

    #[test]
    fn request_below_minimum_is_served_minimum() {
        let reactor = harness();
        let (mut client, server) = pair();
        let mut conn = IncomingConnection::new(server, 1024 * 1024);

        client.write_all(&first_message(16).encode()).unwrap();
        drive(&mut conn, &reactor, Events::READABLE);
        let reply = read_server_reply(&mut client);
        assert_eq!(reply.agreed_s2c_size, MIN_BUFFER_SIZE);
    }

    #[test]
    fn request_above_hint_is_clamped() {
        let reactor = harness();
        let (mut client, server) = pair();
        let mut conn = IncomingConnection::new(server, 64 * 1024);

        client.write_all(&first_message(u64::MAX).encode()).unwrap();
        drive(&mut conn, &reactor, Events::READABLE);
        let reply = read_server_reply(&mut client);
        assert_eq!(reply.agreed_s2c_size, 64 * 1024);
    }

    #[test]
    fn version_mismatch_fails_before_any_region_exists() {
        let reactor = harness();
        let (mut client, server) = pair();
        let mut conn = IncomingConnection::new(server, 1024 * 1024);

        let mut message = first_message(8192);
        message.version = ProtocolVersion { major: 2, minor: 0 };
        client.write_all(&message.encode()).unwrap();

        let step = drive(&mut conn, &reactor, Events::READABLE);
        assert_eq!(step.outcome, Outcome::Failed);
        assert!(conn.has_error());
        // No reply was sent and nothing was provisioned.
        client.set_nonblocking(true).unwrap();
        let mut buffer = [0u8; 16];
        match client.read(&mut buffer) {
            Ok(0) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_fails_handshake() {
        let reactor = harness();
        let (mut client, server) = pair();
        let mut conn = IncomingConnection::new(server, 1024 * 1024);

        // Valid length prefix, truncated payload for the state.
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&3u32.to_le_bytes());
        bogus.extend_from_slice(&[1, 2, 3]);
        client.write_all(&bogus).unwrap();

        let step = drive(&mut conn, &reactor, Events::READABLE);
        assert_eq!(step.outcome, Outcome::Failed);
    }

    #[test]
    fn peer_close_before_first_message_fails() {
        let reactor = harness();
        let (client, server) = pair();
        let mut conn = IncomingConnection::new(server, 1024 * 1024);
        drop(client);
        let step = drive(&mut conn, &reactor, Events::READABLE | Events::HANGUP);
        assert_eq!(step.outcome, Outcome::Failed);
    }

    #[test]
    fn batched_messages_complete_in_one_pass() {
        let reactor = harness();
        let (mut client, server) = pair();
        let mut conn = IncomingConnection::new(server, 1024 * 1024);

        // The acknowledgment arrives glued to the first message. The
        // server processes it right after sending its reply.
        let mut bytes = first_message(4096).encode();
        bytes.extend_from_slice(&ClientToServer2.encode());
        client.write_all(&bytes).unwrap();

        let step = drive(&mut conn, &reactor, Events::READABLE);
        assert_eq!(step.outcome, Outcome::Established);
        let reply = read_server_reply(&mut client);
        assert_eq!(reply.agreed_s2c_size, 4096);
    }
}
