// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The SafeIPC acceptor.
//!
//! Owns the listening socket and the connection backlog. Accepting,
//! every handshake step and all teardown run inside reactor callbacks;
//! the application only observes the server software event and drains
//! completed connections with `init_next`.

use crate::backlog::ConnectionBacklog;
use crate::connection::Connection;
use crate::platform::sockets::ListeningSocket;
use safeipc_common::{read_peer_credentials, ErrorKind, OsError, UnicastAddress};
use safeipc_reactor::{Callback, DispatcherId, Events, Reactor, ReactorDispatcher, TimerManager};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Construction-time settings of an acceptor.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: UnicastAddress,
    /// Directory the socket file lives in.
    pub runtime_dir: PathBuf,
    /// Budget for a client to complete the whole handshake; restarted on
    /// every handshake state transition.
    pub establishment_timeout: Duration,
}

struct Running {
    listener: ListeningSocket,
    listener_id: DispatcherId,
    error_sweep_event: DispatcherId,
    /// Application-owned event, triggered for completed connections and
    /// for unrecoverable server faults.
    server_event: DispatcherId,
    backlog: ConnectionBacklog,
    listener_paused: bool,
}

struct ServerState {
    running: Option<Running>,
    status: Result<(), OsError>,
}

struct ServerShared {
    dispatcher: Arc<ReactorDispatcher>,
    timers: Arc<TimerManager>,
    config: ServerConfig,
    state: Mutex<ServerState>,
}

/// SafeIPC server: accepts and establishes connections to multiple
/// clients in parallel.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(reactor: &Reactor, config: ServerConfig) -> Server {
        Server {
            shared: Arc::new(ServerShared {
                dispatcher: Arc::clone(reactor.dispatcher()),
                timers: Arc::clone(reactor.timers()),
                config,
                state: Mutex::new(ServerState {
                    running: None,
                    status: Ok(()),
                }),
            }),
        }
    }

    /// Binds the server socket and starts accepting.
    ///
    /// `server_event` is triggered when a connection completes its
    /// handshake and when the server latches an unrecoverable error;
    /// multiple occurrences within one reactor cycle coalesce into one
    /// callback invocation.
    pub fn start(&self, max_s2c_buffer: u64, server_event: DispatcherId) -> Result<(), OsError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        if state.running.is_some() {
            debug_assert!(false, "server started twice");
            return Err(OsError::new(ErrorKind::Unexpected, "server already started"));
        }
        state.status = Ok(());

        let path = shared.config.address.socket_path(&shared.config.runtime_dir);
        let listener = ListeningSocket::bind(&path)?;

        let weak = Arc::downgrade(shared);
        let error_sweep_event = shared
            .dispatcher
            .register_sw(Box::new(move |_| ServerShared::on_error_sweep(&weak)))
            .map_err(OsError::from)?;

        let weak = Arc::downgrade(shared);
        let listener_id = match shared.dispatcher.register_fd(
            listener.as_raw_fd(),
            Events::READABLE,
            Box::new(move |events| ServerShared::on_listener_event(&weak, events)),
        ) {
            Ok(id) => id,
            Err(err) => {
                shared.dispatcher.unregister_sw(error_sweep_event);
                return Err(err.into());
            }
        };

        let backlog = ConnectionBacklog::new(
            Arc::clone(&shared.dispatcher),
            Arc::clone(&shared.timers),
            max_s2c_buffer,
            shared.config.establishment_timeout,
            server_event,
            error_sweep_event,
        );

        info!(
            domain = shared.config.address.domain,
            port = shared.config.address.port,
            "server started"
        );
        state.running = Some(Running {
            listener,
            listener_id,
            error_sweep_event,
            server_event,
            backlog,
            listener_paused: false,
        });
        Ok(())
    }

    /// Stops accepting and tears down every in-flight handshake. Must
    /// not be called from inside a connection-establishment timer
    /// callback.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(running) = state.running.take() else {
            return;
        };
        self.shared.dispatcher.unregister(running.listener_id);
        self.shared.dispatcher.unregister_sw(running.error_sweep_event);
        running.backlog.clear();
        info!("server stopped");
        // Dropping the listener closes the socket and removes its
        // filesystem name.
    }

    /// Latching server health. Once an unrecoverable error occurred
    /// every call returns that error until the server is restarted.
    pub fn status(&self) -> Result<(), OsError> {
        self.shared.state.lock().unwrap().status
    }

    pub fn has_established(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state
            .running
            .as_ref()
            .is_some_and(|r| r.backlog.has_established())
    }

    /// Promotes the next completed handshake into a usable connection:
    /// reads the peer identity, attaches the socket to the reactor with
    /// `events_callback` and frees the backlog slot.
    ///
    /// Precondition: the server is running and `has_established()`.
    pub fn init_next(&self, events_callback: Callback) -> Result<Connection, OsError> {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        let status_ok = state.status.is_ok();
        let Some(running) = state.running.as_mut() else {
            return Err(OsError::new(ErrorKind::Unexpected, "server not running"));
        };

        let extracted = running
            .backlog
            .next_established(|connection| connection.extract_resources())
            .flatten();
        let Some((socket, resources)) = extracted else {
            return Err(OsError::new(
                ErrorKind::Unexpected,
                "no established connection",
            ));
        };

        // The slot is consumed either way; a failure below loses only
        // this one connection, never the server.
        running.backlog.remove_last();
        ServerShared::maybe_resume_listener(running, &shared.dispatcher, status_ok);

        let peer_credentials = read_peer_credentials(&socket)?;
        let connection = Connection::new(
            socket,
            resources,
            peer_credentials,
            Arc::clone(&shared.dispatcher),
            events_callback,
        );
        match connection {
            Ok(connection) => {
                debug!(
                    peer_pid = connection.peer_credentials().pid,
                    "connection initialized"
                );
                Ok(connection)
            }
            Err(err) => {
                warn!(%err, "failed to attach established connection to reactor");
                Err(err)
            }
        }
    }
}

impl ServerShared {
    /// Reactor callback for readiness of the listening socket.
    fn on_listener_event(weak: &Weak<ServerShared>, _events: Events) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut fatal = false;
        let mut server_event = None;
        {
            let mut state = shared.state.lock().unwrap();
            if state.status.is_err() {
                return;
            }
            let Some(running) = state.running.as_mut() else {
                return;
            };
            server_event = Some(running.server_event);

            let mut latched = None;
            loop {
                if running.backlog.is_full() {
                    Self::pause_listener(running, &shared.dispatcher);
                    break;
                }
                match running.listener.accept() {
                    Ok(Some(socket)) => running.backlog.add_incoming(socket),
                    Ok(None) => break,
                    Err(errno) => {
                        let err = OsError::from_errno(errno, "accept");
                        error!(%err, "accept failed fatally; latching server status");
                        Self::pause_listener(running, &shared.dispatcher);
                        latched = Some(err);
                        fatal = true;
                        break;
                    }
                }
            }
            if let Some(err) = latched {
                state.status = Err(err);
            }
        }
        if fatal {
            if let Some(event) = server_event {
                shared.dispatcher.trigger_sw(event);
            }
        }
    }

    /// Software-event callback: sweep failed handshakes and reopen the
    /// listener if slots freed up.
    fn on_error_sweep(weak: &Weak<ServerShared>) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        let status_ok = state.status.is_ok();
        let Some(running) = state.running.as_mut() else {
            return;
        };
        let freed = running.backlog.handle_errors();
        if freed > 0 {
            Self::maybe_resume_listener(running, &shared.dispatcher, status_ok);
        }
    }

    fn pause_listener(running: &mut Running, dispatcher: &ReactorDispatcher) {
        if !running.listener_paused {
            dispatcher.set_events(running.listener_id, Events::NONE);
            running.listener_paused = true;
        }
    }

    fn maybe_resume_listener(running: &mut Running, dispatcher: &ReactorDispatcher, status_ok: bool) {
        if running.listener_paused && status_ok && !running.backlog.is_full() {
            dispatcher.set_events(running.listener_id, Events::READABLE);
            running.listener_paused = false;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safeipc_reactor::Reactor;

    fn config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            address: UnicastAddress::new(1, 1),
            runtime_dir: dir.to_path_buf(),
            establishment_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn start_in_missing_directory_reports_address_error() {
        let reactor = Reactor::new(8).unwrap();
        let server = Server::new(
            &reactor,
            ServerConfig {
                address: UnicastAddress::new(1, 1),
                runtime_dir: PathBuf::from("/nonexistent-dir-for-safeipc-test"),
                establishment_timeout: Duration::from_millis(200),
            },
        );
        let event = reactor.dispatcher().register_sw(Box::new(|_| {})).unwrap();
        let err = server.start(1024 * 1024, event).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AddressNotAvailable);
    }

    #[test]
    fn start_stop_removes_socket_file_and_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let reactor = Reactor::new(64).unwrap();
        let server = Server::new(&reactor, config(dir.path()));
        let event = reactor.dispatcher().register_sw(Box::new(|_| {})).unwrap();

        server.start(1024 * 1024, event).unwrap();
        let path = UnicastAddress::new(1, 1).socket_path(dir.path());
        assert!(path.exists());
        assert!(server.status().is_ok());
        assert!(!server.has_established());

        server.stop();
        assert!(!path.exists());

        server.start(1024 * 1024, event).unwrap();
        assert!(path.exists());
        server.stop();
    }

    #[test]
    fn init_next_without_established_connection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reactor = Reactor::new(64).unwrap();
        let server = Server::new(&reactor, config(dir.path()));
        let event = reactor.dispatcher().register_sw(Box::new(|_| {})).unwrap();
        server.start(1024 * 1024, event).unwrap();
        assert!(server.init_next(Box::new(|_| {})).is_err());
    }
}
