// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity pool of in-flight handshakes.
//!
//! The backlog owns every `IncomingConnection`. Handshake callbacks
//! reach their connection through a weak backlog handle plus slot index;
//! completion and failure are reported to the owner as coalesced
//! software events.

use crate::incoming::{IncomingConnection, Outcome};
use safeipc_reactor::{DispatcherId, Events, ReactorDispatcher, TimerManager};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Maximum number of connections being established in parallel.
pub const BACKLOG_SIZE: usize = 32;

struct BacklogState {
    slots: Vec<Option<IncomingConnection>>,
    free_slots: usize,
    established_count: usize,
    last_returned: Option<usize>,
}

pub(crate) struct BacklogShared {
    dispatcher: Arc<ReactorDispatcher>,
    timers: Arc<TimerManager>,
    max_s2c_buffer: u64,
    establishment_timeout: Duration,
    /// Triggered when a handshake completes; owned by the application.
    established_event: DispatcherId,
    /// Triggered when a handshake fails; owned by the acceptor server.
    error_event: DispatcherId,
    state: Mutex<BacklogState>,
}

/// Pool of incoming client connection requests being established in
/// parallel.
pub struct ConnectionBacklog {
    shared: Arc<BacklogShared>,
}

impl ConnectionBacklog {
    pub(crate) fn new(
        dispatcher: Arc<ReactorDispatcher>,
        timers: Arc<TimerManager>,
        max_s2c_buffer: u64,
        establishment_timeout: Duration,
        established_event: DispatcherId,
        error_event: DispatcherId,
    ) -> ConnectionBacklog {
        let mut slots = Vec::with_capacity(BACKLOG_SIZE);
        slots.resize_with(BACKLOG_SIZE, || None);
        ConnectionBacklog {
            shared: Arc::new(BacklogShared {
                dispatcher,
                timers,
                max_s2c_buffer,
                establishment_timeout,
                established_event,
                error_event,
                state: Mutex::new(BacklogState {
                    slots,
                    free_slots: BACKLOG_SIZE,
                    established_count: 0,
                    last_returned: None,
                }),
            }),
        }
    }

    pub fn is_full(&self) -> bool {
        self.shared.state.lock().unwrap().free_slots == 0
    }

    pub fn free_slots(&self) -> usize {
        self.shared.state.lock().unwrap().free_slots
    }

    pub fn has_established(&self) -> bool {
        self.shared.state.lock().unwrap().established_count != 0
    }

    /// Places an accepted socket into a free slot and starts its
    /// handshake: socket registered for read events, establishment timer
    /// armed.
    ///
    /// Precondition: the backlog is not full.
    pub fn add_incoming(&self, socket: OwnedFd) {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        let Some(index) = state.slots.iter().position(Option::is_none) else {
            debug_assert!(false, "add_incoming on a full backlog");
            return;
        };

        let mut connection = IncomingConnection::new(socket, shared.max_s2c_buffer);
        let weak = Arc::downgrade(shared);
        let register_result = shared.dispatcher.register_fd(
            connection.socket_fd().expect("fresh connection owns its socket"),
            Events::READABLE,
            Box::new(move |events| BacklogShared::on_socket_event(&weak, index, events)),
        );

        match register_result {
            Ok(id) => {
                connection.reactor_id = Some(id);
                let weak = Arc::downgrade(shared);
                let timer_id = shared.timers.arm(
                    Instant::now() + shared.establishment_timeout,
                    Box::new(move || BacklogShared::on_establishment_timeout(&weak, index)),
                );
                connection.timer_id = Some(timer_id);
                trace!(index, "handshake started");
                state.slots[index] = Some(connection);
                state.free_slots -= 1;
            }
            Err(err) => {
                // No dispatcher slot for the socket: the handshake cannot
                // run. Occupy the slot in error state so the regular error
                // sweep accounts for it.
                debug!(%err, "no dispatcher slot for accepted connection");
                connection.fail(&shared.dispatcher, &shared.timers);
                state.slots[index] = Some(connection);
                state.free_slots -= 1;
                drop(state);
                self.shared.notify_error();
            }
        }
    }

    /// Runs `f` on the next established connection and remembers it as
    /// the cursor for `remove_last`.
    ///
    /// Precondition: `has_established()`.
    pub(crate) fn next_established<R>(
        &self,
        f: impl FnOnce(&mut IncomingConnection) -> R,
    ) -> Option<R> {
        let mut state = self.shared.state.lock().unwrap();
        let index = state
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|c| c.is_established()))?;
        state.last_returned = Some(index);
        let connection = state.slots[index].as_mut().expect("slot checked above");
        Some(f(connection))
    }

    /// Destroys the connection last returned by `next_established` and
    /// frees its slot.
    pub fn remove_last(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(index) = state.last_returned.take() else {
            return;
        };
        if let Some(mut connection) = state.slots[index].take() {
            if connection.is_established() {
                state.established_count -= 1;
            }
            connection.release(&self.shared.dispatcher, &self.shared.timers);
            state.free_slots += 1;
        }
    }

    /// Destroys every connection in error state. Returns the number of
    /// freed slots.
    pub fn handle_errors(&self) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let mut freed = 0;
        for index in 0..state.slots.len() {
            let is_error = state.slots[index]
                .as_ref()
                .is_some_and(IncomingConnection::has_error);
            if is_error {
                if let Some(mut connection) = state.slots[index].take() {
                    connection.release(&self.shared.dispatcher, &self.shared.timers);
                }
                state.free_slots += 1;
                if state.last_returned == Some(index) {
                    state.last_returned = None;
                }
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(freed, "swept failed handshakes");
        }
        freed
    }

    /// Aborts every in-flight handshake and releases all slots. Used on
    /// server stop.
    pub(crate) fn clear(&self) {
        let mut state = self.shared.state.lock().unwrap();
        for slot in state.slots.iter_mut() {
            if let Some(mut connection) = slot.take() {
                connection.release(&self.shared.dispatcher, &self.shared.timers);
            }
        }
        state.free_slots = BACKLOG_SIZE;
        state.established_count = 0;
        state.last_returned = None;
    }

    #[cfg(test)]
    pub(crate) fn established_count(&self) -> usize {
        self.shared.state.lock().unwrap().established_count
    }
}

impl Drop for ConnectionBacklog {
    fn drop(&mut self) {
        // Releases dispatcher and timer registrations of any connection
        // still in flight.
        self.clear();
    }
}

impl BacklogShared {
    /// Reactor callback for one in-flight handshake socket.
    fn on_socket_event(weak: &Weak<BacklogShared>, index: usize, events: Events) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let outcome = {
            let mut state = shared.state.lock().unwrap();
            let Some(connection) = state.slots[index].as_mut() else {
                return;
            };
            let step = connection.handle_socket_event(events, &shared.dispatcher, &shared.timers);
            match step.outcome {
                Outcome::Established => {
                    state.established_count += 1;
                }
                Outcome::Pending if step.transitioned => {
                    // Timeout restarts on every handshake transition.
                    let weak = weak.clone();
                    let timer_id = shared.timers.arm(
                        Instant::now() + shared.establishment_timeout,
                        Box::new(move || BacklogShared::on_establishment_timeout(&weak, index)),
                    );
                    if let Some(connection) = state.slots[index].as_mut() {
                        if let Some(old) = connection.timer_id.replace(timer_id) {
                            shared.timers.cancel(old);
                        }
                    }
                }
                _ => {}
            }
            step.outcome
        };
        match outcome {
            Outcome::Established => shared.notify_established(),
            Outcome::Failed => shared.notify_error(),
            Outcome::Pending => {}
        }
    }

    /// Timer callback: the client did not complete the handshake in
    /// time.
    fn on_establishment_timeout(weak: &Weak<BacklogShared>, index: usize) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let failed = {
            let mut state = shared.state.lock().unwrap();
            match state.slots[index].as_mut() {
                Some(connection)
                    if !connection.is_established() && !connection.has_error() =>
                {
                    debug!(index, "handshake timed out");
                    connection.fail(&shared.dispatcher, &shared.timers);
                    true
                }
                _ => false,
            }
        };
        if failed {
            shared.notify_error();
        }
    }

    fn notify_established(&self) {
        self.dispatcher.trigger_sw(self.established_event);
    }

    fn notify_error(&self) {
        self.dispatcher.trigger_sw(self.error_event);
    }
}
