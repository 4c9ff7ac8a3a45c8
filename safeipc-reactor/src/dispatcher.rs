// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::events::Events;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token, Waker};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Callback invoked with the readiness that occurred.
pub type Callback = Box<dyn FnMut(Events) + Send>;

/// Identifier for a registered callback.
///
/// Opaque to users; the sequence number makes identifiers of reused slots
/// distinguishable so that a stale id can never reach a foreign callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatcherId {
    pub(crate) index: usize,
    pub(crate) sequence: u64,
}

/// The only failure a registration can report: no free dispatcher slot or
/// no free poller slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("no free dispatcher or poller slot")]
    Resource,
}

impl From<RegisterError> for safeipc_common::OsError {
    fn from(_: RegisterError) -> Self {
        safeipc_common::OsError::new(safeipc_common::ErrorKind::Resource, "reactor registration")
    }
}

enum Kind {
    Vacant,
    Fd {
        fd: RawFd,
        monitored: Events,
        registered: bool,
    },
    Software {
        triggered: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Occupied,
    /// The callback is currently taken out and running.
    Executing,
    /// Unregistered while executing; reclaimed when the callback returns.
    Retired,
}

struct Slot {
    sequence: u64,
    state: SlotState,
    kind: Kind,
    callback: Option<Callback>,
}

impl Slot {
    fn vacant() -> Self {
        Slot {
            sequence: 0,
            state: SlotState::Free,
            kind: Kind::Vacant,
            callback: None,
        }
    }

    /// Frees the slot and invalidates every identifier handed out for the
    /// previous occupancy.
    fn free(&mut self) -> Option<Callback> {
        self.sequence += 1;
        self.state = SlotState::Free;
        self.kind = Kind::Vacant;
        self.callback.take()
    }
}

struct Inner {
    slots: Vec<Slot>,
    pending_software: VecDeque<DispatcherId>,
}

/// Indirection layer between the OS poller and client callbacks.
///
/// All mutating operations are legal from inside a running callback. A
/// callback unregistering itself is not destroyed synchronously; the slot
/// is marked and reclaimed after the callback returns.
pub struct ReactorDispatcher {
    inner: Mutex<Inner>,
    registry: Registry,
    waker: Arc<Waker>,
}

impl ReactorDispatcher {
    pub(crate) fn new(registry: Registry, waker: Arc<Waker>, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::vacant);
        ReactorDispatcher {
            inner: Mutex::new(Inner {
                slots,
                pending_software: VecDeque::new(),
            }),
            registry,
            waker,
        }
    }

    /// Begins watching a file descriptor. The descriptor has to stay open
    /// until the registration is removed with `unregister`.
    pub fn register_fd(
        &self,
        fd: RawFd,
        events: Events,
        callback: Callback,
    ) -> Result<DispatcherId, RegisterError> {
        let mut inner = self.inner.lock().unwrap();
        let index = Self::find_free(&inner.slots)?;

        let monitored = events.monitorable();
        let mut registered = false;
        if let Some(interest) = interest_of(monitored) {
            self.registry
                .register(&mut SourceFd(&fd), Token(index), interest)
                .map_err(|_| RegisterError::Resource)?;
            registered = true;
        }

        let slot = &mut inner.slots[index];
        slot.state = SlotState::Occupied;
        slot.kind = Kind::Fd {
            fd,
            monitored,
            registered,
        };
        slot.callback = Some(callback);
        Ok(DispatcherId {
            index,
            sequence: slot.sequence,
        })
    }

    /// Registers a software event that can later be scheduled with
    /// `trigger_sw`.
    pub fn register_sw(&self, callback: Callback) -> Result<DispatcherId, RegisterError> {
        let mut inner = self.inner.lock().unwrap();
        let index = Self::find_free(&inner.slots)?;
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Occupied;
        slot.kind = Kind::Software { triggered: false };
        slot.callback = Some(callback);
        Ok(DispatcherId {
            index,
            sequence: slot.sequence,
        })
    }

    /// Replaces the monitored event set of an fd registration.
    pub fn set_events(&self, id: DispatcherId, events: Events) {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = Self::live_slot(&mut inner.slots, id) else {
            return;
        };
        let Kind::Fd {
            fd,
            ref mut monitored,
            ref mut registered,
        } = slot.kind
        else {
            return;
        };

        let wanted = events.monitorable();
        let result = match (*registered, interest_of(wanted)) {
            (false, Some(interest)) => self
                .registry
                .register(&mut SourceFd(&fd), Token(id.index), interest)
                .map(|()| *registered = true),
            (true, Some(interest)) if wanted != *monitored => self
                .registry
                .reregister(&mut SourceFd(&fd), Token(id.index), interest),
            (true, None) => self
                .registry
                .deregister(&mut SourceFd(&fd))
                .map(|()| *registered = false),
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!(index = id.index, %err, "poller registration update failed");
        }
        *monitored = wanted;
    }

    /// Adds event types to the monitored set of an fd registration.
    pub fn add_events(&self, id: DispatcherId, events: Events) {
        if let Some(current) = self.monitored(id) {
            self.set_events(id, current | events);
        }
    }

    /// Removes event types from the monitored set of an fd registration.
    pub fn remove_events(&self, id: DispatcherId, events: Events) {
        if let Some(current) = self.monitored(id) {
            self.set_events(id, current.remove(events));
        }
    }

    /// Requests one future execution of the software-event callback.
    /// Triggering an already-triggered, not yet executed event has no
    /// effect.
    pub fn trigger_sw(&self, id: DispatcherId) {
        let mut wake = false;
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = Self::live_slot(&mut inner.slots, id) else {
                return;
            };
            if let Kind::Software { ref mut triggered } = slot.kind {
                if !*triggered {
                    *triggered = true;
                    inner.pending_software.push_back(id);
                    wake = true;
                }
            }
        }
        if wake {
            if let Err(err) = self.waker.wake() {
                warn!(%err, "reactor wakeup failed");
            }
        }
    }

    /// Removes an fd registration. The callback is not invoked again; if
    /// it is currently executing, destruction is deferred until it
    /// returns.
    pub fn unregister(&self, id: DispatcherId) {
        let dropped;
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = Self::live_slot(&mut inner.slots, id) else {
                return;
            };
            if let Kind::Fd { fd, registered, .. } = slot.kind {
                if registered {
                    if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                        warn!(index = id.index, %err, "poller deregistration failed");
                    }
                }
            } else {
                return;
            }
            dropped = Self::retire(slot);
        }
        drop(dropped);
    }

    /// Removes a software-event registration with the same deferred
    /// destruction semantics as `unregister`.
    pub fn unregister_sw(&self, id: DispatcherId) {
        let dropped;
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = Self::live_slot(&mut inner.slots, id) else {
                return;
            };
            if !matches!(slot.kind, Kind::Software { .. }) {
                return;
            }
            dropped = Self::retire(slot);
        }
        drop(dropped);
    }

    /// Invokes the callback registered under `id` if the identifier is
    /// still valid. Stale identifiers are silently discarded.
    pub fn dispatch(&self, id: DispatcherId, events: Events) {
        let mut callback = {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = Self::live_slot(&mut inner.slots, id) else {
                return;
            };
            if slot.state != SlotState::Occupied {
                // Re-entrant dispatch of an executing callback; at most one
                // execution of a given callback may run.
                return;
            }
            if let Kind::Software { ref mut triggered } = slot.kind {
                // Cleared before the run so a trigger from inside the
                // callback schedules exactly one more invocation.
                *triggered = false;
            }
            let Some(callback) = slot.callback.take() else {
                return;
            };
            slot.state = SlotState::Executing;
            callback
        };

        callback(events);

        let dropped;
        {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[id.index];
            debug_assert_eq!(slot.sequence, id.sequence);
            match slot.state {
                SlotState::Executing => {
                    slot.callback = Some(callback);
                    slot.state = SlotState::Occupied;
                    return;
                }
                SlotState::Retired => {
                    dropped = slot.free();
                }
                _ => return,
            }
        }
        drop(dropped);
        drop(callback);
    }

    /// Dispatches a poller token to the slot currently occupying that
    /// index, if it is an fd registration.
    pub(crate) fn dispatch_token(&self, index: usize, events: Events) {
        let id = {
            let inner = self.inner.lock().unwrap();
            let Some(slot) = inner.slots.get(index) else {
                return;
            };
            if slot.state != SlotState::Occupied || !matches!(slot.kind, Kind::Fd { .. }) {
                return;
            }
            DispatcherId {
                index,
                sequence: slot.sequence,
            }
        };
        self.dispatch(id, events);
    }

    /// Runs the software events triggered so far. Events triggered while
    /// draining run in the next pass.
    pub(crate) fn drain_software_events(&self) {
        let budget = self.inner.lock().unwrap().pending_software.len();
        for _ in 0..budget {
            let Some(id) = self.inner.lock().unwrap().pending_software.pop_front() else {
                break;
            };
            self.dispatch(id, Events::SOFTWARE);
        }
    }

    fn monitored(&self, id: DispatcherId) -> Option<Events> {
        let mut inner = self.inner.lock().unwrap();
        let slot = Self::live_slot(&mut inner.slots, id)?;
        match slot.kind {
            Kind::Fd { monitored, .. } => Some(monitored),
            _ => None,
        }
    }

    fn find_free(slots: &[Slot]) -> Result<usize, RegisterError> {
        slots
            .iter()
            .position(|s| s.state == SlotState::Free)
            .ok_or(RegisterError::Resource)
    }

    fn live_slot(slots: &mut [Slot], id: DispatcherId) -> Option<&mut Slot> {
        let slot = slots.get_mut(id.index)?;
        if slot.sequence != id.sequence || slot.state == SlotState::Free {
            return None;
        }
        Some(slot)
    }

    /// Marks a live slot for removal. Frees it immediately unless its
    /// callback is running, in which case `dispatch` reclaims it after the
    /// callback returns.
    fn retire(slot: &mut Slot) -> Option<Callback> {
        match slot.state {
            SlotState::Occupied => slot.free(),
            SlotState::Executing => {
                slot.state = SlotState::Retired;
                None
            }
            _ => None,
        }
    }
}

fn interest_of(events: Events) -> Option<Interest> {
    let readable = events.contains(Events::READABLE);
    let writable = events.contains(Events::WRITABLE);
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
