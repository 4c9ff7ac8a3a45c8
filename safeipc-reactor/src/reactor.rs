// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::dispatcher::ReactorDispatcher;
use crate::events::Events;
use crate::timer::TimerManager;
use mio::{Poll, Token, Waker};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// Token reserved for the cross-thread wakeup pipe; never a slot index.
const WAKER_TOKEN: Token = Token(usize::MAX);

struct PollState {
    poll: Poll,
    events: mio::Events,
}

/// One reactor: an OS poller, a callback dispatcher and a timer queue.
///
/// `handle_events` must be driven from a single thread; every callback,
/// state machine and timer of the components built on top runs on that
/// thread. Other threads may only trigger software events.
pub struct Reactor {
    state: Mutex<PollState>,
    dispatcher: Arc<ReactorDispatcher>,
    timers: Arc<TimerManager>,
}

impl Reactor {
    /// Creates a reactor with `slots` dispatcher callback slots.
    pub fn new(slots: usize) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let registry = poll.registry().try_clone()?;
        Ok(Reactor {
            state: Mutex::new(PollState {
                poll,
                events: mio::Events::with_capacity(slots.max(8)),
            }),
            dispatcher: Arc::new(ReactorDispatcher::new(registry, waker, slots)),
            timers: Arc::new(TimerManager::new()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<ReactorDispatcher> {
        &self.dispatcher
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Runs one reactor cycle: waits for fd events (bounded by `max_wait`
    /// and the earliest timer deadline), dispatches them, fires expired
    /// timers and drains triggered software events.
    pub fn handle_events(&self, max_wait: Option<Duration>) -> io::Result<()> {
        let timeout = self.cycle_timeout(max_wait);

        {
            let mut state = self.state.lock().unwrap();
            let PollState { poll, events } = &mut *state;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(err),
            }

            // Collect tokens first; callbacks may re-enter the dispatcher
            // but must not run under the poll lock.
            let ready: Vec<(usize, Events)> = events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| (event.token().0, events_of(event)))
                .collect();
            drop(state);

            for (index, events) in ready {
                trace!(index, ?events, "dispatching fd readiness");
                self.dispatcher.dispatch_token(index, events);
            }
        }

        self.timers.fire_expired(Instant::now());
        self.dispatcher.drain_software_events();
        Ok(())
    }

    fn cycle_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let timer_wait = self.timers.next_deadline().map(|deadline| {
            deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO)
        });
        match (max_wait, timer_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn events_of(event: &mio::event::Event) -> Events {
    let mut events = Events::NONE;
    if event.is_readable() {
        events |= Events::READABLE;
    }
    if event.is_writable() {
        events |= Events::WRITABLE;
    }
    if event.is_error() {
        events |= Events::ERROR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        events |= Events::HANGUP;
    }
    events
}
