// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::sync::Mutex;
use std::time::Instant;

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Identifier of an armed timer. Stale identifiers (after expiry or
/// cancellation) are silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: usize,
    sequence: u64,
}

struct TimerSlot {
    sequence: u64,
    armed: bool,
    callback: Option<TimerCallback>,
}

struct Inner {
    slots: Vec<TimerSlot>,
    queue: PriorityQueue<usize, Reverse<Instant>>,
}

/// Deadline queue driven by the reactor.
///
/// The reactor bounds its poll timeout by `next_deadline` and calls
/// `fire_expired` once per cycle. Arming and cancelling are legal from
/// inside any reactor callback, including a timer callback.
pub struct TimerManager {
    inner: Mutex<Inner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                queue: PriorityQueue::new(),
            }),
        }
    }

    /// Arms a one-shot timer for `deadline`.
    pub fn arm(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.slots.iter().position(|slot| !slot.armed) {
            Some(index) => index,
            None => {
                inner.slots.push(TimerSlot {
                    sequence: 0,
                    armed: false,
                    callback: None,
                });
                inner.slots.len() - 1
            }
        };
        let slot = &mut inner.slots[index];
        slot.armed = true;
        slot.callback = Some(callback);
        let sequence = slot.sequence;
        inner.queue.push(index, Reverse(deadline));
        TimerId { index, sequence }
    }

    /// Cancels an armed timer. The callback will not run.
    pub fn cancel(&self, id: TimerId) {
        let dropped;
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(slot) = inner.slots.get_mut(id.index) else {
                return;
            };
            if slot.sequence != id.sequence || !slot.armed {
                return;
            }
            slot.armed = false;
            slot.sequence += 1;
            dropped = slot.callback.take();
            inner.queue.remove(&id.index);
        }
        drop(dropped);
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.queue.peek().map(|(_, Reverse(deadline))| *deadline)
    }

    /// Runs every callback whose deadline is at or before `now`. Returns
    /// the number of callbacks that ran. Callbacks may arm new timers.
    pub fn fire_expired(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let callback = {
                let mut inner = self.inner.lock().unwrap();
                let due = matches!(
                    inner.queue.peek(),
                    Some((_, Reverse(deadline))) if *deadline <= now
                );
                if !due {
                    break;
                }
                let (index, _) = inner.queue.pop().unwrap();
                let slot = &mut inner.slots[index];
                slot.armed = false;
                slot.sequence += 1;
                slot.callback.take()
            };
            if let Some(callback) = callback {
                callback();
                fired += 1;
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let timers = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, offset_ms) in [(2, 20), (0, 5), (1, 10)] {
            let order = Arc::clone(&order);
            timers.arm(
                now + Duration::from_millis(offset_ms),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));
        let fired = timers.fire_expired(now + Duration::from_millis(30));
        assert_eq!(fired, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn cancel_suppresses_callback() {
        let timers = TimerManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let id = timers.arm(
            Instant::now(),
            Box::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timers.cancel(id);
        assert_eq!(timers.fire_expired(Instant::now()), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Stale cancel of a reused slot must not disturb the new timer.
        let counted = Arc::clone(&runs);
        let _second = timers.arm(
            Instant::now(),
            Box::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timers.cancel(id);
        assert_eq!(timers.fire_expired(Instant::now()), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearm_from_inside_expiry_callback() {
        let timers = Arc::new(TimerManager::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let inner_timers = Arc::clone(&timers);
        let counted = Arc::clone(&runs);
        let now = Instant::now();

        timers.arm(
            now,
            Box::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                let counted = Arc::clone(&counted);
                inner_timers.arm(
                    Instant::now(),
                    Box::new(move || {
                        counted.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        // First pass fires the original timer and the one it armed.
        let fired = timers.fire_expired(now + Duration::from_millis(5));
        assert!(fired >= 1);
        timers.fire_expired(Instant::now() + Duration::from_millis(5));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
