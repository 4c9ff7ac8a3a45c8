// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Readiness reported to a dispatcher callback.
///
/// `ERROR` and `HANGUP` are delivered by the poller regardless of the
/// monitored set; only `READABLE` and `WRITABLE` can be selected via
/// `set_events` and friends.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READABLE: Events = Events(1);
    pub const WRITABLE: Events = Events(1 << 1);
    pub const ERROR: Events = Events(1 << 2);
    pub const HANGUP: Events = Events(1 << 3);
    /// Delivered to software-event callbacks.
    pub const SOFTWARE: Events = Events(1 << 4);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Events) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn intersects(self, other: Events) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn remove(self, other: Events) -> Events {
        Events(self.0 & !other.0)
    }

    /// The subset that can be monitored on a file descriptor.
    pub fn monitorable(self) -> Events {
        Events(self.0 & (Self::READABLE.0 | Self::WRITABLE.0))
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.contains(Events::READABLE) {
            put(f, "READABLE")?;
        }
        if self.contains(Events::WRITABLE) {
            put(f, "WRITABLE")?;
        }
        if self.contains(Events::ERROR) {
            put(f, "ERROR")?;
        }
        if self.contains(Events::HANGUP) {
            put(f, "HANGUP")?;
        }
        if self.contains(Events::SOFTWARE) {
            put(f, "SOFTWARE")?;
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_operations() {
        let mask = Events::READABLE | Events::HANGUP;
        assert!(mask.contains(Events::READABLE));
        assert!(!mask.contains(Events::WRITABLE));
        assert!(mask.intersects(Events::HANGUP | Events::ERROR));
        assert_eq!(mask.remove(Events::HANGUP), Events::READABLE);
        assert_eq!(mask.monitorable(), Events::READABLE);
        assert!(Events::NONE.is_empty());
    }
}
