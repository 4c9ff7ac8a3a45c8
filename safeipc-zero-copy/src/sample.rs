// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::server::{SlotToken, ZeroCopySlotServer};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// One writable zero-copy sample: a view into the slot payload plus the
/// token identifying the slot towards the server.
///
/// Dropping an unsent sample returns the slot to the free pool; sending
/// consumes the token instead.
pub struct AllocatedSample {
    server: Arc<ZeroCopySlotServer>,
    token: Option<SlotToken>,
}

impl AllocatedSample {
    pub(crate) fn new(server: Arc<ZeroCopySlotServer>, token: SlotToken) -> AllocatedSample {
        AllocatedSample {
            server,
            token: Some(token),
        }
    }

    /// Index of the underlying slot (receivers see the same index in
    /// their notifications).
    pub fn slot_index(&self) -> usize {
        self.token.as_ref().expect("token present until taken").index()
    }

    /// Takes the slot token out; the sample is inert afterwards. Used by
    /// the event manager on send.
    pub(crate) fn take_token(mut self) -> (Arc<ZeroCopySlotServer>, SlotToken) {
        let token = self.token.take().expect("token taken once");
        (Arc::clone(&self.server), token)
    }
}

impl Deref for AllocatedSample {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let token = self.token.as_ref().expect("token present until taken");
        self.server.access(token)
    }
}

impl DerefMut for AllocatedSample {
    fn deref_mut(&mut self) -> &mut [u8] {
        let token = self.token.as_ref().expect("token present until taken");
        self.server.access(token)
    }
}

impl Drop for AllocatedSample {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.server.unacquire_slot(token);
        }
    }
}

impl std::fmt::Debug for AllocatedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedSample")
            .field("slot", &self.token)
            .finish()
    }
}
