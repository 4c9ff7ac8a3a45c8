// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded reactor with an indirection layer between the OS
//! poller and client callbacks.
//!
//! The dispatcher hands out `(index, sequence)` identifiers so that a
//! callback slot can be reused without stale identifiers ever reaching a
//! foreign callback, and so that every mutating operation stays legal
//! from inside a running callback.

pub mod dispatcher;
pub mod events;
pub mod reactor;
pub mod timer;

pub use dispatcher::{Callback, DispatcherId, ReactorDispatcher, RegisterError};
pub use events::Events;
pub use reactor::Reactor;
pub use timer::{TimerId, TimerManager};
