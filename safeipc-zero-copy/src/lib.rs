// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy event delivery over shared memory.
//!
//! A slot server partitions a shared-memory ring into fixed-size slots
//! and publishes them to receivers grouped into integrity-level classes,
//! each with its own slot and connection budget. The event manager glues
//! the application-facing allocate/send API to the slot server and
//! enforces integrity-level admission.

pub mod event_manager;
pub mod layout;
pub mod sample;
pub mod server;
pub mod side_channel;

pub use event_manager::{
    AddReceiverError, AllocateError, EventConfig, EventManager, InitializationType, ResourceLimit,
    ResourceLimits,
};
pub use layout::{SlotHeader, SlotLayout, SLOT_HEADER_SIZE};
pub use sample::AllocatedSample;
pub use server::{
    BuildError, ClassConfig, ClassHandle, MemoryTechnology, ReceiverError, ReceiverFault,
    ReceiverId, ReceiverState, ServerBuilder, SlotToken, ZeroCopySlotServer,
};
pub use side_channel::{SideChannel, SocketSideChannel};
