// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-side connection establishment for SafeIPC.
//!
//! The acceptor binds a Unix domain socket, runs a three-message
//! handshake with every incoming client inside the reactor thread,
//! provisions the per-connection shared-memory rings and hands completed
//! connections to the application through a software event.

pub mod backlog;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod incoming;
pub mod platform;
pub mod protocol;
pub mod server;

pub use backlog::{ConnectionBacklog, BACKLOG_SIZE};
pub use channel::IpcChannelResources;
pub use connection::Connection;
pub use connector::{connect, ClientConnection, ConnectOptions};
pub use platform::shm::{MappedMem, NamedShmHandle, ShmId, SHM_ID_LEN};
pub use protocol::{ProtocolVersion, MIN_BUFFER_SIZE};
pub use server::{Server, ServerConfig};
