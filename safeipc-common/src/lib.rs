// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod access_control;
pub mod address;
pub mod credentials;
pub mod error;
pub mod integrity;

pub use access_control::{AccessControl, AllowAll, EventId, InstanceId, ServiceId};
pub use address::UnicastAddress;
pub use credentials::{read_peer_credentials, Credentials};
pub use error::{ErrorKind, OsError};
pub use integrity::{IntegrityLevel, IntegrityResolver, UidTableResolver};
