// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::platform::shm::{NamedShmHandle, ShmId};
use crate::protocol::ProtocolVersion;

/// Everything the handshake provisioned for one established connection.
///
/// The client-to-server ring was created by the peer and is referenced by
/// id only; the two server-created regions are owned here. The
/// server-to-client ring is already unlinked (the peer confirmed opening
/// it); the notification ring keeps its name until this struct is
/// dropped with the connection.
#[derive(Debug)]
pub struct IpcChannelResources {
    pub protocol: ProtocolVersion,
    pub s2c_buffer_size: u64,
    pub c2s_shm_id: ShmId,
    pub s2c_region: NamedShmHandle,
    pub notification_region: NamedShmHandle,
}

impl IpcChannelResources {
    pub fn s2c_shm_id(&self) -> ShmId {
        self.s2c_region.id()
    }

    pub fn notification_shm_id(&self) -> ShmId {
        self.notification_region.id()
    }
}
