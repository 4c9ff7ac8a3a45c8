// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::credentials::Credentials;
use serde::Deserialize;

/// Identifier of a provided service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct ServiceId(pub u32);

/// Identifier of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct InstanceId(pub u32);

/// Identifier of an event within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct EventId(pub u32);

/// Access-control decision point for event subscriptions.
///
/// The event manager consults this before admitting a receiver; a denial
/// is surfaced to the subscriber as a privileges error and never affects
/// already-admitted receivers.
pub trait AccessControl: Send + Sync {
    fn check_subscribe_rx(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        peer: &Credentials,
    ) -> bool;
}

/// Permits every subscription. The default for deployments that do the
/// filtering at a different layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_subscribe_rx(
        &self,
        _service: ServiceId,
        _instance: InstanceId,
        _event: EventId,
        _peer: &Credentials,
    ) -> bool {
        true
    }
}
