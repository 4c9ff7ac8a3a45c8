// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Glue between the application-facing publish API and the slot server.
//!
//! Admits subscribers by access control and integrity level, sizes the
//! slot ring from the per-class resource limits, stamps outgoing samples
//! with the process-wide session counter and handles receiver faults,
//! aborting the process when a peer of greater or equal integrity level
//! fails the server.

use crate::sample::AllocatedSample;
use crate::server::{
    AddReceiverError as ServerAddReceiverError, ClassConfig, ClassHandle, MemoryTechnology,
    ReceiverFault, ReceiverId, ReceiverState, ServerBuilder, ZeroCopySlotServer,
};
use crate::side_channel::{SideChannel, SocketSideChannel};
use crate::layout::SlotHeader;
use safeipc_common::{
    AccessControl, Credentials, EventId, InstanceId, IntegrityLevel, IntegrityResolver, ServiceId,
};
use safeipc_ipc::Connection;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Slot budget of the tracing class.
pub const TRACE_MAX_SLOTS: u32 = 1;
const TRACE_CONNECTION_LIMIT: u32 = 1;
const TRACE_CLASS_INDEX: usize = IntegrityLevel::COUNT;
const NUM_RECEIVER_CLASSES: usize = IntegrityLevel::COUNT + 1;

/// Pause between quiescence checks during teardown.
const CLEANUP_DELAY: Duration = Duration::from_millis(10);

/// Process-wide tag for outgoing slots, starts at 1.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn monotonic_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Budget of one receiver class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResourceLimit {
    pub max_slots: u32,
    pub max_connections: u32,
}

/// Per-integrity-level budgets of one provided event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResourceLimits {
    pub qm: ResourceLimit,
    pub asil_a: ResourceLimit,
    pub asil_b: ResourceLimit,
    pub asil_c: ResourceLimit,
    pub asil_d: ResourceLimit,
}

impl ResourceLimits {
    pub fn for_level(&self, level: IntegrityLevel) -> ResourceLimit {
        match level {
            IntegrityLevel::Qm => self.qm,
            IntegrityLevel::AsilA => self.asil_a,
            IntegrityLevel::AsilB => self.asil_b,
            IntegrityLevel::AsilC => self.asil_c,
            IntegrityLevel::AsilD => self.asil_d,
        }
    }

    fn total_slots(&self) -> u32 {
        self.qm.max_slots
            + self.asil_a.max_slots
            + self.asil_b.max_slots
            + self.asil_c.max_slots
            + self.asil_d.max_slots
    }
}

/// How a freshly allocated sample payload is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum InitializationType {
    /// Default image of the sample type (all zero for byte payloads).
    Constructor,
    Zero,
    Uninitialized,
}

/// Static configuration of one provided event instance.
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub event: EventId,
    pub resource_limits: ResourceLimits,
    /// Subscriber connections across all integrity classes, without the
    /// tracing receiver.
    pub max_receivers: u32,
    pub payload_size: usize,
    pub payload_align: usize,
    pub memory_technology: MemoryTechnology,
    pub initialization: InitializationType,
    pub trace_enabled: bool,
}

/// Bookkeeping for one admitted receiver, handed to the cleanup
/// callback on disconnect or termination.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverInfo {
    pub id: ReceiverId,
    pub integrity_level: IntegrityLevel,
    pub is_trace: bool,
    pub peer: Credentials,
}

/// Invoked after a receiver left (peer disconnect or termination); the
/// connection owner reacts by releasing the subscription.
pub type ConnectionCleanupCallback = Box<dyn Fn(&ReceiverInfo) + Send + Sync>;

/// Last-resort handler for invariant violations; the default aborts the
/// process. Replaceable so the abort paths stay testable.
pub type FatalHandler = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocateError {
    #[error("no free sample slot")]
    SampleAllocationFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddReceiverError {
    #[error("subscription denied by access control")]
    Privileges,
    #[error("receiver resource limits reached")]
    Resource,
}

struct Initialized {
    server: Arc<ZeroCopySlotServer>,
    class_handles: Vec<ClassHandle>,
    connection_count: [u32; NUM_RECEIVER_CLASSES],
    receivers: HashMap<u64, ReceiverInfo>,
}

struct EmShared {
    config: EventConfig,
    access_control: Arc<dyn AccessControl>,
    integrity: Arc<dyn IntegrityResolver>,
    own_level: IntegrityLevel,
    on_connection_cleanup: ConnectionCleanupCallback,
    fatal: FatalHandler,
    state: Mutex<Option<Initialized>>,
}

/// Per-event, per-instance manager of the zero-copy publish path.
pub struct EventManager {
    shared: Arc<EmShared>,
}

impl EventManager {
    pub fn new(
        config: EventConfig,
        access_control: Arc<dyn AccessControl>,
        integrity: Arc<dyn IntegrityResolver>,
        on_connection_cleanup: ConnectionCleanupCallback,
    ) -> EventManager {
        Self::with_fatal_handler(
            config,
            access_control,
            integrity,
            on_connection_cleanup,
            Box::new(|message| {
                error!(message, "fatal invariant violation");
                std::process::abort();
            }),
        )
    }

    /// Like `new` but with a custom fatal handler; tests use this to
    /// observe the abort paths.
    pub fn with_fatal_handler(
        config: EventConfig,
        access_control: Arc<dyn AccessControl>,
        integrity: Arc<dyn IntegrityResolver>,
        on_connection_cleanup: ConnectionCleanupCallback,
        fatal: FatalHandler,
    ) -> EventManager {
        let own = Credentials {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: nix::unistd::getpid().as_raw(),
        };
        let own_level = integrity.integrity_level(&own);
        EventManager {
            shared: Arc::new(EmShared {
                config,
                access_control,
                integrity,
                own_level,
                on_connection_cleanup,
                fatal,
                state: Mutex::new(None),
            }),
        }
    }

    pub fn own_integrity_level(&self) -> IntegrityLevel {
        self.shared.own_level
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().unwrap().is_some()
    }

    /// Builds the slot server: one class per integrity level plus the
    /// tracing class, ring sized to the sum of all class budgets.
    pub fn initialize(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        debug_assert!(state.is_none(), "initialize called twice");

        let limits = &shared.config.resource_limits;
        let total_slots = limits.total_slots() + TRACE_MAX_SLOTS;
        let mut max_receivers = shared.config.max_receivers as usize;
        if shared.config.trace_enabled {
            // One more connection for the local tracing receiver.
            max_receivers += 1;
        }

        let weak: Weak<EmShared> = Arc::downgrade(shared);
        let mut builder = ServerBuilder::new()
            .with_number_slots(total_slots)
            .with_slot_content_size(shared.config.payload_size)
            .with_slot_content_alignment(shared.config.payload_align)
            .with_memory_technology(shared.config.memory_technology)
            .with_max_number_receivers(max_receivers)
            .with_receiver_state_callback(Box::new(move |id, receiver_state, fault| {
                if let Some(shared) = weak.upgrade() {
                    EmShared::on_receiver_state_transition(&shared, id, receiver_state, fault);
                }
            }));

        let mut class_handles = Vec::with_capacity(NUM_RECEIVER_CLASSES);
        for index in 0..IntegrityLevel::COUNT {
            let level = IntegrityLevel::from_index(index).expect("index in range");
            let limit = limits.for_level(level);
            class_handles.push(builder.add_class(ClassConfig {
                max_slots: limit.max_slots,
                max_connections: limit.max_connections,
            }));
        }
        class_handles.push(builder.add_class(ClassConfig {
            max_slots: TRACE_MAX_SLOTS,
            max_connections: TRACE_CONNECTION_LIMIT,
        }));

        let server = match builder.build() {
            Ok(server) => server,
            Err(err) => {
                (shared.fatal)(&format!("failed to build zero-copy server: {err}"));
                return;
            }
        };
        info!(
            service = shared.config.service.0,
            event = shared.config.event.0,
            slots = total_slots,
            payload = shared.config.payload_size,
            "zero-copy server started"
        );

        *state = Some(Initialized {
            server: Arc::new(server),
            class_handles,
            connection_count: [0; NUM_RECEIVER_CLASSES],
            receivers: HashMap::new(),
        });
    }

    /// Drains the server and clears every table so the manager can be
    /// initialized again.
    pub fn deinitialize(&self) {
        let Some(initialized) = self.shared.state.lock().unwrap().take() else {
            return;
        };
        initialized.server.shutdown();
        while initialized.server.is_in_use() {
            std::thread::sleep(CLEANUP_DELAY);
        }
    }

    /// Reclaims released slots and hands out a fresh writable sample.
    pub fn allocate(&self) -> Result<AllocatedSample, AllocateError> {
        let server = self.server().ok_or(AllocateError::SampleAllocationFailure)?;

        if server.reclaim().is_err() {
            self.handle_corrupted_receivers();
        }
        let Some(token) = server.acquire_slot() else {
            debug!("failed to acquire slot");
            return Err(AllocateError::SampleAllocationFailure);
        };

        match self.shared.config.initialization {
            InitializationType::Constructor | InitializationType::Zero => {
                server.access(&token).fill(0);
            }
            InitializationType::Uninitialized => {}
        }
        server.write_header(
            &token,
            SlotHeader {
                timestamp_ns: 0,
                sequence: 0,
                payload_offset: server.layout().payload_offset as u64,
                payload_size: server.layout().payload_size as u64,
            },
        );
        Ok(AllocatedSample::new(server, token))
    }

    /// Stamps and publishes a previously allocated sample. Receiver
    /// faults are tolerated and routed to the corruption handler; the
    /// sample is gone either way.
    pub fn send(&self, sample: AllocatedSample) {
        let Some(server) = self.server() else {
            (self.shared.fatal)("send on an uninitialized event manager");
            return;
        };
        let (sample_server, token) = sample.take_token();
        if !Arc::ptr_eq(&server, &sample_server) {
            (self.shared.fatal)("sample does not belong to this event manager");
            return;
        }

        if server.reclaim().is_err() {
            self.handle_corrupted_receivers();
        }

        server.write_header(
            &token,
            SlotHeader {
                timestamp_ns: monotonic_ns(),
                sequence: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
                payload_offset: server.layout().payload_offset as u64,
                payload_size: server.layout().payload_size as u64,
            },
        );

        let mut dropped_classes = Vec::new();
        if server.send(token, &mut dropped_classes).is_err() {
            self.handle_corrupted_receivers();
        }
        if !dropped_classes.is_empty() {
            warn!(classes = dropped_classes.len(), "slot quota drops during send");
        }
    }

    /// Admits a subscription arriving over an established connection.
    /// The side channel is the duplicated connection socket.
    pub fn add_receiver(
        &self,
        connection: &Connection,
        is_trace: bool,
    ) -> Result<ReceiverId, AddReceiverError> {
        let writer = connection
            .notification_writer()
            .map_err(|_| AddReceiverError::Resource)?;
        self.add_receiver_with_channel(
            connection.peer_credentials(),
            Box::new(SocketSideChannel::new(writer)),
            is_trace,
        )
    }

    /// Admission with an explicit side channel (the connection-less
    /// entry used by the local tracing receiver and by tests).
    pub fn add_receiver_with_channel(
        &self,
        peer: Credentials,
        mut channel: Box<dyn SideChannel>,
        is_trace: bool,
    ) -> Result<ReceiverId, AddReceiverError> {
        let shared = &self.shared;
        let integrity_level = shared.integrity.integrity_level(&peer);

        let granted = shared.access_control.check_subscribe_rx(
            shared.config.service,
            shared.config.instance,
            shared.config.event,
            &peer,
        );
        if !granted {
            warn!(uid = peer.uid, "subscription denied by access control");
            Self::close_channel(&mut *channel);
            return Err(AddReceiverError::Privileges);
        }
        if is_trace && !shared.config.trace_enabled {
            Self::close_channel(&mut *channel);
            return Err(AddReceiverError::Resource);
        }

        let class_index = if is_trace {
            TRACE_CLASS_INDEX
        } else {
            integrity_level.index()
        };
        let connection_limit = if is_trace {
            TRACE_CONNECTION_LIMIT
        } else {
            shared.config.resource_limits.for_level(integrity_level).max_connections
        };

        let mut state = shared.state.lock().unwrap();
        let Some(initialized) = state.as_mut() else {
            Self::close_channel(&mut *channel);
            return Err(AddReceiverError::Resource);
        };
        if initialized.connection_count[class_index] >= connection_limit
            || !initialized.server.can_add_receiver()
        {
            warn!(
                class = class_index,
                "cannot add receiver, class resource limits reached"
            );
            Self::close_channel(&mut *channel);
            return Err(AddReceiverError::Resource);
        }

        let class = initialized.class_handles[class_index];
        match initialized.server.add_receiver(class, channel) {
            Ok(id) => {
                initialized.connection_count[class_index] += 1;
                initialized.receivers.insert(
                    id.as_u64(),
                    ReceiverInfo {
                        id,
                        integrity_level,
                        is_trace,
                        peer,
                    },
                );
                debug!(class = class_index, %integrity_level, "receiver admitted");
                Ok(id)
            }
            Err(ServerAddReceiverError::ResourceExhaustion) => Err(AddReceiverError::Resource),
        }
    }

    /// Completes a receiver's attachment; faults surfacing here go
    /// through the regular corruption handling.
    pub fn connect_receiver(&self, id: ReceiverId) {
        if let Some(server) = self.server() {
            server.connect_receiver(id);
        }
    }

    /// Removes a receiver. Precondition: the receiver holds no slots.
    pub fn remove_receiver(&self, id: ReceiverId, integrity_level: IntegrityLevel, is_trace: bool) {
        let Some(server) = self.server() else {
            return;
        };
        if server.is_receiver_in_use(id) {
            (self.shared.fatal)("receiver is in use and cannot be removed");
            return;
        }
        server.remove_receiver(id);

        let mut state = self.shared.state.lock().unwrap();
        if let Some(initialized) = state.as_mut() {
            let class_index = if is_trace {
                TRACE_CLASS_INDEX
            } else {
                integrity_level.index()
            };
            initialized.connection_count[class_index] =
                initialized.connection_count[class_index].saturating_sub(1);
            initialized.receivers.remove(&id.as_u64());
        }
    }

    /// A receiver released a slot it finished reading.
    pub fn release_slot(&self, id: ReceiverId, slot_index: usize) {
        if let Some(server) = self.server() {
            if server.release_slot(id, slot_index).is_err() {
                self.handle_corrupted_receivers();
            }
        }
    }

    /// Marks a receiver whose connection closed in an orderly fashion.
    pub fn disconnect_receiver(&self, id: ReceiverId) {
        if let Some(server) = self.server() {
            server.disconnect_receiver(id);
        }
    }

    /// Walks all registered receivers and runs the state-transition
    /// handling for every one found disconnected or corrupted. Invoked
    /// whenever `send`/`reclaim`/`release` surface a receiver error.
    pub fn handle_corrupted_receivers(&self) {
        let (server, candidates) = {
            let state = self.shared.state.lock().unwrap();
            let Some(initialized) = state.as_ref() else {
                return;
            };
            let ids: Vec<ReceiverId> =
                initialized.receivers.values().map(|info| info.id).collect();
            (Arc::clone(&initialized.server), ids)
        };

        for id in candidates {
            if let Some((receiver_state, fault)) = server.receiver_state(id) {
                if matches!(
                    receiver_state,
                    ReceiverState::Corrupted | ReceiverState::Disconnected
                ) {
                    EmShared::on_receiver_state_transition(
                        &self.shared,
                        id,
                        receiver_state,
                        fault,
                    );
                }
            }
        }
    }

    /// Id of the slot ring region; communicated to receivers so they can
    /// map the ring.
    pub fn ring_id(&self) -> Option<safeipc_ipc::ShmId> {
        self.server().map(|server| server.ring_id())
    }

    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|initialized| initialized.receivers.len())
            .unwrap_or(0)
    }

    fn server(&self) -> Option<Arc<ZeroCopySlotServer>> {
        self.shared
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|initialized| Arc::clone(&initialized.server))
    }

    /// Closes a denied side channel and waits until it is quiescent, so
    /// the caller observes no leaked resources after the error return.
    fn close_channel(channel: &mut dyn SideChannel) {
        channel.close();
        while channel.is_in_use() {
            std::thread::sleep(CLEANUP_DELAY);
        }
    }
}

impl EmShared {
    /// Receiver lifecycle handling; called from the slot server's
    /// transition callback and from the corruption sweep.
    fn on_receiver_state_transition(
        shared: &Arc<EmShared>,
        id: ReceiverId,
        receiver_state: ReceiverState,
        fault: Option<ReceiverFault>,
    ) {
        if !matches!(
            receiver_state,
            ReceiverState::Corrupted | ReceiverState::Disconnected
        ) {
            return;
        }

        let (server, info) = {
            let mut state = shared.state.lock().unwrap();
            let Some(initialized) = state.as_mut() else {
                return;
            };
            let Some(info) = initialized.receivers.remove(&id.as_u64()) else {
                return;
            };
            (Arc::clone(&initialized.server), info)
        };

        match receiver_state {
            ReceiverState::Corrupted => {
                error!(receiver = id.as_u64(), ?fault, "receiver corrupted");
                let integrity_relevant = matches!(
                    fault,
                    Some(ReceiverFault::PeerDisconnected) | Some(ReceiverFault::Protocol)
                );
                if integrity_relevant
                    && shared.own_level <= info.integrity_level
                    && !info.is_trace
                {
                    (shared.fatal)(
                        "corrupted receiver with integrity level at or above the server's own",
                    );
                    return;
                }
                server.terminate_receiver(id);
                (shared.on_connection_cleanup)(&info);
            }
            ReceiverState::Disconnected => {
                (shared.on_connection_cleanup)(&info);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safeipc_common::{AllowAll, UidTableResolver};
    use std::io;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ChannelLog {
        notifications: StdMutex<Vec<u64>>,
        fail: AtomicBool,
        closed: AtomicBool,
    }

    struct TestChannel {
        log: Arc<ChannelLog>,
    }

    impl SideChannel for TestChannel {
        fn notify(&mut self, slot_index: u64) -> io::Result<()> {
            if self.log.fail.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.log.notifications.lock().unwrap().push(slot_index);
            Ok(())
        }

        fn close(&mut self) {
            self.log.closed.store(true, Ordering::SeqCst);
        }

        fn is_in_use(&self) -> bool {
            false
        }
    }

    struct DenyAll;
    impl AccessControl for DenyAll {
        fn check_subscribe_rx(
            &self,
            _service: ServiceId,
            _instance: InstanceId,
            _event: EventId,
            _peer: &Credentials,
        ) -> bool {
            false
        }
    }

    fn config() -> EventConfig {
        let limit = ResourceLimit {
            max_slots: 2,
            max_connections: 2,
        };
        EventConfig {
            service: ServiceId(10),
            instance: InstanceId(1),
            event: EventId(7),
            resource_limits: ResourceLimits {
                qm: limit,
                asil_a: limit,
                asil_b: limit,
                asil_c: limit,
                asil_d: limit,
            },
            max_receivers: 8,
            payload_size: 64,
            payload_align: 8,
            memory_technology: MemoryTechnology::SharedMemory,
            initialization: InitializationType::Zero,
            trace_enabled: false,
        }
    }

    struct Harness {
        manager: EventManager,
        cleanups: Arc<StdMutex<Vec<ReceiverInfo>>>,
        fatals: Arc<StdMutex<Vec<String>>>,
    }

    fn harness_with(resolver: UidTableResolver, config_in: EventConfig) -> Harness {
        let cleanups = Arc::new(StdMutex::new(Vec::new()));
        let fatals = Arc::new(StdMutex::new(Vec::new()));
        let cleanup_log = Arc::clone(&cleanups);
        let fatal_log = Arc::clone(&fatals);
        let manager = EventManager::with_fatal_handler(
            config_in,
            Arc::new(AllowAll),
            Arc::new(resolver),
            Box::new(move |info| cleanup_log.lock().unwrap().push(*info)),
            Box::new(move |message| fatal_log.lock().unwrap().push(message.to_string())),
        );
        manager.initialize();
        Harness {
            manager,
            cleanups,
            fatals,
        }
    }

    fn harness() -> Harness {
        harness_with(UidTableResolver::default(), config())
    }

    fn peer(uid: u32) -> Credentials {
        Credentials {
            uid,
            gid: 1,
            pid: 4242,
        }
    }

    fn admit(h: &Harness, uid: u32) -> (ReceiverId, Arc<ChannelLog>) {
        let log = Arc::new(ChannelLog::default());
        let id = h
            .manager
            .add_receiver_with_channel(
                peer(uid),
                Box::new(TestChannel { log: Arc::clone(&log) }),
                false,
            )
            .unwrap();
        h.manager.connect_receiver(id);
        (id, log)
    }

    #[test]
    fn allocate_send_release_cycle_stamps_headers() {
        let h = harness();
        let (id, log) = admit(&h, 1000);

        let mut sample = h.manager.allocate().unwrap();
        sample[..4].copy_from_slice(&[1, 2, 3, 4]);
        let slot = sample.slot_index();
        h.manager.send(sample);

        assert_eq!(*log.notifications.lock().unwrap(), vec![slot as u64]);

        let mut sample = h.manager.allocate().unwrap();
        let second_slot = sample.slot_index();
        sample[..4].copy_from_slice(&[5, 6, 7, 8]);
        h.manager.send(sample);

        // Session counter strictly increases across sends. (Other tests
        // in this process share the counter, so only monotonicity is
        // asserted.)
        let server = h.manager.server().unwrap();
        let first = server.read_header(slot);
        let second = server.read_header(second_slot);
        assert!(first.sequence >= 1);
        assert!(second.sequence > first.sequence);
        assert!(second.timestamp_ns >= first.timestamp_ns);
        assert_eq!(first.payload_size, 64);

        h.manager.release_slot(id, slot);
        h.manager.release_slot(id, second_slot);
    }

    #[test]
    fn allocation_fails_when_every_slot_is_out() {
        let h = harness();
        // Ring: 5 classes * 2 + 1 trace slot = 11.
        let samples: Vec<AllocatedSample> =
            (0..11).map(|_| h.manager.allocate().unwrap()).collect();
        assert_eq!(
            h.manager.allocate().unwrap_err(),
            AllocateError::SampleAllocationFailure
        );
        drop(samples);
        // Unacquired on drop; allocation works again.
        assert!(h.manager.allocate().is_ok());
    }

    #[test]
    fn denied_subscription_closes_channel_synchronously() {
        let cleanups = Arc::new(StdMutex::new(Vec::new()));
        let fatal_log = Arc::new(StdMutex::new(Vec::new()));
        let cleanup_log = Arc::clone(&cleanups);
        let fatals = Arc::clone(&fatal_log);
        let manager = EventManager::with_fatal_handler(
            config(),
            Arc::new(DenyAll),
            Arc::new(UidTableResolver::default()),
            Box::new(move |info| cleanup_log.lock().unwrap().push(*info)),
            Box::new(move |message| fatals.lock().unwrap().push(message.to_string())),
        );
        manager.initialize();

        let log = Arc::new(ChannelLog::default());
        let result = manager.add_receiver_with_channel(
            peer(77),
            Box::new(TestChannel { log: Arc::clone(&log) }),
            false,
        );
        assert_eq!(result.unwrap_err(), AddReceiverError::Privileges);
        assert!(log.closed.load(Ordering::SeqCst));
        assert_eq!(manager.receiver_count(), 0);
        manager.deinitialize();
    }

    #[test]
    fn per_class_connection_limit_yields_resource_error() {
        let h = harness();
        let (_a, _log_a) = admit(&h, 1000);
        let (_b, _log_b) = admit(&h, 1001);

        // Third QM subscriber exceeds max_connections = 2.
        let log = Arc::new(ChannelLog::default());
        let result = h.manager.add_receiver_with_channel(
            peer(1002),
            Box::new(TestChannel { log: Arc::clone(&log) }),
            false,
        );
        assert_eq!(result.unwrap_err(), AddReceiverError::Resource);
        assert!(log.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn corrupted_peer_at_or_above_own_level_is_fatal() {
        // Server runs at ASIL-B (own uid mapped), peer also ASIL-B.
        let own_uid = nix::unistd::getuid().as_raw();
        let mut table = HashMap::new();
        table.insert(own_uid, IntegrityLevel::AsilB);
        table.insert(500, IntegrityLevel::AsilB);
        let h = harness_with(
            UidTableResolver::new(table, IntegrityLevel::Qm),
            config(),
        );
        assert_eq!(h.manager.own_integrity_level(), IntegrityLevel::AsilB);

        let (_id, log) = admit(&h, 500);
        log.fail.store(true, Ordering::SeqCst);

        let sample = h.manager.allocate().unwrap();
        h.manager.send(sample);

        let fatals = h.fatals.lock().unwrap();
        assert_eq!(fatals.len(), 1);
        assert!(fatals[0].contains("integrity"));
        // No cleanup ran; the process would have aborted.
        assert!(h.cleanups.lock().unwrap().is_empty());
    }

    #[test]
    fn corrupted_lower_trust_peer_is_terminated_and_cleaned_up() {
        // Server at ASIL-B, peer resolves to QM (below).
        let own_uid = nix::unistd::getuid().as_raw();
        let mut table = HashMap::new();
        table.insert(own_uid, IntegrityLevel::AsilB);
        let h = harness_with(
            UidTableResolver::new(table, IntegrityLevel::Qm),
            config(),
        );

        let (id, log) = admit(&h, 600);
        log.fail.store(true, Ordering::SeqCst);

        let sample = h.manager.allocate().unwrap();
        h.manager.send(sample);

        assert!(h.fatals.lock().unwrap().is_empty());
        let cleanups = h.cleanups.lock().unwrap();
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].id, id);
        assert_eq!(cleanups[0].integrity_level, IntegrityLevel::Qm);
        drop(cleanups);

        // The owner completes the removal with the data from the
        // cleanup callback; sending keeps working.
        h.manager.remove_receiver(id, IntegrityLevel::Qm, false);
        assert!(h.fatals.lock().unwrap().is_empty());
        let sample = h.manager.allocate().unwrap();
        h.manager.send(sample);
    }

    #[test]
    fn trace_receiver_is_exempt_from_the_abort_rule() {
        let own_uid = nix::unistd::getuid().as_raw();
        let mut table = HashMap::new();
        table.insert(own_uid, IntegrityLevel::AsilB);
        table.insert(500, IntegrityLevel::AsilD);
        let mut trace_config = config();
        trace_config.trace_enabled = true;
        let h = harness_with(UidTableResolver::new(table, IntegrityLevel::Qm), trace_config);

        let log = Arc::new(ChannelLog::default());
        let id = h
            .manager
            .add_receiver_with_channel(
                peer(500),
                Box::new(TestChannel { log: Arc::clone(&log) }),
                true,
            )
            .unwrap();
        h.manager.connect_receiver(id);
        log.fail.store(true, Ordering::SeqCst);

        let sample = h.manager.allocate().unwrap();
        h.manager.send(sample);

        // Terminated, not fatal, despite ASIL-D > ASIL-B.
        assert!(h.fatals.lock().unwrap().is_empty());
        assert_eq!(h.cleanups.lock().unwrap().len(), 1);
    }

    #[test]
    fn deinitialize_drains_and_allows_reinitialization() {
        let h = harness();
        let (_id, _log) = admit(&h, 1000);
        h.manager.deinitialize();
        assert!(!h.manager.is_initialized());
        assert!(h.manager.allocate().is_err());

        h.manager.initialize();
        assert!(h.manager.is_initialized());
        assert!(h.manager.allocate().is_ok());
        h.manager.deinitialize();
    }
}
