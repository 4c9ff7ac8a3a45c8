// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Full-stack test: acceptor handshake, connection promotion, receiver
//! admission over the real socket side channel, and zero-copy delivery
//! through the shared-memory ring.

use safeipc_common::{AllowAll, UnicastAddress};
use safeipc_ipc::platform::shm::{NamedShmHandle, ShmId, SHM_ID_LEN};
use safeipc_ipc::protocol::{ClientToServer1, ClientToServer2, ServerToClient1, PROTOCOL_VERSION};
use safeipc_ipc::{Server, ServerConfig};
use safeipc_reactor::Reactor;
use safeipc_zero_copy::{
    EventConfig, EventManager, InitializationType, MemoryTechnology, ResourceLimit,
    ResourceLimits, SlotHeader, SlotLayout, SLOT_HEADER_SIZE,
};
use safeipc_common::{EventId, InstanceId, ServiceId};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn event_config() -> EventConfig {
    let limit = ResourceLimit {
        max_slots: 2,
        max_connections: 2,
    };
    EventConfig {
        service: ServiceId(21),
        instance: InstanceId(1),
        event: EventId(3),
        resource_limits: ResourceLimits {
            qm: limit,
            asil_a: limit,
            asil_b: limit,
            asil_c: limit,
            asil_d: limit,
        },
        max_receivers: 4,
        payload_size: 128,
        payload_align: 16,
        memory_technology: MemoryTechnology::SharedMemory,
        initialization: InitializationType::Zero,
        trace_enabled: false,
    }
}

#[test]
fn subscriber_receives_zero_copy_samples_through_the_ring() {
    let dir = tempfile::tempdir().unwrap();
    let address = UnicastAddress::new(9, 1);
    let socket_path = address.socket_path(dir.path());

    let reactor = Arc::new(Reactor::new(64).unwrap());
    let server = Server::new(
        &reactor,
        ServerConfig {
            address,
            runtime_dir: dir.path().to_path_buf(),
            establishment_timeout: Duration::from_secs(5),
        },
    );
    let event = reactor.dispatcher().register_sw(Box::new(|_| {})).unwrap();
    server.start(1024 * 1024, event).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let loop_stop = Arc::clone(&stop);
    let loop_reactor = Arc::clone(&reactor);
    let reactor_thread = thread::spawn(move || {
        while !loop_stop.load(Ordering::SeqCst) {
            loop_reactor
                .handle_events(Some(Duration::from_millis(20)))
                .unwrap();
        }
    });

    // Client side of the admission handshake, kept for notifications.
    let mut client = UnixStream::connect(&socket_path).unwrap();
    client
        .write_all(
            &ClientToServer1 {
                version: PROTOCOL_VERSION,
                requested_s2c_size: 4096,
                c2s_shm_id: ShmId::from_bytes([5; SHM_ID_LEN]),
            }
            .encode(),
        )
        .unwrap();
    let mut frame = vec![0u8; 4 + ServerToClient1::WIRE_SIZE];
    client.read_exact(&mut frame).unwrap();
    ServerToClient1::decode(&frame[4..]).unwrap();
    client.write_all(&ClientToServer2.encode()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !server.has_established() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let connection = server.init_next(Box::new(|_| {})).unwrap();

    // Event manager admits the connection as a receiver; faults would
    // abort (loopback peer shares our integrity level), so record them
    // instead.
    let fatals = Arc::new(Mutex::new(Vec::new()));
    let fatal_log = Arc::clone(&fatals);
    let manager = EventManager::with_fatal_handler(
        event_config(),
        Arc::new(AllowAll),
        Arc::new(safeipc_common::UidTableResolver::default()),
        Box::new(|_| {}),
        Box::new(move |message| fatal_log.lock().unwrap().push(message.to_string())),
    );
    manager.initialize();
    let receiver = manager.add_receiver(&connection, false).unwrap();
    manager.connect_receiver(receiver);

    // Publish one sample.
    let mut sample = manager.allocate().unwrap();
    sample[..11].copy_from_slice(b"hello-slots");
    manager.send(sample);

    // The subscriber learns the slot index over its socket...
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut notification = [0u8; 8];
    client.read_exact(&mut notification).unwrap();
    let slot_index = u64::from_le_bytes(notification) as usize;

    // ...and reads header and payload directly from the mapped ring.
    let ring = NamedShmHandle::open(manager.ring_id().unwrap())
        .unwrap()
        .map()
        .unwrap();
    // 5 classes * 2 slots + 1 trace slot; same geometry as the server.
    let layout = SlotLayout::compute(11, 128, 16);
    let slot_bytes = &ring.as_slice()[layout.slot_offset(slot_index)..];
    let header = SlotHeader::read_from(&slot_bytes[..SLOT_HEADER_SIZE]);
    assert!(header.sequence >= 1);
    assert_eq!(header.payload_size, 128);
    let payload =
        &slot_bytes[header.payload_offset as usize..header.payload_offset as usize + 11];
    assert_eq!(payload, b"hello-slots");

    // Release through the manager; the slot becomes reusable.
    manager.release_slot(receiver, slot_index);
    let again = manager.allocate().unwrap();
    drop(again);

    assert!(fatals.lock().unwrap().is_empty());

    manager.remove_receiver(receiver, safeipc_common::IntegrityLevel::Qm, false);
    manager.deinitialize();
    server.stop();
    stop.store(true, Ordering::SeqCst);
    reactor_thread.join().unwrap();
}
