// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-event zero-copy slot server.
//!
//! Owns a shared-memory ring of fixed-size slots and publishes them to
//! receivers partitioned into classes, each class with its own slot and
//! connection budget. One misbehaving class can never deny service to
//! another: when a class exhausts its quota its oldest outstanding slot
//! is dropped, never slots of other classes.

use crate::layout::{SlotHeader, SlotLayout, SLOT_HEADER_SIZE};
use crate::side_channel::SideChannel;
use safeipc_ipc::platform::shm::{MappedMem, NamedShmHandle, ShmId};
use safeipc_common::OsError;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Upper bound on receivers per server; holders are tracked as a bitmask.
const MAX_RECEIVER_SLOTS: usize = 64;

/// Backing storage technology of the slot ring.
///
/// Physically contiguous memory maps to the same POSIX shm object on
/// this target; the tag is kept so platforms with a contiguous allocator
/// can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum MemoryTechnology {
    SharedMemory,
    PhysContigSharedMemory,
}

/// Per-class resource budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassConfig {
    pub max_slots: u32,
    pub max_connections: u32,
}

/// Handle to a receiver class registered at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle {
    pub(crate) index: usize,
}

/// Unique capability for one writer-owned slot. Not clonable; passing it
/// to `send` or `unacquire_slot` transfers the slot back to the server.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotToken {
    index: usize,
}

impl SlotToken {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Identifier of a receiver; stale ids after removal are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId {
    index: usize,
    sequence: u64,
}

impl ReceiverId {
    /// Stable key for bookkeeping tables.
    pub fn as_u64(&self) -> u64 {
        (self.sequence << 8) | self.index as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Connecting,
    Connected,
    Disconnected,
    Corrupted,
}

/// Why a receiver was declared corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverFault {
    /// The peer process crashed or closed its side channel.
    PeerDisconnected,
    /// The receiver violated the slot protocol (for example released a
    /// slot it never held).
    Protocol,
}

/// A peer fault surfaced out of `send`/`reclaim`; the owner must walk
/// its receivers and terminate the corrupted ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("receiver {receiver:?} faulted: {fault:?}")]
pub struct ReceiverError {
    pub receiver: ReceiverId,
    pub fault: ReceiverFault,
}

/// Receiver lifecycle notifications, delivered outside the server lock.
pub type ReceiverStateCallback =
    Box<dyn Fn(ReceiverId, ReceiverState, Option<ReceiverFault>) + Send + Sync>;

/// Errors of `ServerBuilder::build`.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("mandatory builder setting missing: {0}")]
    MissingSetting(&'static str),
    #[error("sum of class slot quotas {quota_sum} does not equal slot count {slots}")]
    QuotaMismatch { quota_sum: u32, slots: u32 },
    #[error("payload alignment must be a nonzero power of two")]
    InvalidAlignment,
    #[error("at most {MAX_RECEIVER_SLOTS} receivers are supported")]
    TooManyReceivers,
    #[error("failed to provision the slot ring: {0}")]
    Os(#[from] OsError),
}

/// Errors of `ZeroCopySlotServer::add_receiver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddReceiverError {
    #[error("receiver capacity exhausted")]
    ResourceExhaustion,
}

/// Builder with the mandatory settings of a slot server.
#[derive(Default)]
pub struct ServerBuilder {
    slot_count: Option<u32>,
    payload_size: Option<usize>,
    payload_align: Option<usize>,
    technology: Option<MemoryTechnology>,
    max_receivers: Option<usize>,
    classes: Vec<ClassConfig>,
    on_receiver_state_transition: Option<ReceiverStateCallback>,
}

impl ServerBuilder {
    pub fn new() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn with_number_slots(mut self, count: u32) -> Self {
        self.slot_count = Some(count);
        self
    }

    pub fn with_slot_content_size(mut self, size: usize) -> Self {
        self.payload_size = Some(size);
        self
    }

    pub fn with_slot_content_alignment(mut self, align: usize) -> Self {
        self.payload_align = Some(align);
        self
    }

    pub fn with_memory_technology(mut self, technology: MemoryTechnology) -> Self {
        self.technology = Some(technology);
        self
    }

    pub fn with_max_number_receivers(mut self, max: usize) -> Self {
        self.max_receivers = Some(max);
        self
    }

    /// Registers one receiver class; the returned handle addresses it in
    /// `add_receiver`.
    pub fn add_class(&mut self, config: ClassConfig) -> ClassHandle {
        self.classes.push(config);
        ClassHandle {
            index: self.classes.len() - 1,
        }
    }

    pub fn with_receiver_state_callback(mut self, callback: ReceiverStateCallback) -> Self {
        self.on_receiver_state_transition = Some(callback);
        self
    }

    pub fn build(self) -> Result<ZeroCopySlotServer, BuildError> {
        let slot_count = self.slot_count.ok_or(BuildError::MissingSetting("slots"))?;
        let payload_size = self
            .payload_size
            .ok_or(BuildError::MissingSetting("slot content size"))?;
        let payload_align = self
            .payload_align
            .ok_or(BuildError::MissingSetting("slot content alignment"))?;
        let technology = self
            .technology
            .ok_or(BuildError::MissingSetting("memory technology"))?;
        let max_receivers = self
            .max_receivers
            .ok_or(BuildError::MissingSetting("max receivers"))?;
        let callback = self
            .on_receiver_state_transition
            .ok_or(BuildError::MissingSetting("receiver state callback"))?;
        if self.classes.is_empty() {
            return Err(BuildError::MissingSetting("receiver classes"));
        }
        if payload_align == 0 || !payload_align.is_power_of_two() {
            return Err(BuildError::InvalidAlignment);
        }
        if max_receivers == 0 || max_receivers > MAX_RECEIVER_SLOTS {
            return Err(BuildError::TooManyReceivers);
        }
        let quota_sum: u32 = self.classes.iter().map(|c| c.max_slots).sum();
        if quota_sum != slot_count {
            return Err(BuildError::QuotaMismatch {
                quota_sum,
                slots: slot_count,
            });
        }

        let layout = SlotLayout::compute(slot_count as usize, payload_size, payload_align);
        let ring = NamedShmHandle::create(layout.total_size())?.map()?;
        debug!(
            slots = slot_count,
            stride = layout.stride,
            ring = ?ring.id(),
            "slot ring provisioned"
        );

        Ok(ZeroCopySlotServer {
            layout,
            technology,
            ring,
            callback,
            inner: Mutex::new(ServerInner {
                slots: vec![
                    Slot {
                        state: SlotState::Free,
                        holders: 0,
                    };
                    slot_count as usize
                ],
                classes: self
                    .classes
                    .into_iter()
                    .map(|config| Class {
                        config,
                        outstanding: VecDeque::new(),
                        connections: 0,
                    })
                    .collect(),
                receivers: (0..max_receivers).map(|_| None).collect(),
                shut_down: false,
                pending_transitions: Vec::new(),
            }),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    Free,
    WriterOwned,
    InFlight,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    state: SlotState,
    /// Bit per receiver index that still reads this slot.
    holders: u64,
}

struct Class {
    config: ClassConfig,
    /// InFlight slots held by this class, oldest first.
    outstanding: VecDeque<usize>,
    connections: u32,
}

struct Receiver {
    sequence: u64,
    class: usize,
    state: ReceiverState,
    fault: Option<ReceiverFault>,
    /// Set once the owner terminated the receiver; its fault is then no
    /// longer re-reported.
    terminated: bool,
    channel: Box<dyn SideChannel>,
}

struct ServerInner {
    slots: Vec<Slot>,
    classes: Vec<Class>,
    receivers: Vec<Option<Receiver>>,
    shut_down: bool,
    pending_transitions: Vec<(ReceiverId, ReceiverState, Option<ReceiverFault>)>,
}

/// Shared-memory slot server with class-partitioned quotas.
pub struct ZeroCopySlotServer {
    layout: SlotLayout,
    technology: MemoryTechnology,
    ring: MappedMem,
    callback: ReceiverStateCallback,
    inner: Mutex<ServerInner>,
}

impl ZeroCopySlotServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn memory_technology(&self) -> MemoryTechnology {
        self.technology
    }

    /// Id of the ring region; receivers map it by this id.
    pub fn ring_id(&self) -> ShmId {
        self.ring.id()
    }

    /// Hands out a free slot for writing, or `None` when every slot is
    /// budgeted out.
    pub fn acquire_slot(&self) -> Option<SlotToken> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return None;
        }
        let index = inner
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)?;
        inner.slots[index].state = SlotState::WriterOwned;
        Some(SlotToken { index })
    }

    /// Mutable view of the payload of a writer-owned slot.
    ///
    /// The token is the exclusive capability for this slot, so handing
    /// out the slice under a shared server reference cannot alias
    /// another writer.
    #[allow(clippy::mut_from_ref)]
    pub fn access(&self, token: &SlotToken) -> &mut [u8] {
        let offset = self.layout.slot_offset(token.index) + self.layout.payload_offset;
        unsafe {
            std::slice::from_raw_parts_mut(self.ring.as_ptr().add(offset), self.layout.payload_size)
        }
    }

    /// Stamps the slot header of a writer-owned slot.
    pub fn write_header(&self, token: &SlotToken, header: SlotHeader) {
        let offset = self.layout.slot_offset(token.index);
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.ring.as_ptr().add(offset), SLOT_HEADER_SIZE)
        };
        header.write_to(bytes);
    }

    /// Reads back a slot header (receivers do the same through their own
    /// mapping).
    pub fn read_header(&self, index: usize) -> SlotHeader {
        let offset = self.layout.slot_offset(index);
        let bytes =
            unsafe { std::slice::from_raw_parts(self.ring.as_ptr().add(offset), SLOT_HEADER_SIZE) };
        SlotHeader::read_from(bytes)
    }

    /// Returns a writer-owned slot to the free pool without sending.
    pub fn unacquire_slot(&self, token: SlotToken) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.slots[token.index].state, SlotState::WriterOwned);
        inner.slots[token.index].state = SlotState::Free;
        inner.slots[token.index].holders = 0;
    }

    /// Publishes a slot to every connected receiver whose class has
    /// budget. Classes at their quota drop their oldest outstanding slot
    /// first and are appended to `dropped_classes`.
    ///
    /// A detected receiver fault is reported after delivery to the
    /// healthy receivers completed; the slot itself is in flight either
    /// way.
    pub fn send(
        &self,
        token: SlotToken,
        dropped_classes: &mut Vec<ClassHandle>,
    ) -> Result<(), ReceiverError> {
        let index = token.index;
        let error = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                inner.slots[index].state = SlotState::Free;
                return Ok(());
            }
            debug_assert_eq!(inner.slots[index].state, SlotState::WriterOwned);
            inner.slots[index].state = SlotState::InFlight;
            inner.slots[index].holders = 0;

            for class_index in 0..inner.classes.len() {
                if inner.classes[class_index].config.max_slots == 0 {
                    continue;
                }
                let members: Vec<usize> = inner.connected_members(class_index);
                if members.is_empty() {
                    continue;
                }

                if inner.classes[class_index].outstanding.len()
                    >= inner.classes[class_index].config.max_slots as usize
                {
                    if let Some(victim) = inner.classes[class_index].outstanding.pop_front() {
                        inner.drop_class_holds(class_index, victim);
                        debug!(class = class_index, victim, "class quota exhausted, dropped oldest slot");
                        dropped_classes.push(ClassHandle { index: class_index });
                    }
                }

                let mut delivered = false;
                for receiver_index in members {
                    let notify_result = inner.receivers[receiver_index]
                        .as_mut()
                        .expect("member index is occupied")
                        .channel
                        .notify(index as u64);
                    match notify_result {
                        Ok(()) => {
                            inner.slots[index].holders |= 1 << receiver_index;
                            delivered = true;
                        }
                        Err(err) => {
                            warn!(receiver_index, %err, "side channel write failed");
                            inner.mark_corrupted(receiver_index, ReceiverFault::PeerDisconnected);
                        }
                    }
                }
                if delivered {
                    inner.classes[class_index].outstanding.push_back(index);
                }
            }

            inner.first_unhandled_fault()
        };
        self.flush_transitions();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// A receiver finished reading a slot. Receivers drive this through
    /// their release path on the connection; releasing a slot the
    /// receiver does not hold is a protocol violation.
    pub fn release_slot(&self, id: ReceiverId, slot_index: usize) -> Result<(), ReceiverError> {
        let error = {
            let mut inner = self.inner.lock().unwrap();
            let Some(receiver_index) = inner.lookup(id) else {
                return Ok(());
            };
            let held = slot_index < inner.slots.len()
                && inner.slots[slot_index].holders & (1 << receiver_index) != 0;
            if !held {
                inner.mark_corrupted(receiver_index, ReceiverFault::Protocol);
                inner.first_unhandled_fault()
            } else {
                inner.release_hold(receiver_index, slot_index);
                None
            }
        };
        self.flush_transitions();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Returns fully released InFlight slots to the free pool. Reports a
    /// pending receiver fault the same way `send` does.
    pub fn reclaim(&self) -> Result<(), ReceiverError> {
        let error = {
            let mut inner = self.inner.lock().unwrap();
            for slot in inner.slots.iter_mut() {
                if slot.state == SlotState::InFlight && slot.holders == 0 {
                    slot.state = SlotState::Free;
                }
            }
            inner.first_unhandled_fault()
        };
        self.flush_transitions();
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn can_add_receiver(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.shut_down && inner.receivers.iter().any(Option::is_none)
    }

    /// Admits a receiver into `class`. The receiver starts `Connecting`
    /// and joins delivery once `connect_receiver` ran.
    pub fn add_receiver(
        &self,
        class: ClassHandle,
        mut channel: Box<dyn SideChannel>,
    ) -> Result<ReceiverId, AddReceiverError> {
        let mut inner = self.inner.lock().unwrap();
        let class_full = inner.classes[class.index].connections
            >= inner.classes[class.index].config.max_connections;
        let free_index = inner.receivers.iter().position(Option::is_none);
        if inner.shut_down || class_full || free_index.is_none() {
            // A rejected channel is closed synchronously; the caller only
            // sees the exhaustion error.
            channel.close();
            return Err(AddReceiverError::ResourceExhaustion);
        }
        let index = free_index.expect("checked above");

        let sequence = inner.next_sequence();
        inner.receivers[index] = Some(Receiver {
            sequence,
            class: class.index,
            state: ReceiverState::Connecting,
            fault: None,
            terminated: false,
            channel,
        });
        inner.classes[class.index].connections += 1;
        Ok(ReceiverId { index, sequence })
    }

    /// Moves a receiver from `Connecting` to `Connected`.
    pub fn connect_receiver(&self, id: ReceiverId) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(index) = inner.lookup(id) else {
                return;
            };
            let receiver = inner.receivers[index].as_mut().expect("looked up");
            if receiver.state == ReceiverState::Connecting {
                receiver.state = ReceiverState::Connected;
                inner
                    .pending_transitions
                    .push((id, ReceiverState::Connected, None));
            }
        }
        self.flush_transitions();
    }

    /// Forcibly releases everything a faulted receiver holds and closes
    /// its channel. The receiver record stays until `remove_receiver`.
    pub fn terminate_receiver(&self, id: ReceiverId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.lookup(id) else {
            return;
        };
        inner.release_all_holds(index);
        let receiver = inner.receivers[index].as_mut().expect("looked up");
        receiver.terminated = true;
        receiver.channel.close();
    }

    /// Removes a receiver. Precondition: `!is_receiver_in_use(id)`.
    pub fn remove_receiver(&self, id: ReceiverId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.lookup(id) else {
            return;
        };
        debug_assert_eq!(inner.slot_holds(index), 0, "receiver still holds slots");
        let mut receiver = inner.receivers[index].take().expect("looked up");
        receiver.channel.close();
        inner.classes[receiver.class].connections -= 1;
    }

    pub fn receiver_state(&self, id: ReceiverId) -> Option<(ReceiverState, Option<ReceiverFault>)> {
        let inner = self.inner.lock().unwrap();
        let index = inner.lookup(id)?;
        let receiver = inner.receivers[index].as_ref().expect("looked up");
        Some((receiver.state, receiver.fault))
    }

    pub fn is_receiver_in_use(&self, id: ReceiverId) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(index) = inner.lookup(id) else {
            return false;
        };
        let receiver = inner.receivers[index].as_ref().expect("looked up");
        inner.slot_holds(index) != 0 || receiver.channel.is_in_use()
    }

    /// Marks a receiver disconnected (orderly peer shutdown observed on
    /// its connection).
    pub fn disconnect_receiver(&self, id: ReceiverId) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(index) = inner.lookup(id) else {
                return;
            };
            inner.release_all_holds(index);
            let receiver = inner.receivers[index].as_mut().expect("looked up");
            if receiver.state != ReceiverState::Disconnected {
                receiver.state = ReceiverState::Disconnected;
                receiver.channel.close();
                inner
                    .pending_transitions
                    .push((id, ReceiverState::Disconnected, None));
            }
        }
        self.flush_transitions();
    }

    /// True while asynchronous teardown work is still pending.
    pub fn is_in_use(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.pending_transitions.is_empty()
            || inner
                .receivers
                .iter()
                .flatten()
                .any(|receiver| receiver.channel.is_in_use())
    }

    /// Begins asynchronous teardown: closes every receiver channel and
    /// stops handing out slots. `is_in_use` falls to false once nothing
    /// is pending.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shut_down = true;
        for index in 0..inner.receivers.len() {
            if inner.receivers[index].is_some() {
                inner.release_all_holds(index);
                let receiver = inner.receivers[index].as_mut().expect("checked");
                receiver.terminated = true;
                receiver.channel.close();
            }
        }
        for slot in inner.slots.iter_mut() {
            slot.state = SlotState::Free;
            slot.holders = 0;
        }
        inner.pending_transitions.clear();
    }

    /// Delivers queued receiver-state transitions outside the lock; the
    /// owner's callback may re-enter the server.
    fn flush_transitions(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                if inner.pending_transitions.is_empty() {
                    None
                } else {
                    Some(inner.pending_transitions.remove(0))
                }
            };
            let Some((id, state, fault)) = next else {
                return;
            };
            (self.callback)(id, state, fault);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding_in_class(&self, class: ClassHandle) -> usize {
        self.inner.lock().unwrap().classes[class.index].outstanding.len()
    }

    #[cfg(test)]
    pub(crate) fn free_slot_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Free)
            .count()
    }
}

impl ServerInner {
    fn next_sequence(&mut self) -> u64 {
        // Sequences are per-server and only need to outpace slot reuse.
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn lookup(&self, id: ReceiverId) -> Option<usize> {
        let receiver = self.receivers.get(id.index)?.as_ref()?;
        (receiver.sequence == id.sequence).then_some(id.index)
    }

    fn connected_members(&self, class_index: usize) -> Vec<usize> {
        self.receivers
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let receiver = slot.as_ref()?;
                (receiver.class == class_index
                    && receiver.state == ReceiverState::Connected
                    && !receiver.terminated)
                    .then_some(index)
            })
            .collect()
    }

    /// All slot indexes currently held by receiver `index`, as a count.
    fn slot_holds(&self, index: usize) -> usize {
        let bit = 1u64 << index;
        self.slots.iter().filter(|slot| slot.holders & bit != 0).count()
    }

    fn mark_corrupted(&mut self, index: usize, fault: ReceiverFault) {
        let receiver = self.receivers[index].as_mut().expect("corrupting live receiver");
        if receiver.state == ReceiverState::Corrupted {
            return;
        }
        receiver.state = ReceiverState::Corrupted;
        receiver.fault = Some(fault);
        let id = ReceiverId {
            index,
            sequence: receiver.sequence,
        };
        self.pending_transitions
            .push((id, ReceiverState::Corrupted, Some(fault)));
    }

    /// Clears every hold of class `class_index` members on `victim`; the
    /// slot becomes free if nobody else reads it.
    fn drop_class_holds(&mut self, class_index: usize, victim: usize) {
        let mut mask = 0u64;
        for (index, slot) in self.receivers.iter().enumerate() {
            if let Some(receiver) = slot {
                if receiver.class == class_index {
                    mask |= 1 << index;
                }
            }
        }
        self.slots[victim].holders &= !mask;
        if self.slots[victim].state == SlotState::InFlight && self.slots[victim].holders == 0 {
            self.slots[victim].state = SlotState::Free;
        }
    }

    /// Clears one receiver's hold on one slot and updates the class
    /// outstanding queue.
    fn release_hold(&mut self, receiver_index: usize, slot_index: usize) {
        self.slots[slot_index].holders &= !(1 << receiver_index);
        let class_index = self.receivers[receiver_index]
            .as_ref()
            .expect("releasing for live receiver")
            .class;
        let mut class_mask = 0u64;
        for (index, slot) in self.receivers.iter().enumerate() {
            if let Some(receiver) = slot {
                if receiver.class == class_index {
                    class_mask |= 1 << index;
                }
            }
        }
        if self.slots[slot_index].holders & class_mask == 0 {
            self.classes[class_index]
                .outstanding
                .retain(|&slot| slot != slot_index);
        }
    }

    fn release_all_holds(&mut self, receiver_index: usize) {
        let held: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot_index, slot)| {
                (slot.holders & (1 << receiver_index) != 0).then_some(slot_index)
            })
            .collect();
        for slot_index in held {
            self.release_hold(receiver_index, slot_index);
        }
    }

    fn first_unhandled_fault(&self) -> Option<ReceiverError> {
        self.receivers.iter().enumerate().find_map(|(index, slot)| {
            let receiver = slot.as_ref()?;
            if receiver.state == ReceiverState::Corrupted && !receiver.terminated {
                Some(ReceiverError {
                    receiver: ReceiverId {
                        index,
                        sequence: receiver.sequence,
                    },
                    fault: receiver.fault.unwrap_or(ReceiverFault::Protocol),
                })
            } else {
                None
            }
        })
    }
}
