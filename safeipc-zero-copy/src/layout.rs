// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Slot geometry inside the shared-memory ring.
//!
//! Every slot is `header | padding | sample`; the sample start honors
//! the configured payload alignment and the header layout is part of the
//! wire contract with receivers.

/// Size of the on-wire slot header: four u64 fields.
pub const SLOT_HEADER_SIZE: usize = 32;

/// Header preceding every sample in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotHeader {
    /// Steady-clock nanoseconds stamped at send time.
    pub timestamp_ns: u64,
    /// Process-wide session counter, starts at 1.
    pub sequence: u64,
    /// Offset of the sample relative to the slot base.
    pub payload_offset: u64,
    pub payload_size: u64,
}

impl SlotHeader {
    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.payload_offset.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.payload_size.to_le_bytes());
    }

    pub fn read_from(bytes: &[u8]) -> SlotHeader {
        let field = |range: std::ops::Range<usize>| {
            let mut buffer = [0u8; 8];
            buffer.copy_from_slice(&bytes[range]);
            u64::from_le_bytes(buffer)
        };
        SlotHeader {
            timestamp_ns: field(0..8),
            sequence: field(8..16),
            payload_offset: field(16..24),
            payload_size: field(24..32),
        }
    }
}

/// Computed geometry of a slot ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot_count: usize,
    pub payload_size: usize,
    pub payload_align: usize,
    /// Offset of the sample within a slot.
    pub payload_offset: usize,
    /// Distance between consecutive slot bases.
    pub stride: usize,
}

impl SlotLayout {
    /// Computes the geometry for `slot_count` slots of `payload_size`
    /// bytes aligned to `payload_align` (a power of two).
    pub fn compute(slot_count: usize, payload_size: usize, payload_align: usize) -> SlotLayout {
        debug_assert!(payload_align.is_power_of_two());
        let payload_offset = align_up(SLOT_HEADER_SIZE, payload_align);
        // Stride keeps every slot base (and with it every sample) on the
        // payload alignment.
        let stride = align_up(payload_offset + payload_size.max(1), payload_align.max(8));
        SlotLayout {
            slot_count,
            payload_size,
            payload_align,
            payload_offset,
            stride,
        }
    }

    pub fn total_size(&self) -> usize {
        self.slot_count * self.stride
    }

    pub fn slot_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.slot_count);
        index * self.stride
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = SlotHeader {
            timestamp_ns: 123_456_789,
            sequence: 42,
            payload_offset: 32,
            payload_size: 100,
        };
        let mut bytes = [0u8; SLOT_HEADER_SIZE];
        header.write_to(&mut bytes);
        assert_eq!(SlotHeader::read_from(&bytes), header);
    }

    #[test]
    fn payload_lands_on_alignment() {
        for align in [1usize, 4, 8, 64, 128] {
            let layout = SlotLayout::compute(4, 100, align);
            assert_eq!(layout.payload_offset % align, 0);
            assert!(layout.payload_offset >= SLOT_HEADER_SIZE);
            for index in 0..4 {
                let sample = layout.slot_offset(index) + layout.payload_offset;
                assert_eq!(sample % align, 0, "align {align} index {index}");
            }
            assert!(layout.stride >= layout.payload_offset + 100);
        }
    }

    #[test]
    fn total_size_covers_all_slots() {
        let layout = SlotLayout::compute(8, 256, 64);
        assert_eq!(layout.total_size(), 8 * layout.stride);
    }
}
