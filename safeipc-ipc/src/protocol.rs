// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the three-message connection-establishment exchange.
//!
//! Every message is a u32 length prefix followed by a fixed-layout
//! payload; integers are little-endian, region ids are 16 opaque bytes.
//! The exchange order is fixed: C2S1, S2C1, C2S2.

use crate::platform::shm::{ShmId, SHM_ID_LEN};
use nix::errno::Errno;
use std::os::fd::RawFd;

/// Hard protocol minimum for the server-to-client ring, in bytes.
/// Requests below it are served with exactly this size.
pub const MIN_BUFFER_SIZE: u64 = 4096;

/// Size of the notification ring provisioned per connection.
pub const NOTIFICATION_RING_SIZE: usize = 4096;

/// Version of the handshake and stream protocol spoken by this server.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Upper bound on any handshake frame; larger prefixes are a framing
/// violation, not a large message.
const MAX_FRAME_PAYLOAD: usize = 64;

const LENGTH_PREFIX_SIZE: usize = 4;

/// IPC protocol version as exchanged in C2S1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    /// Only a major-version mismatch is fatal; minors are compatible.
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

/// Violation of the handshake wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame payload of {got} bytes, expected {expected}")]
    Length { got: usize, expected: usize },
    #[error("frame length prefix {0} exceeds protocol maximum")]
    Oversize(usize),
}

/// First client message: protocol version, requested server-to-client
/// ring size and the id of the client-created client-to-server ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientToServer1 {
    pub version: ProtocolVersion,
    pub requested_s2c_size: u64,
    pub c2s_shm_id: ShmId,
}

impl ClientToServer1 {
    pub const WIRE_SIZE: usize = 2 + 8 + SHM_ID_LEN;

    pub fn decode(payload: &[u8]) -> Result<ClientToServer1, WireError> {
        if payload.len() != Self::WIRE_SIZE {
            return Err(WireError::Length {
                got: payload.len(),
                expected: Self::WIRE_SIZE,
            });
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&payload[2..10]);
        let mut id = [0u8; SHM_ID_LEN];
        id.copy_from_slice(&payload[10..]);
        Ok(ClientToServer1 {
            version: ProtocolVersion {
                major: payload[0],
                minor: payload[1],
            },
            requested_s2c_size: u64::from_le_bytes(size),
            c2s_shm_id: ShmId::from_bytes(id),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + Self::WIRE_SIZE);
        frame.extend_from_slice(&(Self::WIRE_SIZE as u32).to_le_bytes());
        frame.push(self.version.major);
        frame.push(self.version.minor);
        frame.extend_from_slice(&self.requested_s2c_size.to_le_bytes());
        frame.extend_from_slice(self.c2s_shm_id.as_bytes());
        frame
    }
}

/// Server reply: the agreed ring size and the ids of the two
/// server-created regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerToClient1 {
    pub agreed_s2c_size: u64,
    pub s2c_shm_id: ShmId,
    pub notification_shm_id: ShmId,
}

impl ServerToClient1 {
    pub const WIRE_SIZE: usize = 8 + SHM_ID_LEN + SHM_ID_LEN;

    pub fn decode(payload: &[u8]) -> Result<ServerToClient1, WireError> {
        if payload.len() != Self::WIRE_SIZE {
            return Err(WireError::Length {
                got: payload.len(),
                expected: Self::WIRE_SIZE,
            });
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&payload[..8]);
        let mut s2c = [0u8; SHM_ID_LEN];
        s2c.copy_from_slice(&payload[8..8 + SHM_ID_LEN]);
        let mut notification = [0u8; SHM_ID_LEN];
        notification.copy_from_slice(&payload[8 + SHM_ID_LEN..]);
        Ok(ServerToClient1 {
            agreed_s2c_size: u64::from_le_bytes(size),
            s2c_shm_id: ShmId::from_bytes(s2c),
            notification_shm_id: ShmId::from_bytes(notification),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + Self::WIRE_SIZE);
        frame.extend_from_slice(&(Self::WIRE_SIZE as u32).to_le_bytes());
        frame.extend_from_slice(&self.agreed_s2c_size.to_le_bytes());
        frame.extend_from_slice(self.s2c_shm_id.as_bytes());
        frame.extend_from_slice(self.notification_shm_id.as_bytes());
        frame
    }
}

/// Final client acknowledgment: both server regions are open on the
/// client side. Receipt alone completes the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientToServer2;

impl ClientToServer2 {
    pub const WIRE_SIZE: usize = 0;

    pub fn decode(payload: &[u8]) -> Result<ClientToServer2, WireError> {
        if !payload.is_empty() {
            return Err(WireError::Length {
                got: payload.len(),
                expected: 0,
            });
        }
        Ok(ClientToServer2)
    }

    pub fn encode(&self) -> Vec<u8> {
        0u32.to_le_bytes().to_vec()
    }
}

/// The ring size granted for a client request, bounded by the configured
/// maximum and never below the protocol minimum.
pub fn agree_s2c_size(requested: u64, max_hint: u64) -> u64 {
    let upper = max_hint.max(MIN_BUFFER_SIZE);
    requested.clamp(MIN_BUFFER_SIZE, upper)
}

/// Incremental reader for length-prefixed frames on a nonblocking
/// socket. Bytes beyond the current frame stay buffered so a client that
/// batches several messages loses nothing.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

/// Result of one read pass.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadProgress {
    /// The socket would block; try again on the next readiness event.
    Pending,
    /// The peer closed the connection.
    Eof,
}

impl FrameReader {
    /// Reads whatever the socket has available into the buffer.
    pub fn fill(&mut self, fd: RawFd) -> Result<ReadProgress, Errno> {
        loop {
            let mut chunk = [0u8; 256];
            let read = Errno::result(unsafe {
                libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
            });
            match read {
                Ok(0) => return Ok(ReadProgress::Eof),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n as usize]),
                Err(Errno::EAGAIN) => return Ok(ReadProgress::Pending),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }

    /// Takes one complete frame payload out of the buffer, if present.
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let payload_len = u32::from_le_bytes(prefix) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(WireError::Oversize(payload_len));
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE + payload_len {
            return Ok(None);
        }
        let payload = self.buffer[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + payload_len].to_vec();
        self.buffer.drain(..LENGTH_PREFIX_SIZE + payload_len);
        Ok(Some(payload))
    }
}

/// Incremental writer for one encoded frame on a nonblocking socket.
#[derive(Debug)]
pub struct FrameWriter {
    frame: Vec<u8>,
    written: usize,
}

/// Result of one write pass.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteProgress {
    Done,
    /// The socket would block before the frame was fully written.
    Pending,
}

impl FrameWriter {
    pub fn new(frame: Vec<u8>) -> FrameWriter {
        FrameWriter { frame, written: 0 }
    }

    pub fn flush(&mut self, fd: RawFd) -> Result<WriteProgress, Errno> {
        while self.written < self.frame.len() {
            let remaining = &self.frame[self.written..];
            let wrote = Errno::result(unsafe {
                libc::write(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            });
            match wrote {
                Ok(n) => self.written += n as usize,
                Err(Errno::EAGAIN) => return Ok(WriteProgress::Pending),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
        Ok(WriteProgress::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn c2s1_round_trips() {
        let message = ClientToServer1 {
            version: PROTOCOL_VERSION,
            requested_s2c_size: 65536,
            c2s_shm_id: ShmId::from_bytes([7; SHM_ID_LEN]),
        };
        let frame = message.encode();
        assert_eq!(frame.len(), 4 + ClientToServer1::WIRE_SIZE);
        let decoded = ClientToServer1::decode(&frame[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn s2c1_round_trips() {
        let message = ServerToClient1 {
            agreed_s2c_size: MIN_BUFFER_SIZE,
            s2c_shm_id: ShmId::generate(),
            notification_shm_id: ShmId::generate(),
        };
        let decoded = ServerToClient1::decode(&message.encode()[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn short_and_long_payloads_are_rejected() {
        assert_eq!(
            ClientToServer1::decode(&[0; 10]),
            Err(WireError::Length {
                got: 10,
                expected: ClientToServer1::WIRE_SIZE
            })
        );
        assert_eq!(
            ClientToServer2::decode(&[0]),
            Err(WireError::Length {
                got: 1,
                expected: 0
            })
        );
    }

    #[test]
    fn size_agreement_clamps_both_ends() {
        let max = 1024 * 1024;
        assert_eq!(agree_s2c_size(0, max), MIN_BUFFER_SIZE);
        assert_eq!(agree_s2c_size(MIN_BUFFER_SIZE - 1, max), MIN_BUFFER_SIZE);
        assert_eq!(agree_s2c_size(8192, max), 8192);
        assert_eq!(agree_s2c_size(2 * max, max), max);
        // A hint below the protocol minimum is raised to it.
        assert_eq!(agree_s2c_size(100, 100), MIN_BUFFER_SIZE);
    }

    #[test]
    fn reader_handles_split_and_batched_frames() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut reader = FrameReader::default();

        // Nothing yet.
        assert_eq!(reader.fill(rx.as_raw_fd()).unwrap(), ReadProgress::Pending);
        assert_eq!(reader.take_frame().unwrap(), None);

        let first = ClientToServer1 {
            version: PROTOCOL_VERSION,
            requested_s2c_size: 4096,
            c2s_shm_id: ShmId::from_bytes([1; SHM_ID_LEN]),
        }
        .encode();
        let second = ClientToServer2.encode();

        // First frame split in the middle, second batched right behind.
        use std::io::Write;
        tx.write_all(&first[..7]).unwrap();
        assert_eq!(reader.fill(rx.as_raw_fd()).unwrap(), ReadProgress::Pending);
        assert_eq!(reader.take_frame().unwrap(), None);

        tx.write_all(&first[7..]).unwrap();
        tx.write_all(&second).unwrap();
        assert_eq!(reader.fill(rx.as_raw_fd()).unwrap(), ReadProgress::Pending);
        let frame = reader.take_frame().unwrap().unwrap();
        assert_eq!(frame.len(), ClientToServer1::WIRE_SIZE);
        let frame = reader.take_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 0);
        assert_eq!(reader.take_frame().unwrap(), None);
    }

    #[test]
    fn reader_reports_eof_and_oversize() {
        let (tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut reader = FrameReader::default();
        drop(tx);
        assert_eq!(reader.fill(rx.as_raw_fd()).unwrap(), ReadProgress::Eof);

        let mut reader = FrameReader::default();
        reader.buffer.extend_from_slice(&1000u32.to_le_bytes());
        assert_eq!(reader.take_frame(), Err(WireError::Oversize(1000)));
    }

    #[test]
    fn writer_finishes_across_would_block() {
        let (tx, rx) = UnixStream::pair().unwrap();
        tx.set_nonblocking(true).unwrap();

        // Flood until the kernel buffer pushes back.
        let big = vec![0xabu8; 512 * 1024];
        let mut writer = FrameWriter::new(big.clone());
        let mut progress = writer.flush(tx.as_raw_fd()).unwrap();
        while progress == WriteProgress::Done {
            writer = FrameWriter::new(big.clone());
            progress = writer.flush(tx.as_raw_fd()).unwrap();
        }

        // Alternate draining the peer with flushing until the frame is out.
        use std::io::Read;
        let mut sink = vec![0u8; 1024 * 1024];
        let mut rx_nonblocking = rx;
        rx_nonblocking.set_nonblocking(true).unwrap();
        loop {
            match writer.flush(tx.as_raw_fd()).unwrap() {
                WriteProgress::Done => break,
                WriteProgress::Pending => loop {
                    match rx_nonblocking.read(&mut sink) {
                        Ok(0) => panic!("peer closed"),
                        Ok(_) => {}
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => panic!("{e}"),
                    }
                },
            }
        }
    }
}
