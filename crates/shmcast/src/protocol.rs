// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol messages carried over the side channel.
//!
//! Each message is a fixed-layout little-endian record prefixed by a 1-byte
//! tag; fields sit on their natural alignment and every record is padded to
//! a multiple of 8 bytes. [`MAX_MESSAGE_SIZE`] bounds the wire size.
//!
//! | Tag | Message                  | Record size |
//! |-----|--------------------------|-------------|
//! | 1   | `ConnectionRequest`      | 48          |
//! | 2   | `ConnectionAck`          | 16          |
//! | 3   | `AckQueueInitialization` | 8           |
//! | 4   | `StartListening`         | 8           |
//! | 5   | `StopListening`          | 8           |
//! | 6   | `Shutdown`               | 8           |
//!
//! A memory exchange handle cannot ride inside the record (the side channel
//! carries it out of band, next to the message). `ConnectionRequest` is
//! therefore sent twice with identical geometry: `part` 0 accompanies the
//! slot-pool handle, `part` 1 the server-queue handle. The receiver
//! cross-checks that both parts agree.
//!
//! Decoding is strict: unknown tag, wrong record length or any field
//! violating the geometry limits is a protocol violation, and the caller
//! transitions to its corrupted state.

use crate::config::{QueueConfig, SlotPoolConfig};
use crate::error::{Error, Result};

/// Largest record the protocol ever produces (`ConnectionRequest`)
pub const MAX_MESSAGE_SIZE: usize = 48;

const TAG_CONNECTION_REQUEST: u8 = 1;
const TAG_CONNECTION_ACK: u8 = 2;
const TAG_ACK_QUEUE_INIT: u8 = 3;
const TAG_START_LISTENING: u8 = 4;
const TAG_STOP_LISTENING: u8 = 5;
const TAG_SHUTDOWN: u8 = 6;

/// Which memory handle accompanies a `ConnectionRequest` part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePart {
    /// First part: the slot pool region handle rides along
    PoolMemory,
    /// Second part: the server queue region handle rides along
    QueueMemory,
}

impl HandlePart {
    fn to_wire(self) -> u8 {
        match self {
            Self::PoolMemory => 0,
            Self::QueueMemory => 1,
        }
    }

    fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Self::PoolMemory),
            1 => Ok(Self::QueueMemory),
            other => Err(Error::Protocol(format!(
                "connection request part {other} (expected 0 or 1)"
            ))),
        }
    }
}

/// Typed envelope for one side-channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Server → client: channel geometry; sent twice (see [`HandlePart`])
    ConnectionRequest {
        /// Which handle accompanies this part
        part: HandlePart,
        /// Group identifier of the issuing server
        group: u64,
        /// Slot pool geometry
        pool: SlotPoolConfig,
        /// Geometry of the server-allocated (available) queue
        server_queue: QueueConfig,
    },
    /// Client → server: client accepted; its free-queue handle rides along
    ConnectionAck {
        /// Geometry of the client-allocated (free) queue
        client_queue: QueueConfig,
    },
    /// Server → client: free queue attached, channel is live
    AckQueueInitialization,
    /// Client → server: deliver wake-up notifications after each publish
    StartListening,
    /// Client → server: stop delivering wake-up notifications
    StopListening,
    /// Either direction: orderly teardown
    Shutdown,
}

impl Message {
    /// Encode into `buf`, returning the record length.
    ///
    /// `buf` must hold [`MAX_MESSAGE_SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        debug_assert!(buf.len() >= MAX_MESSAGE_SIZE);
        buf[..MAX_MESSAGE_SIZE].fill(0);
        match self {
            Self::ConnectionRequest {
                part,
                group,
                pool,
                server_queue,
            } => {
                buf[0] = TAG_CONNECTION_REQUEST;
                buf[1] = part.to_wire();
                buf[8..16].copy_from_slice(&group.to_le_bytes());
                buf[16..20].copy_from_slice(&pool.slot_count.to_le_bytes());
                buf[20..24].copy_from_slice(&pool.slot_size.to_le_bytes());
                buf[24..28].copy_from_slice(&pool.slot_align.to_le_bytes());
                buf[28..32].copy_from_slice(&pool.payload_size.to_le_bytes());
                buf[32..36].copy_from_slice(&pool.payload_align.to_le_bytes());
                buf[36..40].copy_from_slice(&server_queue.capacity.to_le_bytes());
                buf[40..44].copy_from_slice(&server_queue.entry_width.to_le_bytes());
                48
            }
            Self::ConnectionAck { client_queue } => {
                buf[0] = TAG_CONNECTION_ACK;
                buf[4..8].copy_from_slice(&client_queue.capacity.to_le_bytes());
                buf[8..12].copy_from_slice(&client_queue.entry_width.to_le_bytes());
                16
            }
            Self::AckQueueInitialization => {
                buf[0] = TAG_ACK_QUEUE_INIT;
                8
            }
            Self::StartListening => {
                buf[0] = TAG_START_LISTENING;
                8
            }
            Self::StopListening => {
                buf[0] = TAG_STOP_LISTENING;
                8
            }
            Self::Shutdown => {
                buf[0] = TAG_SHUTDOWN;
                8
            }
        }
    }

    /// Decode and validate one record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let tag = *bytes
            .first()
            .ok_or_else(|| Error::Protocol("empty message".into()))?;
        match tag {
            TAG_CONNECTION_REQUEST => {
                expect_len(bytes, 48)?;
                let part = HandlePart::from_wire(bytes[1])?;
                let pool = SlotPoolConfig {
                    slot_count: read_u32(bytes, 16),
                    slot_size: read_u32(bytes, 20),
                    slot_align: read_u32(bytes, 24),
                    payload_size: read_u32(bytes, 28),
                    payload_align: read_u32(bytes, 32),
                };
                pool.validate()?;
                let server_queue = QueueConfig {
                    capacity: read_u32(bytes, 36),
                    entry_width: read_u32(bytes, 40),
                };
                server_queue.validate()?;
                Ok(Self::ConnectionRequest {
                    part,
                    group: read_u64(bytes, 8),
                    pool,
                    server_queue,
                })
            }
            TAG_CONNECTION_ACK => {
                expect_len(bytes, 16)?;
                let client_queue = QueueConfig {
                    capacity: read_u32(bytes, 4),
                    entry_width: read_u32(bytes, 8),
                };
                client_queue.validate()?;
                Ok(Self::ConnectionAck { client_queue })
            }
            TAG_ACK_QUEUE_INIT => {
                expect_len(bytes, 8)?;
                Ok(Self::AckQueueInitialization)
            }
            TAG_START_LISTENING => {
                expect_len(bytes, 8)?;
                Ok(Self::StartListening)
            }
            TAG_STOP_LISTENING => {
                expect_len(bytes, 8)?;
                Ok(Self::StopListening)
            }
            TAG_SHUTDOWN => {
                expect_len(bytes, 8)?;
                Ok(Self::Shutdown)
            }
            other => Err(Error::Protocol(format!("unknown message tag {other}"))),
        }
    }

    /// Encode into a fresh buffer (convenience for the side channel)
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let len = self.encode(&mut buf);
        buf[..len].to_vec()
    }
}

fn expect_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(Error::Protocol(format!(
            "record length {} for tag {} (expected {expected})",
            bytes.len(),
            bytes[0]
        )));
    }
    Ok(())
}

#[inline]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::INDEX_WIDTH;

    fn request(part: HandlePart) -> Message {
        Message::ConnectionRequest {
            part,
            group: 0xDEAD_BEEF_0042,
            pool: SlotPoolConfig {
                slot_count: 4,
                slot_size: 64,
                slot_align: 8,
                payload_size: 48,
                payload_align: 8,
            },
            server_queue: QueueConfig {
                capacity: 4,
                entry_width: INDEX_WIDTH,
            },
        }
    }

    #[test]
    fn test_roundtrip_all_messages() {
        let messages = [
            request(HandlePart::PoolMemory),
            request(HandlePart::QueueMemory),
            Message::ConnectionAck {
                client_queue: QueueConfig {
                    capacity: 8,
                    entry_width: INDEX_WIDTH,
                },
            },
            Message::AckQueueInitialization,
            Message::StartListening,
            Message::StopListening,
            Message::Shutdown,
        ];
        for msg in messages {
            let bytes = msg.to_vec();
            assert!(bytes.len() <= MAX_MESSAGE_SIZE);
            assert_eq!(bytes.len() % 8, 0, "record not padded to 8 bytes");
            assert_eq!(Message::decode(&bytes).expect("decode failed"), msg);
        }
    }

    #[test]
    fn test_connection_request_layout() {
        let bytes = request(HandlePart::QueueMemory).to_vec();
        assert_eq!(bytes.len(), 48);
        assert_eq!(bytes[0], 1); // tag
        assert_eq!(bytes[1], 1); // part
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 0xDEAD_BEEF_0042);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 4);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            Message::decode(&[9, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_empty_message_rejected() {
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut bytes = request(HandlePart::PoolMemory).to_vec();
        bytes.truncate(40);
        assert!(matches!(Message::decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_oversized_bare_record_rejected() {
        assert!(Message::decode(&[6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let mut bytes = request(HandlePart::PoolMemory).to_vec();
        bytes[24..28].copy_from_slice(&3u32.to_le_bytes()); // slot_align = 3
        assert!(matches!(Message::decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bad_part_rejected() {
        let mut bytes = request(HandlePart::PoolMemory).to_vec();
        bytes[1] = 7;
        assert!(matches!(Message::decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_wrong_entry_width_rejected() {
        let mut bytes = request(HandlePart::PoolMemory).to_vec();
        bytes[40..44].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(Message::decode(&bytes), Err(Error::Protocol(_))));
    }
}
