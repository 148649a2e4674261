//! MySQL packet framing.
//!
//! Every packet is `[length: 3 bytes LE][sequence: 1 byte][payload]`.
//! Payloads of 16 MiB or more are split into consecutive packets of
//! exactly `MAX_PAYLOAD` bytes; a payload that is an exact multiple is
//! terminated by an empty packet.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// MySQL packet header (zero-copy)
///
/// Layout matches the wire protocol:
/// - length: 3 bytes (little-endian, payload length)
/// - sequence_id: 1 byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = u32::to_le_bytes(length as u32);
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < 4 {
            return Err(Error::InvalidPacket);
        }
        Self::ref_from_bytes(&data[..4]).map_err(|_| Error::InvalidPacket)
    }
}

/// Frame `payload` into `out` as one or more packets starting at
/// `sequence_id`. Returns the next sequence id.
pub fn write_frames(out: &mut Vec<u8>, mut sequence_id: u8, payload: &[u8]) -> u8 {
    let mut remaining = payload;
    loop {
        let chunk_len = remaining.len().min(MAX_PAYLOAD);
        let (chunk, rest) = remaining.split_at(chunk_len);
        out.extend_from_slice(PacketHeader::encode(chunk_len, sequence_id).as_bytes());
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
        remaining = rest;
        // An exactly-full chunk needs a follow-up packet; an empty final
        // packet terminates a payload that is a multiple of MAX_PAYLOAD.
        if chunk_len < MAX_PAYLOAD {
            break;
        }
    }
    sequence_id
}
