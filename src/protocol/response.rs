//! Generic response payloads: OK, ERR, EOF, and the first-byte
//! discrimination rules.
//!
//! Response discrimination on the first payload byte:
//! - `0x00`: OK
//! - `0xFF`: ERR
//! - `0xFE`, payload length < 9: EOF (or an OK-shaped terminator when
//!   DEPRECATE_EOF is negotiated)
//! - `0xFE`, payload length >= 9: AuthSwitchRequest (connection phase only)
//! - anything else: length-encoded column count introducing a result set

use zerocopy::byteorder::little_endian::U16 as U16LE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::constant::ServerStatusFlags;
use crate::error::{Error, Result};
use crate::protocol::packet::MAX_PAYLOAD;
use crate::protocol::primitive::{Reader, lossy_string};

/// Parsed OK packet (also used for DEPRECATE_EOF terminators, which are
/// OK-shaped with header byte 0xFE).
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: ServerStatusFlags,
    pub warnings: u16,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let header = r.u8()?;
        if header != 0x00 && header != 0xFE {
            return Err(Error::InvalidPacket);
        }
        let affected_rows = r.lenenc_int()?;
        let last_insert_id = r.lenenc_int()?;
        let status = ServerStatusFlags::from_bits_truncate(r.u16_le()?);
        let warnings = r.u16_le()?;
        Ok(Self {
            affected_rows,
            last_insert_id,
            status,
            warnings,
        })
    }
}

/// Server-reported SQL error.
///
/// Layout: `0xFF`, 2-byte error code, `#`, 5-byte SQLSTATE, message to EOF.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ERROR {} ({}): {}", self.code, self.sql_state, self.message)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let header = r.u8()?;
        debug_assert_eq!(header, 0xFF);
        let code = r.u16_le()?;
        // The '#' marker precedes the SQLSTATE in the 4.1 protocol.
        let _marker = r.bytes(1)?;
        let sql_state = lossy_string(r.bytes(5)?);
        let message = lossy_string(r.rest());
        Ok(Self {
            code,
            sql_state,
            message,
        })
    }
}

/// Tail of a legacy EOF packet (zero-copy): warnings then status flags.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct EofTail {
    warnings: U16LE,
    status: U16LE,
}

impl EofTail {
    pub fn warnings(&self) -> u16 {
        self.warnings.get()
    }

    pub fn status(&self) -> ServerStatusFlags {
        ServerStatusFlags::from_bits_truncate(self.status.get())
    }
}

/// Parse a legacy EOF packet (header byte 0xFE, payload length < 9).
pub fn parse_eof(payload: &[u8]) -> Result<&EofTail> {
    let mut r = Reader::new(payload);
    if r.u8()? != 0xFE {
        return Err(Error::InvalidPacket);
    }
    let rest = r.rest();
    if rest.len() < 4 {
        return Err(Error::InvalidPacket);
    }
    EofTail::ref_from_bytes(&rest[..4]).map_err(|_| Error::InvalidPacket)
}

pub fn is_err(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFF)
}

pub fn is_ok(payload: &[u8]) -> bool {
    payload.first() == Some(&0x00)
}

/// Legacy EOF: header 0xFE and fewer than 9 payload bytes.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

/// End-of-column-set / end-of-result-set marker.
///
/// With DEPRECATE_EOF the terminator is an OK-shaped packet with header
/// 0xFE; a 0xFE first byte could otherwise open a 16 MiB length-encoded
/// row cell, which is why the payload length is consulted and not the
/// header alone. Without DEPRECATE_EOF the legacy EOF rule applies.
pub fn is_result_end(payload: &[u8], deprecate_eof: bool) -> bool {
    if payload.first() != Some(&0xFE) {
        return false;
    }
    if deprecate_eof {
        payload.len() < MAX_PAYLOAD
    } else {
        payload.len() < 9
    }
}

/// Terminator status flags: OK-shaped under DEPRECATE_EOF, legacy EOF tail
/// otherwise.
pub fn result_end_status(payload: &[u8], deprecate_eof: bool) -> Result<ServerStatusFlags> {
    if deprecate_eof {
        Ok(OkPacket::parse(payload)?.status)
    } else {
        Ok(parse_eof(payload)?.status())
    }
}

#[cfg(test)]
#[path = "response_test.rs"]
mod response_test;
