//! Command-phase encodings and the prepare response.

use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::value::Param;

/// COM_QUERY
pub fn write_query(out: &mut Vec<u8>, sql: &str) {
    put_u8(out, CommandByte::Query as u8);
    out.extend_from_slice(sql.as_bytes());
}

/// COM_STMT_PREPARE
pub fn write_prepare(out: &mut Vec<u8>, sql: &str) {
    put_u8(out, CommandByte::StmtPrepare as u8);
    out.extend_from_slice(sql.as_bytes());
}

/// COM_STMT_CLOSE (no server response)
pub fn write_close_statement(out: &mut Vec<u8>, statement_id: u32) {
    put_u8(out, CommandByte::StmtClose as u8);
    put_u32_le(out, statement_id);
}

/// COM_STMT_RESET
pub fn write_reset_statement(out: &mut Vec<u8>, statement_id: u32) {
    put_u8(out, CommandByte::StmtReset as u8);
    put_u32_le(out, statement_id);
}

/// COM_PING
pub fn write_ping(out: &mut Vec<u8>) {
    put_u8(out, CommandByte::Ping as u8);
}

/// COM_QUIT (no server response; the server closes the socket)
pub fn write_quit(out: &mut Vec<u8>) {
    put_u8(out, CommandByte::Quit as u8);
}

/// COM_INIT_DB
pub fn write_init_db(out: &mut Vec<u8>, db: &str) {
    put_u8(out, CommandByte::InitDb as u8);
    out.extend_from_slice(db.as_bytes());
}

/// COM_STMT_EXECUTE
///
/// Layout after the command byte: 4-byte statement id, 1-byte flags
/// (CURSOR_TYPE_NO_CURSOR), 4-byte iteration count (always 1); when
/// parameters exist: NULL bitmap of `(n + 7) / 8` bytes, the
/// new-params-bound flag (always 1 here), per-parameter type bytes, then
/// the encoded non-NULL values.
pub fn write_execute(out: &mut Vec<u8>, statement_id: u32, params: &[Param]) {
    put_u8(out, CommandByte::StmtExecute as u8);
    put_u32_le(out, statement_id);
    put_u8(out, 0x00);
    put_u32_le(out, 1);

    if params.is_empty() {
        return;
    }

    let mut null_bitmap = vec![0u8; (params.len() + 7) / 8];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    out.extend_from_slice(&null_bitmap);

    put_u8(out, 0x01); // new-params-bound flag
    for param in params {
        let (ty, unsigned) = param.type_code();
        put_u8(out, ty as u8);
        put_u8(out, if unsigned { 0x80 } else { 0x00 });
    }
    for param in params {
        param.encode_value(out);
    }
}

/// COM_STMT_PREPARE OK response (zero-copy)
///
/// `0x00`, then 4-byte statement id, 2-byte column count, 2-byte parameter
/// count, a filler byte, and a 2-byte warning count. Servers send at least
/// 12 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    _reserved: u8,
    warning_count: U16LE,
}

impl PrepareOk {
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count.get()
    }
}

pub fn parse_prepare_ok(payload: &[u8]) -> Result<&PrepareOk> {
    let mut r = Reader::new(payload);
    if r.u8()? != 0x00 {
        return Err(Error::InvalidPacket);
    }
    let body = r.bytes(11)?;
    PrepareOk::ref_from_bytes(body).map_err(|_| Error::InvalidPacket)
}
