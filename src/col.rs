//! Column definitions (Protocol::ColumnDefinition41).

use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{Error, Result};
use crate::protocol::primitive::{Reader, lossy_string};

/// One column of a result set, parsed from a ColumnDefinition41 packet.
///
/// Packet format (all strings length-encoded):
/// ```text
/// catalog, schema, table, org_table, name, org_name,
/// int<lenenc> fixed-length-fields length (0x0c),
/// 2  character set
/// 4  column length
/// 1  column type
/// 2  flags
/// 1  decimals
/// 2  filler
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl Column {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let _catalog = r.lenenc_bytes()?; // always "def"
        let schema = lossy_string(r.lenenc_bytes()?);
        let table = lossy_string(r.lenenc_bytes()?);
        let _org_table = r.lenenc_bytes()?;
        let name = lossy_string(r.lenenc_bytes()?);
        let org_name = lossy_string(r.lenenc_bytes()?);

        let _fixed_len = r.lenenc_int()?;
        let charset = r.u16_le()?;
        let column_length = r.u32_le()?;
        let type_byte = r.u8()?;
        let column_type = ColumnType::from_u8(type_byte)
            .ok_or_else(|| Error::UnknownProtocol(format!("column type {:#04x}", type_byte)))?;
        let flags = ColumnFlags::from_bits_truncate(r.u16_le()?);
        let decimals = r.u8()?;

        Ok(Self {
            schema,
            table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }
}

#[cfg(test)]
#[path = "col_test.rs"]
mod col_test;
