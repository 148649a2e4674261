//! Text and binary row decoding.

use std::rc::Rc;

use crate::col::Column;
use crate::error::{Error, Result};
use crate::protocol::primitive::Reader;
use crate::row::Row;
use crate::value::SqlValue;

/// NULL sentinel in text-protocol rows.
const TEXT_NULL: u8 = 0xFB;

/// Decode a text-protocol row: one cell per column, each a length-encoded
/// string or the 0xFB NULL sentinel. Cells stay stringly
/// ([`SqlValue::Bytes`]); the text protocol carries no type information in
/// the row itself.
pub fn parse_text_row(payload: &[u8], columns: &Rc<[Column]>) -> Result<Row> {
    let mut r = Reader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for _ in 0..columns.len() {
        if r.peek() == Some(TEXT_NULL) {
            r.skip(1)?;
            values.push(SqlValue::Null);
        } else {
            values.push(SqlValue::Bytes(r.lenenc_bytes()?.to_vec()));
        }
    }
    if !r.is_empty() {
        return Err(Error::InvalidPacket);
    }
    Ok(Row::new(Rc::clone(columns), values))
}

/// Decode a binary-protocol row.
///
/// Layout: `0x00` header, NULL bitmap of `(n + 7 + 2) / 8` bytes (the
/// bitmap starts at bit offset 2), then a type-specific value per
/// non-NULL column.
pub fn parse_binary_row(payload: &[u8], columns: &Rc<[Column]>) -> Result<Row> {
    let mut r = Reader::new(payload);
    if r.u8()? != 0x00 {
        return Err(Error::InvalidPacket);
    }
    let n = columns.len();
    let bitmap = r.bytes((n + 7 + 2) / 8)?;

    let mut values = Vec::with_capacity(n);
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        let is_null = bitmap[bit / 8] & (1 << (bit % 8)) != 0;
        if is_null {
            values.push(SqlValue::Null);
        } else {
            values.push(SqlValue::parse_binary(
                &mut r,
                column.column_type,
                column.is_unsigned(),
            )?);
        }
    }
    if !r.is_empty() {
        return Err(Error::InvalidPacket);
    }
    Ok(Row::new(Rc::clone(columns), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::{ColumnFlags, ColumnType};

    fn columns(types: &[(&str, ColumnType, bool)]) -> Rc<[Column]> {
        types
            .iter()
            .map(|(name, ty, unsigned)| Column {
                schema: String::new(),
                table: String::new(),
                name: (*name).to_string(),
                org_name: (*name).to_string(),
                charset: 33,
                column_length: 0,
                column_type: *ty,
                flags: if *unsigned {
                    ColumnFlags::UNSIGNED_FLAG
                } else {
                    ColumnFlags::empty()
                },
                decimals: 0,
            })
            .collect()
    }

    #[test]
    fn text_row_with_null() {
        let cols = columns(&[
            ("a", ColumnType::MYSQL_TYPE_VAR_STRING, false),
            ("b", ColumnType::MYSQL_TYPE_LONG, false),
            ("c", ColumnType::MYSQL_TYPE_VAR_STRING, false),
        ]);
        let payload = [1, b'1', 0xFB, 2, b'h', b'i'];
        let row = parse_text_row(&payload, &cols).unwrap();
        assert_eq!(row.get(0), Some(&SqlValue::Bytes(b"1".to_vec())));
        assert_eq!(row.get(1), Some(&SqlValue::Null));
        assert_eq!(row.get_named("c"), Some(&SqlValue::Bytes(b"hi".to_vec())));
    }

    #[test]
    fn text_row_with_trailing_garbage_is_invalid() {
        let cols = columns(&[("a", ColumnType::MYSQL_TYPE_VAR_STRING, false)]);
        let payload = [1, b'x', 9];
        assert!(parse_text_row(&payload, &cols).is_err());
    }

    #[test]
    fn binary_row_nulls_and_values() {
        let cols = columns(&[
            ("n", ColumnType::MYSQL_TYPE_LONGLONG, false),
            ("m", ColumnType::MYSQL_TYPE_VAR_STRING, false),
            ("z", ColumnType::MYSQL_TYPE_LONG, false),
        ]);
        // Bitmap: (3 + 7 + 2) / 8 = 1 byte. Column 2 (bit 4) NULL.
        let mut payload = vec![0x00, 0b0001_0000];
        payload.extend_from_slice(&5u64.to_le_bytes());
        payload.extend_from_slice(&[2, b'o', b'k']);
        let row = parse_binary_row(&payload, &cols).unwrap();
        assert_eq!(row.get(0), Some(&SqlValue::Int(5)));
        assert_eq!(row.get(1), Some(&SqlValue::Bytes(b"ok".to_vec())));
        assert_eq!(row.get(2), Some(&SqlValue::Null));
    }

    #[test]
    fn binary_row_wrong_header_is_invalid() {
        let cols = columns(&[("n", ColumnType::MYSQL_TYPE_LONG, false)]);
        assert!(parse_binary_row(&[0x01, 0x00, 0, 0, 0, 0], &cols).is_err());
    }

    #[test]
    fn binary_row_bitmap_width_covers_nine_columns() {
        // Nine columns need (9 + 7 + 2) / 8 = 2 bitmap bytes.
        let spec: Vec<(&str, ColumnType, bool)> = (0..9)
            .map(|_| ("c", ColumnType::MYSQL_TYPE_TINY, true))
            .collect();
        let cols = columns(&spec);
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let row = parse_binary_row(&payload, &cols).unwrap();
        assert_eq!(row.get(8), Some(&SqlValue::UInt(9)));
    }
}
