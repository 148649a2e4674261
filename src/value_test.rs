use crate::constant::ColumnType;
use crate::protocol::primitive::Reader;
use crate::value::{Param, SqlValue};

fn decode(bytes: &[u8], ty: ColumnType, unsigned: bool) -> SqlValue {
    let mut r = Reader::new(bytes);
    let value = SqlValue::parse_binary(&mut r, ty, unsigned).unwrap();
    assert!(r.is_empty(), "decoder left trailing bytes");
    value
}

#[test]
fn integer_widths_and_sign_extension() {
    assert_eq!(decode(&[0xFF], ColumnType::MYSQL_TYPE_TINY, false), SqlValue::Int(-1));
    assert_eq!(decode(&[0xFF], ColumnType::MYSQL_TYPE_TINY, true), SqlValue::UInt(255));
    assert_eq!(
        decode(&[0xFE, 0xFF], ColumnType::MYSQL_TYPE_SHORT, false),
        SqlValue::Int(-2)
    );
    // INT24 travels as 4 bytes on the wire.
    assert_eq!(
        decode(&[0x39, 0x30, 0x00, 0x00], ColumnType::MYSQL_TYPE_INT24, false),
        SqlValue::Int(12345)
    );
    assert_eq!(
        decode(&5u64.to_le_bytes(), ColumnType::MYSQL_TYPE_LONGLONG, false),
        SqlValue::Int(5)
    );
    assert_eq!(
        decode(&u64::MAX.to_le_bytes(), ColumnType::MYSQL_TYPE_LONGLONG, true),
        SqlValue::UInt(u64::MAX)
    );
}

#[test]
fn floats_are_bit_exact() {
    assert_eq!(
        decode(&1.5f32.to_bits().to_le_bytes(), ColumnType::MYSQL_TYPE_FLOAT, false),
        SqlValue::Float(1.5)
    );
    assert_eq!(
        decode(&(-2.25f64).to_bits().to_le_bytes(), ColumnType::MYSQL_TYPE_DOUBLE, false),
        SqlValue::Double(-2.25)
    );
}

#[test]
fn temporal_lengths() {
    // 0 bytes: the zero date.
    assert_eq!(
        decode(&[0], ColumnType::MYSQL_TYPE_DATE, false),
        SqlValue::Date { year: 0, month: 0, day: 0 }
    );
    // 4 bytes: date only.
    assert_eq!(
        decode(&[4, 0xE9, 0x07, 12, 31], ColumnType::MYSQL_TYPE_DATE, false),
        SqlValue::Date { year: 2025, month: 12, day: 31 }
    );
    // 7 bytes: datetime without microseconds.
    assert_eq!(
        decode(
            &[7, 0xE9, 0x07, 6, 15, 23, 59, 58],
            ColumnType::MYSQL_TYPE_DATETIME,
            false
        ),
        SqlValue::DateTime {
            year: 2025,
            month: 6,
            day: 15,
            hour: 23,
            minute: 59,
            second: 58,
            micros: 0
        }
    );
    // 11 bytes: with microseconds.
    let mut raw = vec![11, 0xE9, 0x07, 6, 15, 23, 59, 58];
    raw.extend_from_slice(&123456u32.to_le_bytes());
    assert_eq!(
        decode(&raw, ColumnType::MYSQL_TYPE_TIMESTAMP, false),
        SqlValue::DateTime {
            year: 2025,
            month: 6,
            day: 15,
            hour: 23,
            minute: 59,
            second: 58,
            micros: 123456
        }
    );
}

#[test]
fn time_lengths() {
    assert_eq!(
        decode(&[0], ColumnType::MYSQL_TYPE_TIME, false),
        SqlValue::Time { negative: false, days: 0, hours: 0, minutes: 0, seconds: 0, micros: 0 }
    );
    let mut raw = vec![8, 1];
    raw.extend_from_slice(&2u32.to_le_bytes());
    raw.extend_from_slice(&[3, 4, 5]);
    assert_eq!(
        decode(&raw, ColumnType::MYSQL_TYPE_TIME, false),
        SqlValue::Time { negative: true, days: 2, hours: 3, minutes: 4, seconds: 5, micros: 0 }
    );
    let mut raw = vec![12, 0];
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.extend_from_slice(&[1, 2, 3]);
    raw.extend_from_slice(&42u32.to_le_bytes());
    assert_eq!(
        decode(&raw, ColumnType::MYSQL_TYPE_TIME, false),
        SqlValue::Time { negative: false, days: 0, hours: 1, minutes: 2, seconds: 3, micros: 42 }
    );
}

#[test]
fn string_types_fall_back_to_lenenc_bytes() {
    let value = decode(&[3, b'a', b'b', b'c'], ColumnType::MYSQL_TYPE_VAR_STRING, false);
    assert_eq!(value, SqlValue::Bytes(b"abc".to_vec()));
    assert_eq!(value.as_str(), Some("abc"));

    let value = decode(&[2, 0x01, 0x02], ColumnType::MYSQL_TYPE_NEWDECIMAL, false);
    assert_eq!(value, SqlValue::Bytes(vec![1, 2]));
}

#[test]
fn invalid_temporal_length_is_a_protocol_error() {
    let mut r = Reader::new(&[5, 1, 2, 3, 4, 5]);
    assert!(SqlValue::parse_binary(&mut r, ColumnType::MYSQL_TYPE_DATETIME, false).is_err());
}

#[test]
fn value_accessors() {
    assert_eq!(SqlValue::Bytes(b"17".to_vec()).as_i64(), Some(17));
    assert_eq!(SqlValue::Int(-4).as_i64(), Some(-4));
    assert_eq!(SqlValue::Bytes(b"1.5".to_vec()).as_f64(), Some(1.5));
    assert!(SqlValue::Null.is_null());
    assert_eq!(SqlValue::Int(1).as_str(), None);
}

#[test]
fn param_conversions() {
    assert_eq!(Param::from(5i32), Param::Int(5));
    assert_eq!(Param::from(5u64), Param::UInt(5));
    assert_eq!(Param::from("x"), Param::Text("x".to_string()));
    assert_eq!(Param::from(Option::<i64>::None), Param::Null);
    assert_eq!(Param::from(Some(2i64)), Param::Int(2));
    assert_eq!(Param::from(true), Param::Int(1));
}

#[test]
fn param_value_encodings() {
    let mut out = Vec::new();
    Param::Int(-1).encode_value(&mut out);
    assert_eq!(out, (-1i64 as u64).to_le_bytes());

    let mut out = Vec::new();
    Param::Double(1.5).encode_value(&mut out);
    assert_eq!(out, 1.5f64.to_bits().to_le_bytes());

    let mut out = Vec::new();
    Param::Text("ab".into()).encode_value(&mut out);
    assert_eq!(out, [2, b'a', b'b']);

    let mut out = Vec::new();
    Param::Null.encode_value(&mut out);
    assert!(out.is_empty());
}
