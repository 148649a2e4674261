//! Owned cell values and statement parameters.
//!
//! Text-protocol rows decode every cell as `Bytes` (the server sends
//! strings); binary-protocol rows decode into the typed variants.

use crate::constant::ColumnType;
use crate::error::{Error, Result};
use crate::protocol::primitive::{Reader, lossless_str, put_lenenc_bytes, put_u32_le, put_u64_le};

/// A single decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    /// TINYINT .. BIGINT
    Int(i64),
    /// Unsigned TINYINT .. BIGINT
    UInt(u64),
    Float(f32),
    Double(f64),
    /// Strings, blobs, decimals, JSON, and every other length-encoded type
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// UTF-8 view for string-ish cells.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Bytes(bytes) => lossless_str(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Integer view; text-protocol cells are parsed from their digits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            SqlValue::Bytes(bytes) => lossless_str(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Float(v) => Some(*v as f64),
            SqlValue::Double(v) => Some(*v),
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::UInt(v) => Some(*v as f64),
            SqlValue::Bytes(bytes) => lossless_str(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Decode one binary-protocol value.
    ///
    /// Integer widths follow the column type (INT24 travels as 4 bytes);
    /// temporal types carry a 1-byte length selecting the 0/4/7/11-byte
    /// (or 0/8/12 for TIME) form; everything else is length-encoded bytes.
    pub fn parse_binary(r: &mut Reader<'_>, ty: ColumnType, unsigned: bool) -> Result<SqlValue> {
        match ty {
            ColumnType::MYSQL_TYPE_NULL => Ok(SqlValue::Null),

            ColumnType::MYSQL_TYPE_TINY => {
                let v = r.u8()?;
                Ok(if unsigned {
                    SqlValue::UInt(v as u64)
                } else {
                    SqlValue::Int(v as i8 as i64)
                })
            }

            ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
                let v = r.u16_le()?;
                Ok(if unsigned {
                    SqlValue::UInt(v as u64)
                } else {
                    SqlValue::Int(v as i16 as i64)
                })
            }

            ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => {
                let v = r.u32_le()?;
                Ok(if unsigned {
                    SqlValue::UInt(v as u64)
                } else {
                    SqlValue::Int(v as i32 as i64)
                })
            }

            ColumnType::MYSQL_TYPE_LONGLONG => {
                let v = r.u64_le()?;
                Ok(if unsigned {
                    SqlValue::UInt(v)
                } else {
                    SqlValue::Int(v as i64)
                })
            }

            ColumnType::MYSQL_TYPE_FLOAT => Ok(SqlValue::Float(f32::from_bits(r.u32_le()?))),
            ColumnType::MYSQL_TYPE_DOUBLE => Ok(SqlValue::Double(f64::from_bits(r.u64_le()?))),

            ColumnType::MYSQL_TYPE_DATE
            | ColumnType::MYSQL_TYPE_DATETIME
            | ColumnType::MYSQL_TYPE_TIMESTAMP
            | ColumnType::MYSQL_TYPE_DATETIME2
            | ColumnType::MYSQL_TYPE_TIMESTAMP2
            | ColumnType::MYSQL_TYPE_NEWDATE => parse_binary_temporal(r, ty),

            ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => parse_binary_time(r),

            _ => Ok(SqlValue::Bytes(r.lenenc_bytes()?.to_vec())),
        }
    }
}

fn parse_binary_temporal(r: &mut Reader<'_>, ty: ColumnType) -> Result<SqlValue> {
    let len = r.u8()?;
    if len == 0 {
        // Zero value: 0000-00-00 (00:00:00).
        return Ok(if ty == ColumnType::MYSQL_TYPE_DATE || ty == ColumnType::MYSQL_TYPE_NEWDATE {
            SqlValue::Date {
                year: 0,
                month: 0,
                day: 0,
            }
        } else {
            SqlValue::DateTime {
                year: 0,
                month: 0,
                day: 0,
                hour: 0,
                minute: 0,
                second: 0,
                micros: 0,
            }
        });
    }

    let year = r.u16_le()?;
    let month = r.u8()?;
    let day = r.u8()?;
    if len == 4 {
        return Ok(SqlValue::Date { year, month, day });
    }

    let hour = r.u8()?;
    let minute = r.u8()?;
    let second = r.u8()?;
    let micros = if len == 11 { r.u32_le()? } else { 0 };
    match len {
        7 | 11 => Ok(SqlValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        }),
        other => Err(Error::UnknownProtocol(format!(
            "temporal value length {}",
            other
        ))),
    }
}

fn parse_binary_time(r: &mut Reader<'_>) -> Result<SqlValue> {
    let len = r.u8()?;
    if len == 0 {
        return Ok(SqlValue::Time {
            negative: false,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            micros: 0,
        });
    }
    let negative = r.u8()? != 0;
    let days = r.u32_le()?;
    let hours = r.u8()?;
    let minutes = r.u8()?;
    let seconds = r.u8()?;
    let micros = if len == 12 { r.u32_le()? } else { 0 };
    match len {
        8 | 12 => Ok(SqlValue::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        }),
        other => Err(Error::UnknownProtocol(format!(
            "time value length {}",
            other
        ))),
    }
}

/// A prepared-statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Param {
    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    /// Wire type byte and the unsigned flag for COM_STMT_EXECUTE.
    pub fn type_code(&self) -> (ColumnType, bool) {
        match self {
            Param::Null => (ColumnType::MYSQL_TYPE_NULL, false),
            Param::Int(_) => (ColumnType::MYSQL_TYPE_LONGLONG, false),
            Param::UInt(_) => (ColumnType::MYSQL_TYPE_LONGLONG, true),
            Param::Float(_) => (ColumnType::MYSQL_TYPE_FLOAT, false),
            Param::Double(_) => (ColumnType::MYSQL_TYPE_DOUBLE, false),
            Param::Text(_) | Param::Bytes(_) => (ColumnType::MYSQL_TYPE_VAR_STRING, false),
        }
    }

    /// Append the binary encoding; NULL encodes nothing (it lives in the
    /// bitmap).
    pub fn encode_value(&self, out: &mut Vec<u8>) {
        match self {
            Param::Null => {}
            Param::Int(v) => put_u64_le(out, *v as u64),
            Param::UInt(v) => put_u64_le(out, *v),
            Param::Float(v) => put_u32_le(out, v.to_bits()),
            Param::Double(v) => put_u64_le(out, v.to_bits()),
            Param::Text(s) => put_lenenc_bytes(out, s.as_bytes()),
            Param::Bytes(b) => put_lenenc_bytes(out, b),
        }
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v as i64)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<u32> for Param {
    fn from(v: u32) -> Self {
        Param::UInt(v as u64)
    }
}

impl From<u64> for Param {
    fn from(v: u64) -> Self {
        Param::UInt(v)
    }
}

impl From<f32> for Param {
    fn from(v: f32) -> Self {
        Param::Float(v)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Double(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Int(v as i64)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Param::Bytes(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Param::Null,
        }
    }
}

#[cfg(test)]
#[path = "value_test.rs"]
mod value_test;
