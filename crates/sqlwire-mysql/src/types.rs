//! MySQL type system and value conversion.
//!
//! This module provides:
//! - Field type codes and column flags from column definitions
//! - Column-definition decoding (4.1 and legacy layouts)
//! - Text- and binary-protocol value decoding into [`Value`]
//! - Binary parameter encoding and SQL literal rendering
//!
//! # Temporal values
//!
//! `Value::Date` counts days since 1970-01-01, `Value::Time` is a signed
//! microsecond duration (MySQL TIME spans ±838 hours) and
//! `Value::Timestamp` counts microseconds since the epoch, no time zone
//! applied. Zero dates (`0000-00-00`) have no such representation and are
//! returned as text.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::error::TypeError;
use sqlwire_core::{Error, Result, Value};

use crate::error::{malformed, protocol_error};
use crate::protocol::reader::PacketReader;
use crate::protocol::writer::PacketWriter;
use crate::protocol::{CapabilityFlags, charset, flag_set};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;
const MAX_TIME_HOURS: u16 = 838;
const MAX_TIME_DAYS: u32 = 34;
const MAX_YEAR: u16 = 9999;

/// MySQL field type codes (`MYSQL_TYPE_*`) that can appear in a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type code.
    ///
    /// `TIMESTAMP2`, `DATETIME2` and `TIME2` (0x11..=0x13) are replication
    /// encodings that never appear in client result sets; they and any
    /// unknown code are rejected rather than guessed at.
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            other => return Err(protocol_error(format!("unsupported column type {other:#04x}"))),
        })
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
        )
    }

    /// Types whose payload is a length-prefixed byte string in the binary protocol.
    #[must_use]
    pub const fn is_length_prefixed(self) -> bool {
        matches!(
            self,
            FieldType::Decimal
                | FieldType::NewDecimal
                | FieldType::VarChar
                | FieldType::Bit
                | FieldType::Json
                | FieldType::Enum
                | FieldType::Set
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::VarString
                | FieldType::String
                | FieldType::Geometry
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

flag_set! {
    /// Column flags in result set metadata.
    ColumnFlags(u16) {
        NOT_NULL = 1,
        PRIMARY_KEY = 1 << 1,
        UNIQUE_KEY = 1 << 2,
        MULTIPLE_KEY = 1 << 3,
        BLOB = 1 << 4,
        UNSIGNED = 1 << 5,
        ZEROFILL = 1 << 6,
        BINARY = 1 << 7,
        ENUM = 1 << 8,
        AUTO_INCREMENT = 1 << 9,
        TIMESTAMP = 1 << 10,
        SET = 1 << 11,
        NO_DEFAULT_VALUE = 1 << 12,
        ON_UPDATE_NOW = 1 << 13,
        NUM = 1 << 15,
    }
}

/// Column definition from a result set or a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Catalog name (always "def"; empty for the legacy layout)
    pub catalog: String,
    pub schema: String,
    /// Table name or alias
    pub table: String,
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    /// Character set number (0 when the legacy layout omits it)
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Decode a column definition packet in the layout selected by `caps`.
    pub fn decode(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            Self::decode_41(payload)
        } else {
            Self::decode_legacy(payload, caps)
        }
    }

    fn decode_41(payload: &[u8]) -> Result<Self> {
        let bad = || malformed("column definition", payload);
        let mut r = PacketReader::new(payload);

        let catalog = r.read_lenenc_string().ok_or_else(bad)?;
        let schema = r.read_lenenc_string().ok_or_else(bad)?;
        let table = r.read_lenenc_string().ok_or_else(bad)?;
        let org_table = r.read_lenenc_string().ok_or_else(bad)?;
        let name = r.read_lenenc_string().ok_or_else(bad)?;
        let org_name = r.read_lenenc_string().ok_or_else(bad)?;

        // length of the fixed-size block, always 0x0c
        r.read_lenenc_int().ok_or_else(bad)?;
        let charset = r.read_u16_le().ok_or_else(bad)?;
        let column_length = r.read_u32_le().ok_or_else(bad)?;
        let column_type = FieldType::from_u8(r.read_u8().ok_or_else(bad)?)?;
        let flags = ColumnFlags::from_bits(r.read_u16_le().ok_or_else(bad)?);
        let decimals = r.read_u8().ok_or_else(bad)?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    fn decode_legacy(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        let bad = || malformed("column definition", payload);
        let mut r = PacketReader::new(payload);

        let table = r.read_lenenc_string().ok_or_else(bad)?;
        let name = r.read_lenenc_string().ok_or_else(bad)?;

        r.read_lenenc_int().ok_or_else(bad)?;
        let column_length = r.read_u24_le().ok_or_else(bad)?;
        r.read_lenenc_int().ok_or_else(bad)?;
        let column_type = FieldType::from_u8(r.read_u8().ok_or_else(bad)?)?;

        r.read_lenenc_int().ok_or_else(bad)?;
        let flags = if caps.contains(CapabilityFlags::CLIENT_LONG_FLAG) {
            r.read_u16_le().ok_or_else(bad)?
        } else {
            u16::from(r.read_u8().ok_or_else(bad)?)
        };
        let decimals = r.read_u8().ok_or_else(bad)?;

        Ok(Self {
            catalog: String::new(),
            schema: String::new(),
            org_table: table.clone(),
            table,
            org_name: name.clone(),
            name,
            charset: 0,
            column_length,
            column_type,
            flags: ColumnFlags::from_bits(flags),
            decimals,
        })
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED)
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags.contains(ColumnFlags::NOT_NULL)
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags.contains(ColumnFlags::PRIMARY_KEY)
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags.contains(ColumnFlags::AUTO_INCREMENT)
    }

    /// `true` when cell bytes are opaque rather than character data.
    #[must_use]
    pub fn is_binary_data(&self) -> bool {
        if self.charset == 0 {
            self.flags.contains(ColumnFlags::BINARY)
        } else {
            charset::is_binary(self.charset)
        }
    }
}

// ==================== Decoding ====================

/// Decode a text-protocol cell.
///
/// Numbers that fail to parse fall back to text so that no cell is lost.
pub fn decode_text_value(column: &ColumnDefinition, data: &[u8]) -> Value {
    let text = || String::from_utf8_lossy(data).into_owned();
    let parsed = std::str::from_utf8(data).ok().map(str::trim);
    let unsigned = column.is_unsigned();

    match column.column_type {
        FieldType::Tiny | FieldType::Short | FieldType::Long | FieldType::Int24 | FieldType::Year
        | FieldType::LongLong => {
            let value = if unsigned {
                parsed
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|v| widen_unsigned(column.column_type, v))
            } else {
                parsed
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(|v| narrow_signed(column.column_type, v))
            };
            value.unwrap_or_else(|| Value::Text(text()))
        }
        FieldType::Float => parsed
            .and_then(|s| s.parse::<f32>().ok())
            .map_or_else(|| Value::Text(text()), Value::Float),
        FieldType::Double => parsed
            .and_then(|s| s.parse::<f64>().ok())
            .map_or_else(|| Value::Text(text()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text()),
        FieldType::Date | FieldType::NewDate => {
            parsed.and_then(parse_date).map_or_else(|| Value::Text(text()), Value::Date)
        }
        FieldType::DateTime | FieldType::Timestamp => parsed
            .and_then(parse_datetime)
            .map_or_else(|| Value::Text(text()), Value::Timestamp),
        FieldType::Time => parsed.and_then(parse_time).map_or_else(|| Value::Text(text()), Value::Time),
        FieldType::Json => {
            serde_json::from_slice(data).map_or_else(|_| Value::Text(text()), Value::Json)
        }
        FieldType::Null => Value::Null,
        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::VarChar
        | FieldType::VarString
        | FieldType::String
        | FieldType::Enum
        | FieldType::Set => {
            if column.is_binary_data() {
                Value::Bytes(data.to_vec())
            } else {
                Value::Text(text())
            }
        }
    }
}

/// Decode one non-NULL binary-protocol cell, advancing `reader` past it.
pub fn decode_binary_value(reader: &mut PacketReader<'_>, column: &ColumnDefinition) -> Result<Value> {
    let truncated = || protocol_error(format!("truncated binary value for column `{}`", column.name));
    let unsigned = column.is_unsigned();

    let value = match column.column_type {
        FieldType::Tiny => {
            let raw = reader.read_u8().ok_or_else(truncated)?;
            if unsigned {
                widen_unsigned(FieldType::Tiny, u64::from(raw))
            } else {
                Value::TinyInt(raw as i8)
            }
        }
        FieldType::Short | FieldType::Year => {
            let raw = reader.read_u16_le().ok_or_else(truncated)?;
            if unsigned {
                widen_unsigned(FieldType::Short, u64::from(raw))
            } else {
                Value::SmallInt(raw as i16)
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let raw = reader.read_u32_le().ok_or_else(truncated)?;
            if unsigned {
                widen_unsigned(FieldType::Long, u64::from(raw))
            } else {
                Value::Int(raw as i32)
            }
        }
        FieldType::LongLong => {
            let raw = reader.read_u64_le().ok_or_else(truncated)?;
            if unsigned {
                Value::from_u64(raw)
            } else {
                Value::BigInt(raw as i64)
            }
        }
        FieldType::Float => Value::Float(reader.read_f32_le().ok_or_else(truncated)?),
        FieldType::Double => Value::Double(reader.read_f64_le().ok_or_else(truncated)?),
        FieldType::Null => Value::Null,
        FieldType::Date | FieldType::NewDate => {
            let len = usize::from(reader.read_u8().ok_or_else(truncated)?);
            let data = reader.read_bytes(len).ok_or_else(truncated)?;
            decode_binary_date(data)
        }
        FieldType::DateTime | FieldType::Timestamp => {
            let len = usize::from(reader.read_u8().ok_or_else(truncated)?);
            let data = reader.read_bytes(len).ok_or_else(truncated)?;
            decode_binary_datetime(data)
        }
        FieldType::Time => {
            let len = usize::from(reader.read_u8().ok_or_else(truncated)?);
            let data = reader.read_bytes(len).ok_or_else(truncated)?;
            decode_binary_time(data)?
        }
        FieldType::Decimal | FieldType::NewDecimal => {
            let data = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            Value::Decimal(String::from_utf8_lossy(data).into_owned())
        }
        // The remaining types share the text representation.
        _ => {
            let data = reader.read_lenenc_bytes().ok_or_else(truncated)?;
            decode_text_value(column, data)
        }
    };
    Ok(value)
}

fn widen_unsigned(field_type: FieldType, v: u64) -> Value {
    match field_type {
        FieldType::Tiny => Value::SmallInt(v as i16),
        FieldType::Short | FieldType::Year => Value::Int(v as i32),
        FieldType::Long | FieldType::Int24 => Value::BigInt(v as i64),
        _ => Value::from_u64(v),
    }
}

fn narrow_signed(field_type: FieldType, v: i64) -> Value {
    match field_type {
        FieldType::Tiny => i8::try_from(v).map_or(Value::BigInt(v), Value::TinyInt),
        FieldType::Short | FieldType::Year => i16::try_from(v).map_or(Value::BigInt(v), Value::SmallInt),
        FieldType::Long | FieldType::Int24 => i32::try_from(v).map_or(Value::BigInt(v), Value::Int),
        _ => Value::BigInt(v),
    }
}

fn decode_binary_date(data: &[u8]) -> Value {
    if data.len() < 4 {
        return Value::Text("0000-00-00".to_string());
    }
    let year = i64::from(u16::from_le_bytes([data[0], data[1]]));
    match days_from_civil(year, u32::from(data[2]), u32::from(data[3])) {
        Some(days) => Value::Date(days as i32),
        None => Value::Text(format!("{year:04}-{:02}-{:02}", data[2], data[3])),
    }
}

fn decode_binary_datetime(data: &[u8]) -> Value {
    if data.len() < 4 {
        return Value::Text("0000-00-00 00:00:00".to_string());
    }
    let year = i64::from(u16::from_le_bytes([data[0], data[1]]));
    let (hour, minute, second) = if data.len() >= 7 {
        (data[4], data[5], data[6])
    } else {
        (0, 0, 0)
    };
    let micros = if data.len() >= 11 {
        u32::from_le_bytes([data[7], data[8], data[9], data[10]])
    } else {
        0
    };
    match days_from_civil(year, u32::from(data[2]), u32::from(data[3])) {
        Some(days) => Value::Timestamp(
            days * MICROS_PER_DAY
                + i64::from(hour) * 3_600 * MICROS_PER_SECOND
                + i64::from(minute) * 60 * MICROS_PER_SECOND
                + i64::from(second) * MICROS_PER_SECOND
                + i64::from(micros),
        ),
        None => Value::Text(format!(
            "{year:04}-{:02}-{:02} {hour:02}:{minute:02}:{second:02}",
            data[2], data[3]
        )),
    }
}

fn decode_binary_time(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Time(0));
    }
    if data.len() < 8 {
        return Err(protocol_error(format!("invalid binary TIME length {}", data.len())));
    }
    let negative = data[0] != 0;
    let days = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let micros = if data.len() >= 12 {
        u32::from_le_bytes([data[8], data[9], data[10], data[11]])
    } else {
        0
    };
    // TIME spans -838:59:59 to 838:59:59
    if days > MAX_TIME_DAYS || data[5] > 23 || data[6] > 59 || data[7] > 59 || micros > 999_999 {
        return Err(protocol_error(format!("binary TIME out of range: {:?}", &data[1..])));
    }
    let micros = i64::from(micros);
    let total = i64::from(days) * MICROS_PER_DAY
        + i64::from(data[5]) * 3_600 * MICROS_PER_SECOND
        + i64::from(data[6]) * 60 * MICROS_PER_SECOND
        + i64::from(data[7]) * MICROS_PER_SECOND
        + micros;
    Ok(Value::Time(if negative { -total } else { total }))
}

// ==================== Encoding ====================

/// Wire type and unsigned flag announced for a bound parameter.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) | Value::Json(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::Timestamp(_) => (FieldType::DateTime, false),
    }
}

/// Append the binary-protocol encoding of a non-NULL parameter.
///
/// Dates and timestamps outside years 0..=9999 are rejected.
pub fn encode_binary_value(value: &Value, w: &mut PacketWriter) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => w.write_u8(u8::from(*b)),
        Value::TinyInt(i) => w.write_u8(*i as u8),
        Value::SmallInt(i) => w.write_bytes(&i.to_le_bytes()),
        Value::Int(i) => w.write_bytes(&i.to_le_bytes()),
        Value::BigInt(i) => w.write_bytes(&i.to_le_bytes()),
        Value::UnsignedBigInt(u) => w.write_u64_le(*u),
        Value::Float(f) => w.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => w.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => w.write_lenenc_string(s),
        Value::Json(j) => w.write_lenenc_string(&j.to_string()),
        Value::Bytes(b) => w.write_lenenc_bytes(b),
        Value::Date(days) => {
            let (y, m, d) = civil_from_days(i64::from(*days));
            let year = wire_year(y, value)?;
            w.write_u8(4);
            w.write_u16_le(year);
            w.write_u8(m as u8);
            w.write_u8(d as u8);
        }
        Value::Time(micros) => encode_binary_time(*micros, w),
        Value::Timestamp(micros) => encode_binary_datetime(*micros, w)?,
    }
    Ok(())
}

fn wire_year(year: i64, value: &Value) -> Result<u16> {
    match u16::try_from(year) {
        Ok(y) if y <= MAX_YEAR => Ok(y),
        _ => Err(Error::Type(TypeError {
            expected: "date with year 0..=9999",
            actual: format!("{value:?}"),
            column: None,
            rust_type: None,
        })),
    }
}

fn encode_binary_time(micros: i64, w: &mut PacketWriter) {
    if micros == 0 {
        w.write_u8(0);
        return;
    }
    let abs = micros.unsigned_abs();
    let frac = (abs % MICROS_PER_SECOND as u64) as u32;
    let secs = abs / MICROS_PER_SECOND as u64;
    let days = (secs / 86_400) as u32;
    let rem = secs % 86_400;

    w.write_u8(if frac == 0 { 8 } else { 12 });
    w.write_u8(u8::from(micros < 0));
    w.write_u32_le(days);
    w.write_u8((rem / 3_600) as u8);
    w.write_u8((rem % 3_600 / 60) as u8);
    w.write_u8((rem % 60) as u8);
    if frac != 0 {
        w.write_u32_le(frac);
    }
}

fn encode_binary_datetime(micros: i64, w: &mut PacketWriter) -> Result<()> {
    let days = micros.div_euclid(MICROS_PER_DAY);
    let in_day = micros.rem_euclid(MICROS_PER_DAY);
    let (y, m, d) = civil_from_days(days);
    let secs = in_day / MICROS_PER_SECOND;
    let frac = (in_day % MICROS_PER_SECOND) as u32;
    let year = wire_year(y, &Value::Timestamp(micros))?;

    w.write_u8(if frac == 0 { 7 } else { 11 });
    w.write_u16_le(year);
    w.write_u8(m as u8);
    w.write_u8(d as u8);
    w.write_u8((secs / 3_600) as u8);
    w.write_u8((secs % 3_600 / 60) as u8);
    w.write_u8((secs % 60) as u8);
    if frac != 0 {
        w.write_u32_le(frac);
    }
    Ok(())
}

// ==================== Calendar ====================

/// Days since 1970-01-01 for a proleptic Gregorian date, or `None` for
/// out-of-range components (including MySQL zero dates).
pub fn days_from_civil(year: i64, month: u32, day: u32) -> Option<i64> {
    if !(1..=12).contains(&month) || day == 0 || day > days_in_month(year, month) {
        return None;
    }
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146_097 + doe - 719_468)
}

/// Inverse of [`days_from_civil`].
pub fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn days_in_month(year: i64, month: u32) -> u32 {
    match month {
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn parse_date(s: &str) -> Option<i32> {
    let mut parts = s.splitn(3, '-');
    let year = i64::from(parts.next()?.parse::<u16>().ok()?);
    let month = parts.next()?.parse::<u32>().ok()?;
    let day = parts.next()?.parse::<u32>().ok()?;
    days_from_civil(year, month, day).and_then(|d| i32::try_from(d).ok())
}

/// `HH:MM:SS[.ffffff]` as microseconds, without sign handling.
fn parse_clock(s: &str) -> Option<i64> {
    let (clock, frac) = match s.split_once('.') {
        Some((clock, frac)) => (clock, Some(frac)),
        None => (s, None),
    };
    let mut parts = clock.splitn(3, ':');
    let hours = parts.next()?.parse::<u16>().ok()?;
    let minutes = parts.next()?.parse::<u8>().ok()?;
    let seconds = parts.next()?.parse::<u8>().ok()?;
    if hours > MAX_TIME_HOURS || minutes > 59 || seconds > 59 {
        return None;
    }
    let micros = match frac {
        Some(f) if !f.is_empty() && f.len() <= 6 && f.bytes().all(|b| b.is_ascii_digit()) => {
            f.parse::<i64>().ok()? * 10_i64.pow(6 - f.len() as u32)
        }
        Some(_) => return None,
        None => 0,
    };
    let secs = i64::from(hours) * 3_600 + i64::from(minutes) * 60 + i64::from(seconds);
    Some(secs * MICROS_PER_SECOND + micros)
}

fn parse_datetime(s: &str) -> Option<i64> {
    let (date, clock) = s.split_once(' ').or_else(|| s.split_once('T'))?;
    let days = i64::from(parse_date(date)?);
    let in_day = parse_clock(clock)?;
    if in_day >= MICROS_PER_DAY {
        return None;
    }
    Some(days * MICROS_PER_DAY + in_day)
}

fn parse_time(s: &str) -> Option<i64> {
    match s.strip_prefix('-') {
        Some(rest) => parse_clock(rest).map(|v| -v),
        None => parse_clock(s),
    }
}

fn format_date(days: i64) -> String {
    let (y, m, d) = civil_from_days(days);
    format!("{y:04}-{m:02}-{d:02}")
}

fn format_fraction(out: &mut String, micros: u64) {
    if micros != 0 {
        out.push_str(&format!(".{micros:06}"));
    }
}

/// Render a TIME duration as `[-]HH:MM:SS[.ffffff]`.
pub fn format_time(micros: i64) -> String {
    let abs = micros.unsigned_abs();
    let secs = abs / MICROS_PER_SECOND as u64;
    let mut out = format!(
        "{}{:02}:{:02}:{:02}",
        if micros < 0 { "-" } else { "" },
        secs / 3_600,
        secs % 3_600 / 60,
        secs % 60
    );
    format_fraction(&mut out, abs % MICROS_PER_SECOND as u64);
    out
}

/// Render a timestamp as `YYYY-MM-DD HH:MM:SS[.ffffff]`.
pub fn format_timestamp(micros: i64) -> String {
    let in_day = micros.rem_euclid(MICROS_PER_DAY);
    let secs = in_day / MICROS_PER_SECOND;
    let mut out = format!(
        "{} {:02}:{:02}:{:02}",
        format_date(micros.div_euclid(MICROS_PER_DAY)),
        secs / 3_600,
        secs % 3_600 / 60,
        secs % 60
    );
    format_fraction(&mut out, (in_day % MICROS_PER_SECOND) as u64);
    out
}

// ==================== SQL literals ====================

/// Quote a string for the text protocol.
pub fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("''"),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}

/// Hex literal for raw bytes.
pub fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        let _ = write!(result, "{byte:02X}");
    }
    result.push('\'');
    result
}

/// Render a value as a SQL literal for client-side interpolation.
///
/// NaN and infinities have no MySQL literal and are rejected.
pub fn format_value_for_sql(value: &Value) -> Result<String> {
    let non_finite = |actual: String| {
        Error::Type(TypeError {
            expected: "finite floating-point number",
            actual,
            column: None,
            rust_type: None,
        })
    };
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UnsignedBigInt(u) => u.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Double(f) if f.is_finite() => f.to_string(),
        Value::Float(f) => return Err(non_finite(f.to_string())),
        Value::Double(f) => return Err(non_finite(f.to_string())),
        Value::Decimal(s) => {
            if is_decimal_literal(s) {
                s.clone()
            } else {
                escape_string(s)
            }
        }
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string()),
        Value::Date(d) => format!("'{}'", format_date(i64::from(*d))),
        Value::Time(t) => format!("'{}'", format_time(*t)),
        Value::Timestamp(t) => format!("'{}'", format_timestamp(*t)),
    })
}

fn is_decimal_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let mut seen_dot = false;
    !digits.is_empty()
        && digits.bytes().all(|b| match b {
            b'0'..=b'9' => true,
            b'.' if !seen_dot => {
                seen_dot = true;
                true
            }
            _ => false,
        })
}

/// Byte offsets of `?` placeholders outside string literals, quoted
/// identifiers and comments.
pub fn placeholder_positions(sql: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut positions = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'?' => positions.push(i),
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 1;
                    } else if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_none_or(|b| b.is_ascii_whitespace()) =>
            {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    positions
}

/// Substitute `?` placeholders with SQL literals, in order.
///
/// The placeholder count must match `params.len()`.
pub fn interpolate_params(sql: &str, params: &[Value]) -> Result<String> {
    let positions = placeholder_positions(sql);
    if positions.len() != params.len() {
        return Err(Error::Custom(format!(
            "statement has {} placeholder(s) but {} parameter(s) were bound",
            positions.len(),
            params.len()
        )));
    }
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let mut result = String::with_capacity(sql.len() + params.len() * 16);
    let mut last = 0;
    for (pos, value) in positions.into_iter().zip(params) {
        result.push_str(&sql[last..pos]);
        result.push_str(&format_value_for_sql(value)?);
        last = pos + 1;
    }
    result.push_str(&sql[last..]);
    Ok(result)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Encode a 4.1 column definition packet.
    pub fn column_packet(name: &str, field_type: FieldType, flags: u16, charset: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for part in ["def", "test", "t", "t", name, name] {
            w.write_lenenc_string(part);
        }
        w.write_u8(0x0C);
        w.write_u16_le(charset);
        w.write_u32_le(11);
        w.write_u8(field_type as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    pub fn column(name: &str, field_type: FieldType, flags: u16, charset: u16) -> ColumnDefinition {
        let payload = column_packet(name, field_type, flags, charset);
        ColumnDefinition::decode(&payload, CapabilityFlags::CLIENT_PROTOCOL_41).unwrap()
    }
}
