//! Binary-protocol statement packets.
//!
//! This module covers the fixed parts of the prepared-statement exchange:
//!
//! 1. **Prepare**: COM_STMT_PREPARE answers with [`StmtPrepareOk`], followed
//!    by parameter and column definitions.
//! 2. **Execute**: COM_STMT_EXECUTE carries the statement id plus a binary
//!    parameter block built by [`build_stmt_execute_packet`].
//! 3. **Rows**: binary result rows start with a [`NullBitmap`] (offset 2).
//!
//! # References
//!
//! - [COM_STMT_PREPARE](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_stmt_prepare.html)
//! - [COM_STMT_EXECUTE](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_stmt_execute.html)
//! - [Binary Protocol Result Set](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_binary_resultset.html)

use sqlwire_core::{Result, Value};

use crate::error::malformed;
use crate::protocol::reader::PacketReader;
use crate::protocol::writer::PacketWriter;
use crate::protocol::Command;
use crate::types::{encode_binary_value, param_type};

/// Unsigned marker in the high byte of a parameter type pair.
const PARAM_UNSIGNED: u8 = 0x80;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement identifier
    pub statement_id: u32,
    /// Number of columns in the result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of `?` placeholders
    pub num_params: u16,
    pub warnings: u16,
}

impl StmtPrepareOk {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let bad = || malformed("COM_STMT_PREPARE_OK", payload);
        let mut r = PacketReader::new(payload);
        if r.read_u8() != Some(0x00) {
            return Err(bad());
        }
        let statement_id = r.read_u32_le().ok_or_else(bad)?;
        let num_columns = r.read_u16_le().ok_or_else(bad)?;
        let num_params = r.read_u16_le().ok_or_else(bad)?;
        r.skip(1);
        // warning_count is absent in some older server builds
        let warnings = r.read_u16_le().unwrap_or(0);
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// A NULL bitmap as used by binary rows (offset 2) and execute
/// parameter blocks (offset 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullBitmap {
    bytes: Vec<u8>,
    offset: usize,
}

impl NullBitmap {
    /// Bitmap length for `count` entries starting at bit `offset`.
    pub const fn byte_len(count: usize, offset: usize) -> usize {
        (count + 7 + offset) / 8
    }

    /// An all-clear bitmap for an execute parameter block.
    pub fn for_params(count: usize) -> Self {
        Self {
            bytes: vec![0; Self::byte_len(count, 0)],
            offset: 0,
        }
    }

    /// Read a result-row bitmap for `columns` columns.
    pub fn read_row(reader: &mut PacketReader<'_>, columns: usize) -> Option<Self> {
        let bytes = reader.read_bytes(Self::byte_len(columns, 2))?.to_vec();
        Some(Self { bytes, offset: 2 })
    }

    pub fn is_null(&self, index: usize) -> bool {
        let bit = index + self.offset;
        self.bytes
            .get(bit / 8)
            .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
    }

    pub fn set_null(&mut self, index: usize) {
        let bit = index + self.offset;
        if let Some(byte) = self.bytes.get_mut(bit / 8) {
            *byte |= 1 << (bit % 8);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Layout: command, statement id, flags (no cursor), iteration count 1,
/// then for a non-empty parameter list the NULL bitmap, the
/// new-params-bound flag and one (type, unsigned) pair per parameter,
/// followed by the non-NULL values.
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Result<Vec<u8>> {
    let mut w = PacketWriter::with_capacity(16 + params.len() * 12);
    w.write_u8(Command::StmtExecute as u8);
    w.write_u32_le(statement_id);
    w.write_u8(0);
    w.write_u32_le(1);

    if params.is_empty() {
        return Ok(w.into_bytes());
    }

    let mut nulls = NullBitmap::for_params(params.len());
    for (i, value) in params.iter().enumerate() {
        if value.is_null() {
            nulls.set_null(i);
        }
    }
    w.write_bytes(nulls.as_bytes());
    w.write_u8(1);

    for value in params {
        let (field_type, unsigned) = param_type(value);
        w.write_u8(field_type as u8);
        w.write_u8(if unsigned { PARAM_UNSIGNED } else { 0 });
    }
    for value in params {
        encode_binary_value(value, &mut w)?;
    }
    Ok(w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_ok_layout() {
        let payload = [0x00, 0x07, 0, 0, 0, 0x02, 0x00, 0x03, 0x00, 0x00, 0x01, 0x00];
        let ok = StmtPrepareOk::decode(&payload).unwrap();
        assert_eq!(ok.statement_id, 7);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
        assert_eq!(ok.warnings, 1);

        assert!(StmtPrepareOk::decode(&[0xFF, 0x01]).is_err());
        assert!(StmtPrepareOk::decode(&[0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn execute_without_params() {
        let payload = build_stmt_execute_packet(9, &[]).unwrap();
        assert_eq!(payload, vec![0x17, 9, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn execute_with_params() {
        let params = [
            Value::Int(5),
            Value::Null,
            Value::Text("ab".into()),
            Value::UnsignedBigInt(u64::MAX),
        ];
        let payload = build_stmt_execute_packet(1, &params).unwrap();
        let mut expected = vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0];
        expected.push(0b0000_0010);
        expected.push(1);
        expected.extend_from_slice(&[0x03, 0, 0x06, 0, 0xFD, 0, 0x08, 0x80]);
        expected.extend_from_slice(&[5, 0, 0, 0]);
        expected.extend_from_slice(&[2, b'a', b'b']);
        expected.extend_from_slice(&[0xFF; 8]);
        assert_eq!(payload, expected);
    }

    #[test]
    fn null_bitmap_sizes_and_offsets() {
        for columns in 1..=64 {
            let row_len = NullBitmap::byte_len(columns, 2);
            assert_eq!(row_len, (columns + 9) / 8);
            assert_eq!(NullBitmap::byte_len(columns, 0), columns.div_ceil(8));

            let mut bytes = vec![0u8; row_len];
            let last = columns - 1;
            bytes[(last + 2) / 8] |= 1 << ((last + 2) % 8);
            let mut r = PacketReader::new(&bytes);
            let bitmap = NullBitmap::read_row(&mut r, columns).unwrap();
            assert!(r.is_empty());
            for i in 0..columns {
                assert_eq!(bitmap.is_null(i), i == last, "columns={columns} i={i}");
            }

            let mut params = NullBitmap::for_params(columns);
            params.set_null(last);
            assert_eq!(params.as_bytes()[last / 8], 1 << (last % 8));
        }
    }
}
