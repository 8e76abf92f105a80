//! Result sets and the response reader shared by the text and binary protocols.
//!
//! A command response is either OK, ERR, a LOCAL INFILE request, or a
//! result set:
//!
//! ```text
//! column count (lenenc)
//! column definition × count
//! [EOF]                      -- unless CLIENT_DEPRECATE_EOF
//! row × n
//! EOF | OK(0xFE)             -- terminator, carries status flags
//! ```

use std::sync::Arc;

use sqlwire_core::{ColumnInfo, Result, Row, Value};

use crate::error::{malformed, protocol_error};
use crate::protocol::prepared::NullBitmap;
use crate::protocol::reader::PacketReader;
use crate::protocol::response::is_result_terminator;
use crate::protocol::{CapabilityFlags, EofPacket, ErrPacket, GenericResponse, OkPacket, StatusFlags};
use crate::stream::Socket;
use crate::transport::PacketTransport;
use crate::types::{ColumnDefinition, decode_binary_value, decode_text_value};

/// Row encoding of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY: every cell is a length-encoded string.
    Text,
    /// COM_STMT_EXECUTE: null bitmap plus type-driven values.
    Binary,
}

/// One undecoded row payload.
#[derive(Debug, Clone, Copy)]
pub enum RawRow<'a> {
    Text(&'a [u8]),
    Binary(&'a [u8]),
}

impl<'a> RawRow<'a> {
    pub fn new(format: RowFormat, payload: &'a [u8]) -> Self {
        match format {
            RowFormat::Text => RawRow::Text(payload),
            RowFormat::Binary => RawRow::Binary(payload),
        }
    }

    /// Decode into exactly one value per column.
    pub fn decode(self, columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
        match self {
            RawRow::Text(payload) => decode_text_row(payload, columns),
            RawRow::Binary(payload) => decode_binary_row(payload, columns),
        }
    }
}

fn decode_text_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let mut r = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = match r.read_lenenc_value() {
            Some(None) => Value::Null,
            Some(Some(data)) => decode_text_value(column, data),
            None => return Err(row_mismatch(payload, columns.len(), values.len())),
        };
        values.push(value);
    }
    if !r.is_empty() {
        return Err(malformed("text row (trailing bytes)", payload));
    }
    Ok(values)
}

fn decode_binary_row(payload: &[u8], columns: &[ColumnDefinition]) -> Result<Vec<Value>> {
    let mut r = PacketReader::new(payload);
    if r.read_u8() != Some(0x00) {
        return Err(malformed("binary row", payload));
    }
    let nulls = NullBitmap::read_row(&mut r, columns.len())
        .ok_or_else(|| malformed("binary row null bitmap", payload))?;
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        if nulls.is_null(i) {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(&mut r, column)?);
        }
    }
    if !r.is_empty() {
        return Err(malformed("binary row (trailing bytes)", payload));
    }
    Ok(values)
}

fn row_mismatch(payload: &[u8], expected: usize, got: usize) -> sqlwire_core::Error {
    sqlwire_core::Error::Protocol(sqlwire_core::ProtocolError {
        message: format!("row has {got} values, expected {expected}"),
        raw_data: Some(payload.to_vec()),
        source: None,
    })
}

/// Decoded rows of one result, read front to back.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<[ColumnDefinition]>,
    rows: Vec<Row>,
    cursor: usize,
    status: StatusFlags,
    warnings: u16,
}

impl ResultSet {
    pub fn new(columns: Arc<[ColumnDefinition]>, rows: Vec<Row>, status: StatusFlags, warnings: u16) -> Self {
        Self {
            columns,
            rows,
            cursor: 0,
            status,
            warnings,
        }
    }

    /// A result with no columns, for statements that only return OK.
    pub fn empty(status: StatusFlags, warnings: u16) -> Self {
        Self::new(Arc::from(Vec::<ColumnDefinition>::new()), Vec::new(), status, warnings)
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Advance the forward-only cursor.
    pub fn next_row(&mut self) -> Option<&Row> {
        let row = self.rows.get(self.cursor)?;
        self.cursor += 1;
        Some(row)
    }

    /// Rows the cursor has not yet passed.
    pub fn remaining(&self) -> &[Row] {
        &self.rows[self.cursor..]
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Status flags from the terminating EOF/OK packet.
    pub fn status(&self) -> StatusFlags {
        self.status
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn more_results(&self) -> bool {
        self.status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        let mut rows = self.rows;
        rows.drain(..self.cursor);
        rows.into_iter()
    }
}

/// What the server answered to a command.
#[derive(Debug)]
pub enum Response {
    Ok(OkPacket),
    ResultSet(ResultSet),
    Err(ErrPacket),
}

impl Response {
    pub fn status(&self) -> Option<StatusFlags> {
        match self {
            Response::Ok(ok) => Some(ok.status),
            Response::ResultSet(rs) => Some(rs.status()),
            Response::Err(_) => None,
        }
    }

    pub fn more_results(&self) -> bool {
        self.status()
            .is_some_and(|s| s.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS))
    }
}

/// Read one complete response (a single result of a possibly multi-result
/// stream) from the transport.
pub fn read_response<S: Socket>(
    transport: &mut PacketTransport<S>,
    caps: CapabilityFlags,
    format: RowFormat,
) -> Result<Response> {
    let first = transport.receive()?;
    match first.first() {
        Some(0x00) => Ok(Response::Ok(OkPacket::decode(&first, caps)?)),
        Some(0xFF) => Ok(Response::Err(ErrPacket::decode(&first, caps)?)),
        Some(0xFB) => refuse_local_infile(transport, caps),
        Some(_) => {
            let count = PacketReader::new(&first)
                .read_lenenc_int()
                .ok_or_else(|| malformed("column count", &first))?;
            let count = usize::try_from(count)
                .ok()
                .filter(|&c| c > 0 && c <= 4096)
                .ok_or_else(|| malformed("column count", &first))?;
            let columns = read_column_definitions(transport, count, caps)?;
            read_rows(transport, columns, caps, format)
        }
        None => Err(protocol_error("empty response packet")),
    }
}

/// Read `count` column definitions plus the trailing EOF when the server
/// still sends one.
pub fn read_column_definitions<S: Socket>(
    transport: &mut PacketTransport<S>,
    count: usize,
    caps: CapabilityFlags,
) -> Result<Arc<[ColumnDefinition]>> {
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let payload = transport.receive()?;
        columns.push(ColumnDefinition::decode(&payload, caps)?);
    }
    if !caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        let payload = transport.receive()?;
        EofPacket::decode(&payload, caps)?;
    }
    Ok(columns.into())
}

fn read_rows<S: Socket>(
    transport: &mut PacketTransport<S>,
    columns: Arc<[ColumnDefinition]>,
    caps: CapabilityFlags,
    format: RowFormat,
) -> Result<Response> {
    let info = Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ));
    let mut rows = Vec::new();
    loop {
        let payload = transport.receive()?;
        if payload.first() == Some(&0xFF) {
            return Ok(Response::Err(ErrPacket::decode(&payload, caps)?));
        }
        if is_result_terminator(&payload, caps) {
            let (status, warnings) = match GenericResponse::decode(&payload, caps)? {
                GenericResponse::Ok(ok) => (ok.status, ok.warnings),
                GenericResponse::Eof(eof) => (eof.status, eof.warnings),
                GenericResponse::Err(err) => return Ok(Response::Err(err)),
            };
            tracing::trace!(rows = rows.len(), columns = columns.len(), "result set complete");
            return Ok(Response::ResultSet(ResultSet::new(columns, rows, status, warnings)));
        }
        let values = RawRow::new(format, &payload).decode(&columns)?;
        rows.push(Row::with_columns(Arc::clone(&info), values));
    }
}

/// The server asked for a client-side file. Answer with an empty file so
/// the connection stays in sync, then fail the statement.
fn refuse_local_infile<S: Socket>(transport: &mut PacketTransport<S>, caps: CapabilityFlags) -> Result<Response> {
    tracing::warn!("server requested LOCAL INFILE, which is not supported");
    transport.send(&[])?;
    if let GenericResponse::Err(err) = transport.receive_with(|p| GenericResponse::decode(p, caps))? {
        tracing::debug!(code = err.error_code, "server error after refused LOCAL INFILE");
    }
    Err(sqlwire_core::Error::config("LOAD DATA LOCAL INFILE is not supported"))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Server-side encodings of result sets for scripted streams.

    use crate::protocol::writer::PacketWriter;
    use crate::types::FieldType;
    use crate::types::fixtures::column_packet;

    pub fn column_count(n: u64) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(n);
        w.into_bytes()
    }

    /// OK packet with the 0x00 header.
    pub fn ok(affected: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
        ok_with_header(0x00, affected, last_insert_id, status)
    }

    /// Result-set terminator under CLIENT_DEPRECATE_EOF.
    pub fn ok_terminator(status: u16) -> Vec<u8> {
        ok_with_header(0xFE, 0, 0, status)
    }

    fn ok_with_header(header: u8, affected: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(header);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(last_insert_id);
        w.write_u16_le(status);
        w.write_u16_le(0);
        w.into_bytes()
    }

    pub fn eof(status: u16) -> Vec<u8> {
        let mut p = vec![0xFE, 0, 0];
        p.extend_from_slice(&status.to_le_bytes());
        p
    }

    pub fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
        let mut p = vec![0xFF];
        p.extend_from_slice(&code.to_le_bytes());
        p.push(b'#');
        p.extend_from_slice(state.as_bytes());
        p.extend_from_slice(message.as_bytes());
        p
    }

    pub fn text_row(cells: &[Option<&str>]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for cell in cells {
            match cell {
                Some(s) => w.write_lenenc_string(s),
                None => w.write_u8(0xFB),
            }
        }
        w.into_bytes()
    }

    /// Packets of a text result set under CLIENT_DEPRECATE_EOF, starting at `seq`.
    pub fn text_result(
        seq: u8,
        columns: &[(&str, FieldType)],
        rows: &[Vec<Option<&str>>],
        status: u16,
    ) -> Vec<(u8, Vec<u8>)> {
        let mut packets = vec![column_count(columns.len() as u64)];
        for (name, ty) in columns {
            packets.push(column_packet(name, *ty, 0, 255));
        }
        for row in rows {
            packets.push(text_row(row));
        }
        packets.push(ok_terminator(status));
        packets
            .into_iter()
            .enumerate()
            .map(|(i, p)| (seq.wrapping_add(i as u8), p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::protocol::writer::PacketWriter;
    use crate::stream::testing::ScriptedStream;
    use crate::types::FieldType;
    use crate::types::fixtures::{column, column_packet};

    const MODERN: CapabilityFlags = CapabilityFlags::DEFAULT_CLIENT;

    fn legacy_eof() -> CapabilityFlags {
        let mut caps = CapabilityFlags::DEFAULT_CLIENT;
        caps.remove(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        caps
    }

    fn transport(packets: &[(u8, Vec<u8>)]) -> PacketTransport<ScriptedStream> {
        let mut t = PacketTransport::new(ScriptedStream::from_packets(packets));
        t.send(b"\x03q").unwrap();
        t
    }

    #[test]
    fn text_result_with_nulls() {
        let packets = text_result(
            1,
            &[("id", FieldType::Long), ("name", FieldType::VarString)],
            &[vec![Some("1"), Some("ann")], vec![Some("2"), None]],
            0x0002,
        );
        let mut t = transport(&packets);
        let Response::ResultSet(mut rs) = read_response(&mut t, MODERN, RowFormat::Text).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rs.column_count(), 2);
        assert_eq!(rs.len(), 2);
        let first = rs.next_row().unwrap().clone();
        assert_eq!(first.get_named::<i32>("id").unwrap(), 1);
        assert_eq!(first.get_named::<String>("name").unwrap(), "ann");
        let second = rs.next_row().unwrap();
        assert_eq!(second.get(1), Some(&Value::Null));
        assert!(rs.next_row().is_none());
        assert!(!rs.more_results());
    }

    #[test]
    fn legacy_eof_framing() {
        let packets = vec![
            (1, column_count(1)),
            (2, column_packet("n", FieldType::LongLong, 0, 63)),
            (3, eof(0x0002)),
            (4, text_row(&[Some("42")])),
            (5, eof(0x0002 | 0x0008)),
        ];
        let mut t = transport(&packets);
        let response = read_response(&mut t, legacy_eof(), RowFormat::Text).unwrap();
        assert!(response.more_results());
        let Response::ResultSet(rs) = response else {
            panic!("expected rows");
        };
        assert_eq!(rs.rows()[0].get(0), Some(&Value::BigInt(42)));
    }

    #[test]
    fn ok_and_err_responses() {
        let mut t = transport(&[(1, ok(3, 10, 0x0002))]);
        let Response::Ok(ok) = read_response(&mut t, MODERN, RowFormat::Text).unwrap() else {
            panic!("expected OK");
        };
        assert_eq!((ok.affected_rows, ok.last_insert_id), (3, 10));

        let mut t = transport(&[(1, err(1064, "42000", "You have an error"))]);
        let Response::Err(e) = read_response(&mut t, MODERN, RowFormat::Text).unwrap() else {
            panic!("expected ERR");
        };
        assert_eq!(e.sql_state.as_deref(), Some("42000"));
    }

    #[test]
    fn error_in_row_stream() {
        let packets = vec![
            (1, column_count(1)),
            (2, column_packet("n", FieldType::Long, 0, 63)),
            (3, text_row(&[Some("1")])),
            (4, err(1317, "70100", "Query execution was interrupted")),
        ];
        let mut t = transport(&packets);
        assert!(matches!(
            read_response(&mut t, MODERN, RowFormat::Text).unwrap(),
            Response::Err(_)
        ));
    }

    #[test]
    fn binary_rows() {
        let columns = [
            column("a", FieldType::Long, 0, 63),
            column("b", FieldType::VarString, 0, 255),
            column("c", FieldType::Double, 0, 63),
        ];
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        // b is NULL: bit 1 + offset 2
        w.write_u8(0b0000_1000);
        w.write_u32_le(7);
        w.write_bytes(&1.5f64.to_le_bytes());
        let payload = w.into_bytes();

        let values = RawRow::Binary(&payload).decode(&columns).unwrap();
        assert_eq!(values, vec![Value::Int(7), Value::Null, Value::Double(1.5)]);

        let mut short = payload.clone();
        short.pop();
        assert!(RawRow::Binary(&short).decode(&columns).is_err());
        let mut long = payload;
        long.push(0);
        assert!(RawRow::Binary(&long).decode(&columns).is_err());
    }

    #[test]
    fn text_row_value_count_must_match() {
        let columns = [column("a", FieldType::Long, 0, 63), column("b", FieldType::Long, 0, 63)];
        let err = RawRow::Text(&text_row(&[Some("1")])).decode(&columns).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
        assert!(RawRow::Text(&text_row(&[Some("1"), Some("2"), Some("3")])).decode(&columns).is_err());
    }

    #[test]
    fn local_infile_is_refused() {
        let mut request = vec![0xFB];
        request.extend_from_slice(b"/etc/passwd");
        let stream = ScriptedStream::from_packets(&[(1, request), (3, ok(0, 0, 0x0002))]);
        let mut t = PacketTransport::new(stream.clone());
        t.send(b"\x03LOAD DATA LOCAL INFILE '/etc/passwd' INTO TABLE t").unwrap();
        assert!(read_response(&mut t, MODERN, RowFormat::Text).is_err());
        assert_eq!(stream.written_packets().last(), Some(&(2, Vec::new())));
        assert!(!t.is_broken());
    }

    #[test]
    fn cursor_skips_consumed_rows_when_iterating() {
        let packets = text_result(
            1,
            &[("n", FieldType::Long)],
            &[vec![Some("1")], vec![Some("2")], vec![Some("3")]],
            0x0002,
        );
        let mut t = transport(&packets);
        let Response::ResultSet(mut rs) = read_response(&mut t, MODERN, RowFormat::Text).unwrap() else {
            panic!("expected rows");
        };
        rs.next_row();
        assert_eq!(rs.remaining().len(), 2);
        let rest: Vec<i32> = rs.into_iter().map(|r| r.get_as::<i32>(0).unwrap()).collect();
        assert_eq!(rest, vec![2, 3]);
    }
}
