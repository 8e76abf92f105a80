//! Generic responses: OK, ERR and EOF packets.
//!
//! The same bytes decode differently depending on the negotiated
//! capabilities, so every decoder here takes a [`CapabilityFlags`].

use sqlwire_core::Result;

use crate::error::{malformed, protocol_error};
use crate::protocol::reader::PacketReader;
use crate::protocol::{CapabilityFlags, MAX_PACKET_SIZE, StatusFlags};

/// Session-state entry type carrying the new default schema.
const SESSION_TRACK_SCHEMA: u8 = 0x01;

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: StatusFlags,
    pub warnings: u16,
    pub info: String,
    /// Raw session-state-change block (CLIENT_SESSION_TRACK only).
    pub session_state: Vec<u8>,
}

impl OkPacket {
    /// Decode an OK packet whose header byte is 0x00 or 0xFE.
    pub fn decode(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        match r.read_u8() {
            Some(0x00 | 0xFE) => {}
            _ => return Err(malformed("OK", payload)),
        }
        let affected_rows = r.read_lenenc_int().ok_or_else(|| malformed("OK", payload))?;
        let last_insert_id = r.read_lenenc_int().ok_or_else(|| malformed("OK", payload))?;

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            ..OkPacket::default()
        };
        if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            ok.status = StatusFlags::from_bits(r.read_u16_le().ok_or_else(|| malformed("OK", payload))?);
            ok.warnings = r.read_u16_le().ok_or_else(|| malformed("OK", payload))?;
        } else if caps.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
            ok.status = StatusFlags::from_bits(r.read_u16_le().ok_or_else(|| malformed("OK", payload))?);
        }

        if caps.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            if !r.is_empty() {
                ok.info = r.read_lenenc_string().ok_or_else(|| malformed("OK", payload))?;
            }
            if ok.status.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) && !r.is_empty() {
                ok.session_state = r
                    .read_lenenc_bytes()
                    .ok_or_else(|| malformed("OK", payload))?
                    .to_vec();
            }
        } else {
            ok.info = r.read_rest_string();
        }
        Ok(ok)
    }

    /// New default schema announced through session tracking, if any.
    pub fn schema_change(&self) -> Option<String> {
        let mut r = PacketReader::new(&self.session_state);
        while !r.is_empty() {
            let kind = r.read_u8()?;
            let data = r.read_lenenc_bytes()?;
            if kind == SESSION_TRACK_SCHEMA {
                return PacketReader::new(data).read_lenenc_string();
            }
        }
        None
    }

    pub fn more_results(&self) -> bool {
        self.status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS)
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// Five-character SQLSTATE; absent before protocol 4.1.
    pub sql_state: Option<String>,
    pub error_message: String,
}

impl ErrPacket {
    pub fn decode(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        if r.read_u8() != Some(0xFF) {
            return Err(malformed("ERR", payload));
        }
        let error_code = r.read_u16_le().ok_or_else(|| malformed("ERR", payload))?;
        // The first packet of a handshake may be an ERR sent before any
        // capabilities are known, so the marker is checked as well.
        let sql_state = if caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) && r.peek() == Some(b'#') {
            r.skip(1);
            Some(r.read_string(5).ok_or_else(|| malformed("ERR", payload))?)
        } else {
            None
        };
        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message: r.read_rest_string(),
        })
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == 1062
    }
}

/// Parsed EOF packet (only when CLIENT_DEPRECATE_EOF is not negotiated).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status: StatusFlags,
}

impl EofPacket {
    pub fn decode(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        if r.read_u8() != Some(0xFE) || payload.len() >= 9 {
            return Err(malformed("EOF", payload));
        }
        if !caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            return Ok(EofPacket::default());
        }
        let warnings = r.read_u16_le().ok_or_else(|| malformed("EOF", payload))?;
        let status = StatusFlags::from_bits(r.read_u16_le().ok_or_else(|| malformed("EOF", payload))?);
        Ok(EofPacket { warnings, status })
    }
}

/// The OK/ERR/EOF family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericResponse {
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),
}

impl GenericResponse {
    /// Dispatch on the header byte and packet length.
    ///
    /// A 0xFE header shorter than 9 bytes is an EOF, unless
    /// CLIENT_DEPRECATE_EOF was negotiated, in which case the server sends
    /// OK packets with a 0xFE header instead. Longer 0xFE packets are
    /// always OK-shaped.
    pub fn decode(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        match payload.first() {
            Some(0x00) => OkPacket::decode(payload, caps).map(GenericResponse::Ok),
            Some(0xFF) => ErrPacket::decode(payload, caps).map(GenericResponse::Err),
            Some(0xFE)
                if payload.len() < 9 && !caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) =>
            {
                EofPacket::decode(payload, caps).map(GenericResponse::Eof)
            }
            Some(0xFE) => OkPacket::decode(payload, caps).map(GenericResponse::Ok),
            Some(other) => Err(protocol_error(format!(
                "expected OK/ERR/EOF, got packet starting with {other:#04x}"
            ))),
            None => Err(protocol_error("expected OK/ERR/EOF, got empty packet")),
        }
    }

    /// Status flags carried by OK or EOF.
    pub fn status(&self) -> Option<StatusFlags> {
        match self {
            GenericResponse::Ok(ok) => Some(ok.status),
            GenericResponse::Eof(eof) => Some(eof.status),
            GenericResponse::Err(_) => None,
        }
    }
}

/// `true` if a packet read in a row position ends the result set.
///
/// Rows never start with 0xFE unless they carry a cell of 2^24 bytes or
/// more, which cannot fit in a packet shorter than the maximum.
pub fn is_result_terminator(payload: &[u8], caps: CapabilityFlags) -> bool {
    if payload.first() != Some(&0xFE) {
        return false;
    }
    if caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        payload.len() < MAX_PACKET_SIZE
    } else {
        payload.len() < 9
    }
}
