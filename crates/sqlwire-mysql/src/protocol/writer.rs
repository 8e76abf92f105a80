//! MySQL packet writing utilities.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

/// A growable payload buffer with MySQL primitive encoders.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u24 (little-endian, 3 bytes).
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer using the shortest prefix.
    ///
    /// - 0..=250: 1-byte value
    /// - 251..=0xFFFF: 0xFC + 2 bytes
    /// - ..=0xFF_FFFF: 0xFD + 3 bytes
    /// - larger: 0xFE + 8 bytes
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a NUL-terminated string.
    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

/// Frame a payload into one or more packets starting at `sequence_id`.
///
/// A payload of `MAX_PACKET_SIZE` bytes or more is split into max-size
/// chunks followed by a final shorter chunk, which is empty when the length
/// is an exact multiple. Returns the framed bytes and the next sequence id.
pub fn frame_payload(payload: &[u8], mut sequence_id: u8) -> (Vec<u8>, u8) {
    let chunks = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + chunks * PacketHeader::SIZE);
    let mut offset = 0;
    loop {
        let chunk_len = (payload.len() - offset).min(MAX_PACKET_SIZE);
        let header = PacketHeader {
            payload_length: chunk_len as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload[offset..offset + chunk_len]);
        offset += chunk_len;
        sequence_id = sequence_id.wrapping_add(1);
        if chunk_len < MAX_PACKET_SIZE {
            break;
        }
    }
    (out, sequence_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_integers() {
        let mut writer = PacketWriter::new();
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x0012_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_write_strings() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("root");
        writer.write_lenenc_string("db");
        assert_eq!(writer.as_bytes(), b"root\0\x02db");
    }

    #[test]
    fn frame_small_payload() {
        let (framed, next) = frame_payload(b"\x03SELECT 1", 0);
        assert_eq!(&framed[..4], &[0x09, 0x00, 0x00, 0x00]);
        assert_eq!(&framed[4..], b"\x03SELECT 1");
        assert_eq!(next, 1);
    }

    #[test]
    fn frame_empty_payload() {
        let (framed, next) = frame_payload(&[], 3);
        assert_eq!(framed, vec![0, 0, 0, 3]);
        assert_eq!(next, 4);
    }

    #[test]
    fn frame_exact_max_payload_adds_empty_terminator() {
        let payload = vec![0xAB; MAX_PACKET_SIZE];
        let (framed, next) = frame_payload(&payload, 255);
        assert_eq!(framed.len(), MAX_PACKET_SIZE + 8);
        assert_eq!(&framed[..4], &[0xFF, 0xFF, 0xFF, 255]);
        assert_eq!(&framed[MAX_PACKET_SIZE + 4..], &[0, 0, 0, 0]);
        assert_eq!(next, 1);
    }

    #[test]
    fn frame_oversized_payload_splits() {
        let payload = vec![0x01; MAX_PACKET_SIZE + 10];
        let (framed, next) = frame_payload(&payload, 0);
        assert_eq!(framed.len(), MAX_PACKET_SIZE + 10 + 8);
        let tail = &framed[MAX_PACKET_SIZE + 4..MAX_PACKET_SIZE + 8];
        assert_eq!(tail, &[10, 0, 0, 1]);
        assert_eq!(next, 2);
    }
}
