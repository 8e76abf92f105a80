//! MySQL packet reading utilities.
//!
//! Primitive reads return `None` when the payload is too short; callers
//! turn that into a protocol error naming the field they were decoding.

#![allow(clippy::cast_possible_truncation)]

/// Marker byte for a NULL value in a length-encoded position.
pub const LENENC_NULL: u8 = 0xFB;

/// A cursor over one packet payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [a, b, c] = self.read_array::<3>()?;
        Some(u32::from(a) | (u32::from(b) << 8) | (u32::from(c) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        self.read_array().map(i8::from_le_bytes)
    }

    pub fn read_i16_le(&mut self) -> Option<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_i32_le(&mut self) -> Option<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Option<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Option<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64_le(&mut self) -> Option<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    ///
    /// 0xFB (NULL) and 0xFF are not integers and yield `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        self.read_lenenc_nullable().flatten()
    }

    /// Read a length-encoded integer where 0xFB means NULL.
    ///
    /// Outer `None` is a truncated or invalid prefix, inner `None` is NULL.
    pub fn read_lenenc_nullable(&mut self) -> Option<Option<u64>> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(Some(u64::from(first))),
            LENENC_NULL => Some(None),
            0xFC => self.read_u16_le().map(|v| Some(u64::from(v))),
            0xFD => self.read_u24_le().map(|v| Some(u64::from(v))),
            0xFE => self.read_u64_le().map(Some),
            0xFF => None,
        }
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a length-encoded value that may be NULL (text-protocol cell).
    pub fn read_lenenc_value(&mut self) -> Option<Option<&'a [u8]>> {
        match self.read_lenenc_nullable()? {
            None => Some(None),
            Some(len) => {
                let len = usize::try_from(len).ok()?;
                self.read_bytes(len).map(Some)
            }
        }
    }

    /// Read a length-encoded string, replacing invalid UTF-8.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a NUL-terminated byte run. A missing terminator consumes the rest.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes; `false` if fewer remain.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }
}
