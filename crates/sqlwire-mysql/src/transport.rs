//! Packet framing over a byte stream.
//!
//! [`PacketTransport`] owns the socket and the sequence counter. It knows
//! nothing about packet contents: callers hand it payloads and get payloads
//! back, with max-size chunks split and reassembled transparently.

use std::io::{BufReader, Read, Write};

use sqlwire_core::{Error, Result};

use crate::error::{io_error, protocol_error};
use crate::protocol::writer::frame_payload;
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};
use crate::stream::Socket;

const READ_BUFFER: usize = 16 * 1024;

/// Framed packet I/O with strict sequence checking.
#[derive(Debug)]
pub struct PacketTransport<S: Socket> {
    stream: BufReader<S>,
    sequence_id: u8,
    broken: bool,
}

impl<S: Socket> PacketTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::with_capacity(READ_BUFFER, stream),
            sequence_id: 0,
            broken: false,
        }
    }

    /// Sequence id the next sent or received packet must carry.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Start a new command exchange.
    pub fn reset_sequence_id(&mut self) {
        self.sequence_id = 0;
    }

    /// `true` once an I/O or framing failure left the stream in an unknown state.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Frame and write one logical packet.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.broken {
            return Err(broken_error());
        }
        let (bytes, next) = frame_payload(payload, self.sequence_id);
        tracing::trace!(len = payload.len(), seq = self.sequence_id, "send packet");
        let stream = self.stream.get_mut();
        if let Err(e) = stream.write_all(&bytes).and_then(|()| stream.flush()) {
            self.broken = true;
            return Err(io_error(e));
        }
        self.sequence_id = next;
        Ok(())
    }

    /// Read one logical packet, reassembling max-size chunks.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        if self.broken {
            return Err(broken_error());
        }
        match self.read_logical_packet() {
            Ok(payload) => Ok(payload),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Read one packet and hand it to `decode`.
    pub fn receive_with<T>(&mut self, decode: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let payload = self.receive()?;
        decode(&payload)
    }

    fn read_logical_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.stream.read_exact(&mut header).map_err(io_error)?;
            let header = PacketHeader::from_bytes(&header);
            if header.sequence_id != self.sequence_id {
                return Err(protocol_error(format!(
                    "packet out of order: expected sequence id {}, got {}",
                    self.sequence_id, header.sequence_id
                )));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            tracing::trace!(len, seq = header.sequence_id, "recv packet");
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .map_err(io_error)?;
            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// Replace the stream (TLS upgrade), keeping the sequence counter.
    ///
    /// Fails if the server sent bytes that are still buffered: they belong
    /// to the plaintext stream and would be lost.
    pub fn into_upgraded(self, upgrade: impl FnOnce(S) -> Result<S>) -> Result<Self> {
        if !self.stream.buffer().is_empty() {
            return Err(protocol_error(
                "unexpected data from server before TLS negotiation",
            ));
        }
        let sequence_id = self.sequence_id;
        let stream = upgrade(self.stream.into_inner())?;
        Ok(Self {
            stream: BufReader::with_capacity(READ_BUFFER, stream),
            sequence_id,
            broken: false,
        })
    }

    /// `true` when nothing is waiting in the read buffer.
    pub fn is_drained(&self) -> bool {
        self.stream.buffer().is_empty()
    }

    pub fn shutdown(&mut self) {
        self.stream.get_mut().shutdown();
    }

    #[cfg(test)]
    pub(crate) fn fill_buf_for_test(&mut self) -> usize {
        use std::io::BufRead;
        self.stream.fill_buf().map(<[u8]>::len).unwrap_or(0)
    }
}

fn broken_error() -> Error {
    Error::connection(
        sqlwire_core::error::ConnectionErrorKind::Disconnected,
        "connection is broken by an earlier I/O or protocol failure",
    )
}
