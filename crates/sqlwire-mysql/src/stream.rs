//! Byte streams a connection can run over.
//!
//! [`Socket`] is the seam between the protocol code and the network: the
//! handshake only needs `Read + Write` plus an optional TLS upgrade, so tests
//! drive connections over in-memory scripts while production code uses
//! [`MySqlStream`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
use sqlwire_core::{Error, Result};

use crate::config::MySqlConfig;
use crate::tls::TlsStream;

/// A blocking, bidirectional byte stream carrying MySQL packets.
pub trait Socket: Read + Write + Send + Sized {
    /// Wrap the stream in TLS after the SSL request has been sent.
    fn upgrade_tls(self, config: &MySqlConfig) -> Result<Self> {
        let _ = config;
        Err(Error::connection(
            ConnectionErrorKind::Ssl,
            "this stream type does not support TLS",
        ))
    }

    fn is_tls(&self) -> bool {
        false
    }

    /// Best-effort close of the underlying transport.
    fn shutdown(&mut self) {}
}

/// TCP stream, optionally upgraded to TLS.
#[derive(Debug)]
pub enum MySqlStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MySqlStream {
    /// Resolve the configured host and connect to the first address that
    /// accepts within `connect_timeout`.
    pub fn connect(config: &MySqlConfig) -> Result<Self> {
        let addr = config.socket_addr();
        let addrs: Vec<_> = addr
            .to_socket_addrs()
            .map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::DnsResolution,
                    message: format!("failed to resolve {addr}: {e}"),
                    source: Some(Box::new(e)),
                })
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::connection(
                ConnectionErrorKind::DnsResolution,
                format!("{addr} resolved to no addresses"),
            ));
        }

        let mut last_err = None;
        for socket_addr in addrs {
            match TcpStream::connect_timeout(&socket_addr, config.connect_timeout) {
                Ok(stream) => {
                    tracing::debug!(%socket_addr, "tcp connected");
                    configure(&stream, config).map_err(crate::error::io_error)?;
                    return Ok(MySqlStream::Tcp(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.unwrap_or_else(|| io::Error::other("no address attempted"));
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
            _ => ConnectionErrorKind::Connect,
        };
        Err(Error::Connection(ConnectionError {
            kind,
            message: format!("failed to connect to {addr}: {err}"),
            source: Some(Box::new(err)),
        }))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            MySqlStream::Tcp(s) => s,
            MySqlStream::Tls(s) => s.get_ref(),
        }
    }
}

fn configure(stream: &TcpStream, config: &MySqlConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    stream.set_read_timeout(config.read_timeout)?;
    stream.set_write_timeout(config.write_timeout)?;
    Ok(())
}

impl Read for MySqlStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MySqlStream::Tcp(s) => s.read(buf),
            MySqlStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for MySqlStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MySqlStream::Tcp(s) => s.write(buf),
            MySqlStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MySqlStream::Tcp(s) => s.flush(),
            MySqlStream::Tls(s) => s.flush(),
        }
    }
}

impl Socket for MySqlStream {
    fn upgrade_tls(self, config: &MySqlConfig) -> Result<Self> {
        match self {
            MySqlStream::Tcp(tcp) => {
                let tls = TlsStream::new(tcp, &config.tls, &config.host, config.ssl_mode)?;
                Ok(MySqlStream::Tls(Box::new(tls)))
            }
            MySqlStream::Tls(_) => Err(Error::connection(
                ConnectionErrorKind::Ssl,
                "stream is already encrypted",
            )),
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, MySqlStream::Tls(_))
    }

    fn shutdown(&mut self) {
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory server for unit tests.

    use std::io::{self, Cursor, Read, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::Socket;
    use crate::protocol::writer::frame_payload;

    /// Replays canned server bytes and records everything the client writes.
    #[derive(Debug, Clone)]
    pub struct ScriptedStream {
        input: Arc<Mutex<Cursor<Vec<u8>>>>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedStream {
        pub fn new(server_bytes: Vec<u8>) -> Self {
            Self {
                input: Arc::new(Mutex::new(Cursor::new(server_bytes))),
                output: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Build from `(sequence_id, payload)` server packets.
        pub fn from_packets(packets: &[(u8, Vec<u8>)]) -> Self {
            Self::new(packets_to_bytes(packets))
        }

        /// Append more server bytes after the current script.
        pub fn push_packets(&self, packets: &[(u8, Vec<u8>)]) {
            let mut input = self.input.lock();
            let pos = input.position();
            input.get_mut().extend_from_slice(&packets_to_bytes(packets));
            input.set_position(pos);
        }

        pub fn written(&self) -> Vec<u8> {
            self.output.lock().clone()
        }

        /// Client packets as `(sequence_id, payload)`.
        pub fn written_packets(&self) -> Vec<(u8, Vec<u8>)> {
            split_packets(&self.written())
        }

        pub fn clear_written(&self) {
            self.output.lock().clear();
        }

        pub fn remaining_input(&self) -> usize {
            let input = self.input.lock();
            input.get_ref().len() - input.position() as usize
        }
    }

    pub fn packets_to_bytes(packets: &[(u8, Vec<u8>)]) -> Vec<u8> {
        packets
            .iter()
            .flat_map(|(seq, payload)| frame_payload(payload, *seq).0)
            .collect()
    }

    pub fn split_packets(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while bytes.len() >= 4 {
            let len = usize::from(bytes[0]) | usize::from(bytes[1]) << 8 | usize::from(bytes[2]) << 16;
            let seq = bytes[3];
            out.push((seq, bytes[4..4 + len].to_vec()));
            bytes = &bytes[4 + len..];
        }
        out
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.lock().read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Socket for ScriptedStream {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_refused_maps_to_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = MySqlConfig::new()
            .host("127.0.0.1")
            .port(port)
            .connect_timeout(std::time::Duration::from_secs(1));
        let err = MySqlStream::connect(&config).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Refused | ConnectionErrorKind::Connect,
                ..
            })
        ));
    }

    #[test]
    fn unresolvable_host_is_dns_error() {
        let config = MySqlConfig::new().host("does-not-exist.invalid");
        let err = MySqlStream::connect(&config).unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn scripted_stream_records_writes() {
        use testing::ScriptedStream;

        let mut stream = ScriptedStream::from_packets(&[(0, vec![1, 2, 3])]);
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [3, 0, 0, 0, 1, 2, 3]);
        stream.write_all(&[9, 0, 0, 1]).unwrap();
        assert_eq!(stream.written(), vec![9, 0, 0, 1]);
        assert!(stream.upgrade_tls(&MySqlConfig::new()).is_err());
    }
}
