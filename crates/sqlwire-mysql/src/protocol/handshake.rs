//! Connection-phase packets: the server greeting, the client's SSL request
//! and handshake response, and the packets exchanged while authenticating.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;
use std::fmt;

use sqlwire_core::Result;

use crate::error::{malformed, protocol_error};
use crate::protocol::reader::PacketReader;
use crate::protocol::response::{ErrPacket, OkPacket};
use crate::protocol::writer::PacketWriter;
use crate::protocol::{CapabilityFlags, StatusFlags};

/// Prefix MariaDB prepends to its version so old clients accept it.
const MARIADB_RPL_HACK: &str = "5.5.5-";

/// A parsed `major.minor.patch` server version.
///
/// Ordering is numeric, field by field; equal versions compare as
/// `Ordering::Equal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the leading numeric part of a version string such as
    /// `8.0.36-log` or `5.5.5-10.11.6-MariaDB`. Missing parts are zero.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.strip_prefix(MARIADB_RPL_HACK).unwrap_or(raw);
        let mut parts = raw.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u16>().unwrap_or(0)
        });
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        *self >= Self::new(major, minor, patch)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Protocol v10 greeting sent by the server on connect.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version_raw: String,
    pub server_version: ServerVersion,
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status: StatusFlags,
    /// Authentication scramble (both parts, trailing NUL removed).
    pub scramble: Vec<u8>,
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        let protocol_version = r.read_u8().ok_or_else(|| malformed("handshake", payload))?;
        if protocol_version != 10 {
            return Err(protocol_error(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }
        let server_version_raw = r.read_null_string();
        let connection_id = r.read_u32_le().ok_or_else(|| malformed("handshake", payload))?;
        let mut scramble = r
            .read_bytes(8)
            .ok_or_else(|| malformed("handshake", payload))?
            .to_vec();
        r.skip(1);
        let caps_lower = r.read_u16_le().ok_or_else(|| malformed("handshake", payload))?;

        // Pre-4.1 servers may end the greeting here.
        let charset = r.read_u8().unwrap_or(0);
        let status = StatusFlags::from_bits(r.read_u16_le().unwrap_or(0));
        let caps_upper = r.read_u16_le().unwrap_or(0);
        let capabilities =
            CapabilityFlags::from_bits(u32::from(caps_lower) | (u32::from(caps_upper) << 16));

        let auth_data_len = usize::from(r.read_u8().unwrap_or(0));
        r.skip(10);

        if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let len2 = auth_data_len.saturating_sub(8).max(13).min(r.remaining());
            let part2 = r.read_bytes(len2).unwrap_or_default();
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            scramble.extend_from_slice(part2);
        }

        let auth_plugin = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            r.read_null_string()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version: ServerVersion::parse(&server_version_raw),
            server_version_raw,
            connection_id,
            capabilities,
            charset,
            status,
            scramble,
            auth_plugin,
        })
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version_raw.contains("MariaDB")
    }
}

/// The 32-byte packet that asks the server to switch to TLS.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
}

impl SslRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(32);
        w.write_u32_le((self.capabilities | CapabilityFlags::CLIENT_SSL).bits());
        w.write_u32_le(self.max_packet_size);
        w.write_u8(self.charset);
        w.write_zeros(23);
        w.into_bytes()
    }
}

/// HandshakeResponse41 sent after the greeting (and after TLS, if any).
#[derive(Debug, Clone)]
pub struct HandshakeResponse41<'a> {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse41<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut w = PacketWriter::new();
        w.write_u32_le(caps.bits());
        w.write_u32_le(self.max_packet_size);
        w.write_u8(self.charset);
        w.write_zeros(23);
        w.write_null_string(self.user);

        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            w.write_lenenc_bytes(self.auth_response);
        } else if caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            w.write_u8(self.auth_response.len() as u8);
            w.write_bytes(self.auth_response);
        } else {
            w.write_bytes(self.auth_response);
            w.write_u8(0);
        }

        if caps.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            w.write_null_string(self.database.unwrap_or(""));
        }
        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            w.write_null_string(self.auth_plugin);
        }
        if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            w.write_lenenc_bytes(&encode_attributes(self.attributes));
        }
        w.into_bytes()
    }
}

pub(crate) fn encode_attributes(attributes: &[(String, String)]) -> Vec<u8> {
    let mut attrs = PacketWriter::new();
    for (key, value) in attributes {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(value);
    }
    attrs.into_bytes()
}

/// Request to restart authentication with another plugin (0xFE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        if r.read_u8() != Some(0xFE) {
            return Err(malformed("auth switch", payload));
        }
        let plugin = r.read_null_string();
        let data = r.read_rest();
        Ok(Self {
            plugin,
            scramble: data.strip_suffix(&[0]).unwrap_or(data).to_vec(),
        })
    }
}

/// A server packet received while authentication is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPacket {
    Ok(OkPacket),
    Err(ErrPacket),
    Switch(AuthSwitchRequest),
    /// Plugin-specific continuation (0x01 header stripped).
    MoreData(Vec<u8>),
}

impl AuthPacket {
    /// During authentication 0xFE is always a plugin switch, never EOF.
    pub fn decode(payload: &[u8], caps: CapabilityFlags) -> Result<Self> {
        match payload.first() {
            Some(0x00) => OkPacket::decode(payload, caps).map(AuthPacket::Ok),
            Some(0xFF) => ErrPacket::decode(payload, caps).map(AuthPacket::Err),
            Some(0xFE) => AuthSwitchRequest::decode(payload).map(AuthPacket::Switch),
            Some(0x01) => Ok(AuthPacket::MoreData(payload[1..].to_vec())),
            Some(other) => Err(protocol_error(format!(
                "unexpected packet {other:#04x} during authentication"
            ))),
            None => Err(protocol_error("empty packet during authentication")),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A MySQL 8.0 greeting advertising caching_sha2_password.
    pub fn greeting(caps: u32, plugin: &str, scramble: &[u8; 20]) -> Vec<u8> {
        let mut p = vec![10];
        p.extend_from_slice(b"8.0.36\0");
        p.extend_from_slice(&42u32.to_le_bytes());
        p.extend_from_slice(&scramble[..8]);
        p.push(0);
        p.extend_from_slice(&(caps as u16).to_le_bytes());
        p.push(255);
        p.extend_from_slice(&0x0002u16.to_le_bytes());
        p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0; 10]);
        p.extend_from_slice(&scramble[8..]);
        p.push(0);
        p.extend_from_slice(plugin.as_bytes());
        p.push(0);
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing_and_ordering() {
        let mysql = ServerVersion::parse("8.0.36-log");
        assert_eq!(mysql, ServerVersion::new(8, 0, 36));
        let maria = ServerVersion::parse("5.5.5-10.11.6-MariaDB-1:10.11.6+maria~ubu2204");
        assert_eq!(maria, ServerVersion::new(10, 11, 6));
        assert_eq!(ServerVersion::parse("garbage"), ServerVersion::default());

        assert_eq!(mysql.compare(&ServerVersion::new(8, 0, 36)), Ordering::Equal);
        assert_eq!(mysql.compare(&ServerVersion::new(8, 0, 4)), Ordering::Greater);
        assert_eq!(
            ServerVersion::new(5, 7, 44).compare(&ServerVersion::new(8, 0, 0)),
            Ordering::Less
        );
        assert!(mysql.at_least(8, 0, 3));
        assert!(!mysql.at_least(8, 1, 0));
        assert_eq!(mysql.to_string(), "8.0.36");
    }

    #[test]
    fn decode_greeting() {
        let caps = CapabilityFlags::DEFAULT_CLIENT | CapabilityFlags::CLIENT_SSL;
        let scramble = *b"abcdefghijklmnopqrst";
        let payload = fixtures::greeting(caps.bits(), "caching_sha2_password", &scramble);
        let hs = InitialHandshake::decode(&payload).unwrap();
        assert_eq!(hs.server_version_raw, "8.0.36");
        assert_eq!(hs.server_version, ServerVersion::new(8, 0, 36));
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.capabilities, caps);
        assert_eq!(hs.charset, 255);
        assert!(hs.status.contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
        assert_eq!(hs.scramble, scramble.to_vec());
        assert_eq!(hs.auth_plugin, "caching_sha2_password");
        assert!(!hs.is_mariadb());
    }

    #[test]
    fn reject_old_protocol() {
        assert!(InitialHandshake::decode(&[9, b'3', 0]).is_err());
        assert!(InitialHandshake::decode(&[10, b'8', 0, 1]).is_err());
    }

    #[test]
    fn ssl_request_is_32_bytes() {
        let req = SslRequest {
            capabilities: CapabilityFlags::CLIENT_PROTOCOL_41,
            max_packet_size: 16_777_216,
            charset: 45,
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..4], &0x0A00u32.to_le_bytes());
        assert_eq!(bytes[8], 45);
        assert!(bytes[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn handshake_response_layout() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        let resp = HandshakeResponse41 {
            capabilities: caps,
            max_packet_size: 1024,
            charset: 255,
            user: "app",
            auth_response: &[1, 2, 3],
            database: Some("shop"),
            auth_plugin: "mysql_native_password",
            attributes: &[],
        };
        let bytes = resp.encode();
        assert_eq!(&bytes[..4], &caps.bits().to_le_bytes());
        assert_eq!(&bytes[4..8], &1024u32.to_le_bytes());
        assert_eq!(bytes[8], 255);
        let rest = &bytes[32..];
        assert_eq!(rest, b"app\0\x03\x01\x02\x03shop\0mysql_native_password\0");
    }

    #[test]
    fn auth_packets() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(b"01234567890123456789\0");
        let AuthPacket::Switch(req) = AuthPacket::decode(&switch, caps).unwrap() else {
            panic!("expected switch");
        };
        assert_eq!(req.plugin, "mysql_native_password");
        assert_eq!(req.scramble, b"01234567890123456789".to_vec());

        assert_eq!(
            AuthPacket::decode(&[0x01, 0x03], caps).unwrap(),
            AuthPacket::MoreData(vec![0x03])
        );
        assert!(matches!(
            AuthPacket::decode(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00], caps).unwrap(),
            AuthPacket::Ok(_)
        ));
        assert!(AuthPacket::decode(&[0x42], caps).is_err());
    }
}
