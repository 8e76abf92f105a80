//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets.
//!
//! Everything under this module is pure: decoders take the bytes plus the
//! negotiated [`CapabilityFlags`] and never touch a socket.

pub mod command;
pub mod handshake;
pub mod prepared;
pub mod reader;
pub mod response;
pub mod writer;

pub use handshake::{AuthSwitchRequest, HandshakeResponse41, InitialHandshake, ServerVersion, SslRequest};
pub use prepared::{NullBitmap, StmtPrepareOk, build_stmt_execute_packet};
pub use reader::PacketReader;
pub use response::{EofPacket, ErrPacket, GenericResponse, OkPacket};
pub use writer::PacketWriter;

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $($flag:ident = $value:expr),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: Self = Self($value);)*

            const NAMED: &'static [(Self, &'static str)] = &[$((Self::$flag, stringify!($flag))),*];

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            /// `true` when every bit of `other` is set.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Names of the known flags that are set.
            pub fn names(self) -> impl Iterator<Item = &'static str> {
                Self::NAMED
                    .iter()
                    .filter(move |(flag, _)| flag.0 != 0 && self.contains(*flag))
                    .map(|(_, name)| *name)
            }
        }

        impl ::core::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl ::core::ops::BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                self.intersection(rhs)
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{}({:#x}", stringify!($name), self.0)?;
                let mut names = self.names().peekable();
                if names.peek().is_some() {
                    f.write_str(": ")?;
                    for (i, name) in names.enumerate() {
                        if i > 0 {
                            f.write_str(" | ")?;
                        }
                        f.write_str(name)?;
                    }
                }
                f.write_str(")")
            }
        }
    };
}

pub(crate) use flag_set;

flag_set! {
    /// MySQL capability flags (client and server).
    CapabilityFlags(u32) {
        CLIENT_LONG_PASSWORD = 1,
        CLIENT_FOUND_ROWS = 1 << 1,
        CLIENT_LONG_FLAG = 1 << 2,
        CLIENT_CONNECT_WITH_DB = 1 << 3,
        CLIENT_NO_SCHEMA = 1 << 4,
        CLIENT_COMPRESS = 1 << 5,
        CLIENT_ODBC = 1 << 6,
        CLIENT_LOCAL_FILES = 1 << 7,
        CLIENT_IGNORE_SPACE = 1 << 8,
        CLIENT_PROTOCOL_41 = 1 << 9,
        CLIENT_INTERACTIVE = 1 << 10,
        CLIENT_SSL = 1 << 11,
        CLIENT_IGNORE_SIGPIPE = 1 << 12,
        CLIENT_TRANSACTIONS = 1 << 13,
        CLIENT_RESERVED = 1 << 14,
        CLIENT_SECURE_CONNECTION = 1 << 15,
        CLIENT_MULTI_STATEMENTS = 1 << 16,
        CLIENT_MULTI_RESULTS = 1 << 17,
        CLIENT_PS_MULTI_RESULTS = 1 << 18,
        CLIENT_PLUGIN_AUTH = 1 << 19,
        CLIENT_CONNECT_ATTRS = 1 << 20,
        CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA = 1 << 21,
        CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS = 1 << 22,
        CLIENT_SESSION_TRACK = 1 << 23,
        CLIENT_DEPRECATE_EOF = 1 << 24,
        CLIENT_OPTIONAL_RESULTSET_METADATA = 1 << 25,
        CLIENT_ZSTD_COMPRESSION_ALGORITHM = 1 << 26,
        CLIENT_QUERY_ATTRIBUTES = 1 << 27,
    }
}

impl CapabilityFlags {
    /// Capabilities this client asks for before intersecting with the server.
    pub const DEFAULT_CLIENT: Self = Self(
        Self::CLIENT_LONG_PASSWORD.0
            | Self::CLIENT_LONG_FLAG.0
            | Self::CLIENT_PROTOCOL_41.0
            | Self::CLIENT_TRANSACTIONS.0
            | Self::CLIENT_SECURE_CONNECTION.0
            | Self::CLIENT_MULTI_RESULTS.0
            | Self::CLIENT_PS_MULTI_RESULTS.0
            | Self::CLIENT_PLUGIN_AUTH.0
            | Self::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA.0
            | Self::CLIENT_CONNECT_ATTRS.0
            | Self::CLIENT_SESSION_TRACK.0
            | Self::CLIENT_DEPRECATE_EOF.0,
    );
}

flag_set! {
    /// MySQL server status flags carried by OK and EOF packets.
    StatusFlags(u16) {
        SERVER_STATUS_IN_TRANS = 0x0001,
        SERVER_STATUS_AUTOCOMMIT = 0x0002,
        SERVER_MORE_RESULTS_EXISTS = 0x0008,
        SERVER_STATUS_NO_GOOD_INDEX_USED = 0x0010,
        SERVER_STATUS_NO_INDEX_USED = 0x0020,
        SERVER_STATUS_CURSOR_EXISTS = 0x0040,
        SERVER_STATUS_LAST_ROW_SENT = 0x0080,
        SERVER_STATUS_DB_DROPPED = 0x0100,
        SERVER_STATUS_NO_BACKSLASH_ESCAPES = 0x0200,
        SERVER_STATUS_METADATA_CHANGED = 0x0400,
        SERVER_QUERY_WAS_SLOW = 0x0800,
        SERVER_PS_OUT_PARAMS = 0x1000,
        SERVER_STATUS_IN_TRANS_READONLY = 0x2000,
        SERVER_SESSION_STATE_CHANGED = 0x4000,
    }
}

/// MySQL command codes (COM_xxx) this client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Statistics = 0x09,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    ResetConnection = 0x1f,
}

impl Command {
    pub const fn name(self) -> &'static str {
        match self {
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::Statistics => "COM_STATISTICS",
            Command::Ping => "COM_PING",
            Command::ChangeUser => "COM_CHANGE_USER",
            Command::StmtPrepare => "COM_STMT_PREPARE",
            Command::StmtExecute => "COM_STMT_EXECUTE",
            Command::StmtClose => "COM_STMT_CLOSE",
            Command::StmtReset => "COM_STMT_RESET",
            Command::SetOption => "COM_SET_OPTION",
            Command::ResetConnection => "COM_RESET_CONNECTION",
        }
    }
}

/// MySQL character set codes.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Default charset for new connections (utf8mb4).
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_0900_AI_CI;

    /// `true` for the binary pseudo-charset (BLOB/BINARY columns).
    pub const fn is_binary(charset: u16) -> bool {
        charset == BINARY as u16
    }
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}
