//! Blocking MySQL wire-protocol client.
//!
//! This crate implements the MySQL client/server protocol directly over
//! `std::net::TcpStream` (optionally wrapped in rustls). It provides:
//!
//! - Packet framing with sequence numbers and max-size chunking
//! - Handshake and authentication (`mysql_native_password`,
//!   `caching_sha2_password`, `sha256_password`, `mysql_clear_password`)
//! - Text and binary result sets
//! - Client-side, server-side and callable prepared statements with batches
//! - Transactions, savepoints and session reset
//! - A [`MySqlConnector`] that plugs into `sqlwire-pool`
//!
//! # MySQL Protocol Overview
//!
//! Every packet carries a 3-byte payload length and a 1-byte sequence
//! number. Payloads of 16MB - 1 bytes or more are split across packets.
//! The sequence restarts at 0 for each command.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! let rows = conn.query("SELECT id, name FROM users WHERE id = ?", &[1.into()])?;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod connector;
pub(crate) mod error;
pub mod handshake;
pub mod metadata;
pub mod protocol;
pub mod resultset;
pub mod shared;
pub mod statement;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod types;

pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection};
pub use connector::MySqlConnector;
pub use metadata::{ColumnMetadata, ConnectionMetadata, ParameterMode, RoutineParameter, TableInfo};
pub use resultset::ResultSet;
pub use shared::SharedConnection;
pub use statement::{
    CallResult, CallableStatement, ClientPreparedStatement, QueryResult, ServerPreparedStatement,
    Statement, UpdateResult,
};
pub use stream::{MySqlStream, Socket};
