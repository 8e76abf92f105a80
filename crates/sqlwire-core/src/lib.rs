//! Core types and traits for sqlwire.
//!
//! This crate provides the pieces shared by the wire-protocol driver and the
//! connection pool:
//!
//! - `Error` taxonomy with SQLSTATE-class query errors
//! - `Value` and `Row` for parameters and decoded results
//! - `Connection` / `Connector` traits consumed by the pool

pub mod connection;
pub mod error;
pub mod row;
pub mod value;

pub use connection::{Connection, Connector, IsolationLevel};
pub use error::{
    BatchError, BatchOutcome, ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError,
    PoolErrorKind, ProtocolError, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
