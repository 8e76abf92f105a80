//! Conversions from wire-level failures into `sqlwire_core::Error`.

use std::io;

use sqlwire_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
};
use sqlwire_core::{Error, Value};

use crate::protocol::ErrPacket;

pub(crate) fn protocol_error(msg: impl Into<String>) -> Error {
    Error::protocol(msg)
}

/// A decode failure that keeps the offending payload for diagnostics.
pub(crate) fn malformed(what: &str, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("malformed {what} packet ({} bytes)", payload.len()),
        raw_data: Some(payload.to_vec()),
        source: None,
    })
}

pub(crate) fn auth_error(msg: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, msg)
}

pub(crate) fn connection_error(msg: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Connect, msg)
}

/// Misuse of a statement handle (unbound parameter, closed statement, ...).
pub(crate) fn statement_error(msg: impl Into<String>) -> Error {
    Error::Custom(msg.into())
}

pub(crate) fn closed_error() -> Error {
    Error::connection(ConnectionErrorKind::Closed, "connection is closed")
}

/// Map a transport I/O failure. Timeouts become `Error::Timeout`; anything
/// else means the peer is gone.
pub(crate) fn io_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
        io::ErrorKind::ConnectionRefused => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }),
        _ => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("connection lost: {err}"),
            source: Some(Box::new(err)),
        }),
    }
}

/// Convert a server ERR packet into a typed query error carrying the
/// statement text and bound parameters.
pub(crate) fn server_error(err: &ErrPacket, sql: Option<&str>, params: &[Value]) -> Error {
    let sqlstate = err.sql_state.as_deref();
    Error::Query(QueryError {
        kind: QueryErrorKind::from_sqlstate(sqlstate, Some(err.error_code)),
        sql: sql.map(str::to_string),
        params: params.to_vec(),
        sqlstate: err.sql_state.clone(),
        vendor_code: Some(err.error_code),
        message: err.error_message.clone(),
        detail: sql.map(|s| format!("while executing: {}", truncate_sql(s))),
        source: None,
    })
}

/// ERR received during the handshake: always an authentication/connect failure.
pub(crate) fn handshake_server_error(err: &ErrPacket) -> Error {
    let message = match &err.sql_state {
        Some(state) => format!("{} ({}, SQLSTATE {})", err.error_message, err.error_code, state),
        None => format!("{} ({})", err.error_message, err.error_code),
    };
    // 1045 access denied, 1251 client does not support auth protocol
    let kind = if err.sql_state.as_deref().and_then(|s| s.get(..2)) == Some("28")
        || matches!(err.error_code, 1045 | 1251 | 1698)
    {
        ConnectionErrorKind::Authentication
    } else {
        ConnectionErrorKind::Connect
    };
    Error::connection(kind, message)
}

pub(crate) fn truncate_sql(sql: &str) -> &str {
    const LIMIT: usize = 200;
    if sql.len() <= LIMIT {
        return sql;
    }
    let mut end = LIMIT;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}
