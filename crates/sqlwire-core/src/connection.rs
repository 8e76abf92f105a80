//! Connection traits.
//!
//! - [`Connection`] - blocking operations a pool needs from a live session
//! - [`Connector`] - factory that opens new connections
//! - [`IsolationLevel`] - SQL transaction isolation levels
//!
//! Every method that talks to the server takes `&mut self`: a connection
//! carries one in-flight command at a time.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Transactions only see committed changes from others.
    ReadCommitted,

    /// Transactions see a consistent snapshot taken at the first read.
    /// This is the MySQL default.
    #[default]
    RepeatableRead,

    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Parse the server's session-variable spelling (`REPEATABLE-READ`) or
    /// the SQL spelling (`REPEATABLE READ`).
    pub fn from_server_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_uppercase().replace('-', " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// A live, blocking database session.
pub trait Connection: Send {
    /// Execute a query and collect every row.
    #[allow(clippy::result_large_err)]
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement and return the affected-row count.
    #[allow(clippy::result_large_err)]
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Round-trip liveness check.
    #[allow(clippy::result_large_err)]
    fn ping(&mut self) -> Result<()>;

    /// Restore default session state before the connection is reused.
    #[allow(clippy::result_large_err)]
    fn reset_session(&mut self) -> Result<()>;

    /// `false` once the connection is closed or its transport failed.
    fn is_usable(&self) -> bool;

    /// Close the session. Later calls fail with a closed-connection error.
    #[allow(clippy::result_large_err)]
    fn close(&mut self) -> Result<()>;
}

/// Opens new connections on demand.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection + 'static;

    #[allow(clippy::result_large_err)]
    fn connect(&self) -> Result<Self::Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_names() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::RepeatableRead);
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(
            IsolationLevel::from_server_name("REPEATABLE-READ"),
            Some(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            IsolationLevel::from_server_name("read committed"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(IsolationLevel::from_server_name("SNAPSHOT"), None);
    }
}
