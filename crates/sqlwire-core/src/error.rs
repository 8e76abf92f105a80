//! Error types for sqlwire operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authenticate, disconnect)
    Connection(ConnectionError),
    /// Server-reported statement errors
    Query(QueryError),
    /// Batch execution failure with per-statement outcomes
    Batch(BatchError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
    /// The connection was closed by the caller
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    /// Parameters bound when the statement failed.
    pub params: Vec<Value>,
    pub sqlstate: Option<String>,
    /// Server vendor error number (e.g. 1062 for a duplicate key).
    pub vendor_code: Option<u16>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Error classes keyed by the SQLSTATE class prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Class 08: connection exception, retry on a new connection may succeed
    TransientConnection,
    /// Class 22: malformed or out-of-range value
    DataException,
    /// Class 28: invalid authorization specification
    Authorization,
    /// Class 23: integrity constraint violation
    Constraint,
    /// Class 40 with vendor code 1213
    Deadlock,
    /// Class 40: transaction rollback
    Serialization,
    /// Class 42: syntax error or access rule violation
    Syntax,
    /// Class 0A: feature not supported
    NotSupported,
    /// Unclassified or absent SQLSTATE
    Database,
}

impl QueryErrorKind {
    /// Classify by SQLSTATE class. The vendor code only separates deadlocks
    /// from other rollbacks inside class 40.
    pub fn from_sqlstate(sqlstate: Option<&str>, vendor_code: Option<u16>) -> Self {
        let Some(class) = sqlstate.and_then(|s| s.get(..2)) else {
            return QueryErrorKind::Database;
        };
        match class {
            "08" => QueryErrorKind::TransientConnection,
            "22" => QueryErrorKind::DataException,
            "28" => QueryErrorKind::Authorization,
            "23" => QueryErrorKind::Constraint,
            "40" if vendor_code == Some(1213) => QueryErrorKind::Deadlock,
            "40" => QueryErrorKind::Serialization,
            "42" => QueryErrorKind::Syntax,
            "0A" => QueryErrorKind::NotSupported,
            _ => QueryErrorKind::Database,
        }
    }
}

/// Result of one statement in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Success { affected_rows: u64 },
    Failed { message: String },
    NotExecuted,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Success { .. })
    }
}

#[derive(Debug)]
pub struct BatchError {
    /// One entry per statement in submission order.
    pub outcomes: Vec<BatchOutcome>,
    pub cause: Box<Error>,
}

impl BatchError {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// commit/rollback called while autocommit is on
    AutocommitEnabled,
    /// Savepoint not found
    SavepointNotFound,
    /// Savepoint name failed validation
    InvalidSavepoint,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
    /// The connector failed to open a connection
    Connect,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, pool timeout, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock
                    | QueryErrorKind::Serialization
                    | QueryErrorKind::TransientConnection
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Timeout),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Authentication
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Ssl
                    | ConnectionErrorKind::DnsResolution
                    | ConnectionErrorKind::Refused
            ),
            Error::Protocol(_) | Error::Io(_) | Error::Timeout => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for a constraint violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Batch(b) => b.cause.sqlstate(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Batch(b) => b.cause.sql(),
            _ => None,
        }
    }

    /// Get the server's vendor error code, if available
    pub fn vendor_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => q.vendor_code,
            Error::Batch(b) => b.cause.vendor_code(),
            _ => None,
        }
    }

    pub fn query_kind(&self) -> Option<QueryErrorKind> {
        match self {
            Error::Query(q) => Some(q.kind),
            Error::Batch(b) => b.cause.query_kind(),
            _ => None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Kind of a pool failure, if this is one.
    pub fn pool_kind(&self) -> Option<PoolErrorKind> {
        match self {
            Error::Pool(p) => Some(p.kind),
            _ => None,
        }
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Is this a duplicate key violation (vendor code 1062)?
    pub fn is_duplicate_key(&self) -> bool {
        self.vendor_code == Some(1062)
    }

    /// Is this a foreign key violation (vendor codes 1451/1452)?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.vendor_code, Some(1451 | 1452))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Batch(e) => write!(f, "Batch error: {}", e),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Batch(e) => Some(e.cause.as_ref()),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.vendor_code, &self.sqlstate) {
            (Some(code), Some(state)) => write!(f, "{} ({}, SQLSTATE {})", self.message, code, state),
            (Some(code), None) => write!(f, "{} ({})", self.message, code),
            (None, Some(state)) => write!(f, "{} (SQLSTATE {})", self.message, state),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} statements succeeded: {}",
            self.succeeded(),
            self.outcomes.len(),
            self.cause
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        Error::Batch(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn query_error(sqlstate: &str, code: u16) -> QueryError {
        QueryError {
            kind: QueryErrorKind::from_sqlstate(Some(sqlstate), Some(code)),
            sql: Some("INSERT INTO t VALUES (?)".to_string()),
            params: vec![Value::Int(1)],
            sqlstate: Some(sqlstate.to_string()),
            vendor_code: Some(code),
            message: "boom".to_string(),
            detail: None,
            source: None,
        }
    }

    #[test]
    fn sqlstate_class_mapping() {
        let cases = [
            ("08S01", 2013, QueryErrorKind::TransientConnection),
            ("22003", 1264, QueryErrorKind::DataException),
            ("28000", 1045, QueryErrorKind::Authorization),
            ("23000", 1062, QueryErrorKind::Constraint),
            ("40001", 1213, QueryErrorKind::Deadlock),
            ("40001", 1205, QueryErrorKind::Serialization),
            ("42000", 1064, QueryErrorKind::Syntax),
            ("0A000", 1235, QueryErrorKind::NotSupported),
            ("HY000", 1105, QueryErrorKind::Database),
        ];
        for (state, code, expected) in cases {
            assert_eq!(
                QueryErrorKind::from_sqlstate(Some(state), Some(code)),
                expected,
                "{state}"
            );
        }
        assert_eq!(
            QueryErrorKind::from_sqlstate(None, Some(1064)),
            QueryErrorKind::Database
        );
    }

    #[test]
    fn sqlstate_helpers() {
        let query = query_error("23000", 1062);
        assert!(query.is_duplicate_key());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (?)"));
        assert_eq!(err.vendor_code(), Some(1062));
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Constraint));
        assert_eq!(err.to_string(), "Query error: boom (1062, SQLSTATE 23000)");
    }

    #[test]
    fn retryable_and_connection_flags() {
        assert!(Error::Query(query_error("40001", 1213)).is_retryable());
        assert!(!Error::Query(query_error("42000", 1064)).is_retryable());

        let pool_timeout = Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: "timed out".to_string(),
            source: None,
        });
        assert!(pool_timeout.is_retryable());

        let lost = Error::connection(ConnectionErrorKind::Disconnected, "lost connection");
        assert!(lost.is_connection_error());
        let closed = Error::connection(ConnectionErrorKind::Closed, "closed");
        assert!(!closed.is_connection_error());
    }

    #[test]
    fn batch_error_reports_outcomes() {
        let err = Error::Batch(BatchError {
            outcomes: vec![
                BatchOutcome::Success { affected_rows: 1 },
                BatchOutcome::Failed {
                    message: "dup".to_string(),
                },
                BatchOutcome::NotExecuted,
            ],
            cause: Box::new(Error::Query(query_error("23000", 1062))),
        });
        assert_eq!(err.sqlstate(), Some("23000"));
        let Error::Batch(batch) = &err else {
            unreachable!()
        };
        assert_eq!(batch.succeeded(), 1);
        assert!(err.to_string().starts_with("Batch error: 1 of 3 statements succeeded"));
    }
}
