//! Statement executors.
//!
//! Three flavours share the [`Statement`] interface:
//!
//! - [`ClientPreparedStatement`]: `?` placeholders are replaced by escaped
//!   literals and the result travels over the text protocol
//! - [`ServerPreparedStatement`]: COM_STMT_PREPARE / COM_STMT_EXECUTE with
//!   binary parameters and rows
//! - [`CallableStatement`]: stored-procedure calls with OUT/INOUT parameters
//!
//! Statements are handles. The connection is passed to each execution, so
//! the exclusive borrow guarantees one command in flight.

use std::collections::BTreeMap;

use sqlwire_core::{BatchOutcome, Result, Value};

use crate::connection::MySqlConnection;
use crate::error::statement_error;
use crate::protocol::OkPacket;
use crate::resultset::ResultSet;
use crate::stream::Socket;

pub mod callable;
pub mod client;
pub mod server;

pub use callable::{CallResult, CallableStatement};
pub use client::ClientPreparedStatement;
pub use server::ServerPreparedStatement;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
}

impl UpdateResult {
    pub(crate) fn from_ok(ok: &OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
        }
    }
}

/// One result of a multi-result response.
#[derive(Debug)]
pub enum QueryResult {
    Rows(ResultSet),
    Update(UpdateResult),
}

impl QueryResult {
    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Update(_) => None,
        }
    }

    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryResult::Rows(_) => 0,
            QueryResult::Update(u) => u.affected_rows,
        }
    }
}

/// Operations common to all statement kinds.
pub trait Statement {
    /// Bind a parameter; indexes are 1-based.
    fn set_param(&mut self, index: usize, value: impl Into<Value>) -> Result<()>;

    fn clear_params(&mut self);

    fn execute_query<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<ResultSet>;

    fn execute_update<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<UpdateResult>;

    /// Snapshot the current parameters as one batch entry.
    fn add_batch(&mut self) -> Result<()>;

    /// Run every batch entry. On failure the error is `Error::Batch`,
    /// carrying one outcome per entry.
    fn execute_batch<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<Vec<BatchOutcome>>;

    fn close<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<()>;
}

/// Sparse 1-based parameter bindings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Params {
    values: BTreeMap<usize, Value>,
    count: usize,
}

impl Params {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            values: BTreeMap::new(),
            count,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn set(&mut self, index: usize, value: Value) -> Result<()> {
        if index == 0 || index > self.count {
            return Err(statement_error(format!(
                "parameter index {index} out of range 1..={}",
                self.count
            )));
        }
        self.values.insert(index, value);
        Ok(())
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(&index)
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }

    /// All values in order; every index must be bound.
    pub(crate) fn bound(&self) -> Result<Vec<Value>> {
        (1..=self.count)
            .map(|i| {
                self.values
                    .get(&i)
                    .cloned()
                    .ok_or_else(|| statement_error(format!("parameter {i} is not set")))
            })
            .collect()
    }
}

/// Outcomes for a batch that stopped at entry `failed`.
pub(crate) fn failed_outcomes(
    mut done: Vec<BatchOutcome>,
    total: usize,
    message: String,
) -> Vec<BatchOutcome> {
    done.push(BatchOutcome::Failed { message });
    done.resize(total.max(done.len()), BatchOutcome::NotExecuted);
    done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_one_based_and_complete() {
        let mut params = Params::new(2);
        assert!(params.set(0, Value::Int(1)).is_err());
        assert!(params.set(3, Value::Int(1)).is_err());
        params.set(2, Value::Text("b".into())).unwrap();
        let err = params.bound().unwrap_err();
        assert!(err.to_string().contains("parameter 1 is not set"));
        params.set(1, Value::Null).unwrap();
        assert_eq!(params.bound().unwrap(), vec![Value::Null, Value::Text("b".into())]);
        params.clear();
        assert!(params.get(2).is_none());
    }

    #[test]
    fn failed_outcomes_pad_with_not_executed() {
        let outcomes = failed_outcomes(
            vec![BatchOutcome::Success { affected_rows: 1 }],
            4,
            "boom".into(),
        );
        assert_eq!(
            outcomes,
            vec![
                BatchOutcome::Success { affected_rows: 1 },
                BatchOutcome::Failed {
                    message: "boom".into()
                },
                BatchOutcome::NotExecuted,
                BatchOutcome::NotExecuted,
            ]
        );
    }
}
