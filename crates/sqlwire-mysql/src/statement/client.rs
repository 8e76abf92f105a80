//! Client-side prepared statements.
//!
//! Placeholders are found once at prepare time; each execution substitutes
//! escaped literals and sends plain COM_QUERY text.
//!
//! Batches take one of two paths:
//!
//! - a plain `INSERT ... VALUES (...)` becomes one multi-row INSERT per
//!   packet-sized chunk
//! - anything else is sent as `;`-joined statements with multi-statements
//!   switched on for the duration of the batch

use std::sync::OnceLock;

use regex::Regex;
use sqlwire_core::error::BatchError;
use sqlwire_core::{BatchOutcome, Error, Result, Value};

use super::{Params, QueryResult, Statement, UpdateResult, failed_outcomes};
use crate::connection::MySqlConnection;
use crate::error::statement_error;
use crate::resultset::ResultSet;
use crate::stream::Socket;
use crate::types::{interpolate_params, placeholder_positions};

/// A statement whose parameters are interpolated before sending.
#[derive(Debug, Clone)]
pub struct ClientPreparedStatement {
    sql: String,
    placeholders: Vec<usize>,
    params: Params,
    batch: Vec<Vec<Value>>,
    closed: bool,
}

impl ClientPreparedStatement {
    pub(crate) fn new(sql: &str) -> Self {
        let placeholders = placeholder_positions(sql);
        tracing::debug!(placeholders = placeholders.len(), "client statement prepared");
        Self {
            sql: sql.to_string(),
            params: Params::new(placeholders.len()),
            placeholders,
            batch: Vec::new(),
            closed: false,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.count()
    }

    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// The SQL text that would be sent with the current parameters.
    pub fn render(&self) -> Result<String> {
        interpolate_params(&self.sql, &self.params.bound()?)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(statement_error("statement is closed"))
        } else {
            Ok(())
        }
    }

    fn run_rewritten<S: Socket>(
        &self,
        conn: &mut MySqlConnection<S>,
        insert: &InsertRewrite<'_>,
        batch: &[Vec<Value>],
    ) -> Result<Vec<BatchOutcome>> {
        let mut tuples = Vec::with_capacity(batch.len());
        for values in batch {
            tuples.push(interpolate_params(insert.tuple, values)?);
        }
        let limit = packet_limit(conn);
        let mut outcomes = Vec::with_capacity(batch.len());
        for chunk in chunk_by_size(&tuples, insert.prefix.len(), 1, limit) {
            let sql = format!("{}{}", insert.prefix, chunk.join(","));
            tracing::debug!(rows = chunk.len(), len = sql.len(), "rewritten batch insert");
            match conn.execute(&sql, &[]) {
                Ok(_) => outcomes.extend(
                    std::iter::repeat_n(BatchOutcome::Success { affected_rows: 1 }, chunk.len()),
                ),
                Err(err) => {
                    // The whole chunk is one statement: it fails as a unit.
                    let failed = BatchOutcome::Failed {
                        message: err.to_string(),
                    };
                    outcomes.extend(std::iter::repeat_n(failed, chunk.len()));
                    outcomes.resize(batch.len(), BatchOutcome::NotExecuted);
                    return Err(batch_error(outcomes, err));
                }
            }
        }
        Ok(outcomes)
    }

    fn run_multi<S: Socket>(
        &self,
        conn: &mut MySqlConnection<S>,
        batch: &[Vec<Value>],
    ) -> Result<Vec<BatchOutcome>> {
        let mut statements = Vec::with_capacity(batch.len());
        for values in batch {
            let statement = interpolate_params(&self.sql, values)?;
            statements.push(statement.trim_end().trim_end_matches(';').to_string());
        }
        let limit = packet_limit(conn);
        let total = statements.len();
        let sql = &self.sql;

        conn.with_multi_statements(|conn| {
            let mut outcomes = Vec::with_capacity(total);
            for chunk in chunk_by_size(&statements, 0, 1, limit) {
                let text = chunk.join(";");
                tracing::debug!(statements = chunk.len(), len = text.len(), "multi-statement batch");
                let (results, err) = match conn.run_multi_results(&text) {
                    Ok(pair) => pair,
                    Err(err) => {
                        let outcomes = failed_outcomes(outcomes, total, err.to_string());
                        return Err(batch_error(outcomes, err));
                    }
                };
                outcomes.extend(results.into_iter().map(BatchOutcome::from));
                if let Some(err) = err {
                    let cause = crate::error::server_error(&err, Some(sql), &[]);
                    let outcomes = failed_outcomes(outcomes, total, err.error_message);
                    return Err(batch_error(outcomes, cause));
                }
            }
            Ok(outcomes)
        })
    }
}

impl Statement for ClientPreparedStatement {
    fn set_param(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.ensure_open()?;
        self.params.set(index, value.into())
    }

    fn clear_params(&mut self) {
        self.params.clear();
    }

    fn execute_query<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<ResultSet> {
        self.ensure_open()?;
        let values = self.params.bound()?;
        conn.query(&self.sql, &values)
    }

    fn execute_update<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<UpdateResult> {
        self.ensure_open()?;
        let values = self.params.bound()?;
        conn.execute(&self.sql, &values)
    }

    fn add_batch(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.batch.push(self.params.bound()?);
        Ok(())
    }

    fn execute_batch<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<Vec<BatchOutcome>> {
        self.ensure_open()?;
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        match InsertRewrite::parse(&self.sql, &self.placeholders) {
            Some(insert) => self.run_rewritten(conn, &insert, &batch),
            None => self.run_multi(conn, &batch),
        }
    }

    fn close<S: Socket>(&mut self, _conn: &mut MySqlConnection<S>) -> Result<()> {
        self.closed = true;
        self.batch.clear();
        self.params.clear();
        Ok(())
    }
}

impl From<QueryResult> for BatchOutcome {
    fn from(result: QueryResult) -> Self {
        BatchOutcome::Success {
            affected_rows: result.affected_rows(),
        }
    }
}

fn batch_error(outcomes: Vec<BatchOutcome>, cause: Error) -> Error {
    Error::Batch(BatchError {
        outcomes,
        cause: Box::new(cause),
    })
}

fn packet_limit<S: Socket>(conn: &MySqlConnection<S>) -> usize {
    // one byte for the command
    (conn.config().max_packet_size as usize).saturating_sub(1).max(1)
}

/// Group `parts` so that `base + sum(len) + separators` stays under
/// `limit`. A single oversized part still gets its own chunk.
fn chunk_by_size(parts: &[String], base: usize, separator: usize, limit: usize) -> Vec<&[String]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = base;
    for (i, part) in parts.iter().enumerate() {
        let added = part.len() + if i > start { separator } else { 0 };
        if i > start && size + added > limit {
            chunks.push(&parts[start..i]);
            start = i;
            size = base + part.len();
        } else {
            size += added;
        }
    }
    if start < parts.len() {
        chunks.push(&parts[start..]);
    }
    chunks
}

fn insert_prefix() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?is)^\s*INSERT\s+(?:(?:LOW_PRIORITY|HIGH_PRIORITY|DELAYED)\s+)?(?:INTO\s+)?[^;]*?\bVALUES?\s*\(",
            )
            .ok()
        })
        .as_ref()
}

/// A single-row `INSERT ... VALUES (...)` split into the shared prefix and
/// the row tuple.
#[derive(Debug, PartialEq, Eq)]
struct InsertRewrite<'a> {
    prefix: &'a str,
    tuple: &'a str,
}

impl<'a> InsertRewrite<'a> {
    /// `None` for anything that cannot be safely merged: `INSERT IGNORE`,
    /// `ON DUPLICATE KEY UPDATE`, `INSERT ... SELECT`, multiple tuples, or
    /// placeholders outside the tuple.
    fn parse(sql: &'a str, placeholders: &[usize]) -> Option<Self> {
        let found = insert_prefix()?.find(sql)?;
        let open = found.end() - 1;
        if sql[..open]
            .split_whitespace()
            .take(4)
            .any(|word| word.eq_ignore_ascii_case("IGNORE"))
        {
            return None;
        }
        let body = sql[open..].trim_end().trim_end_matches(';').trim_end();
        let close = open + matching_paren(body)?;
        if close + 1 != open + body.len() {
            return None;
        }
        if placeholders.iter().any(|&p| p < open) {
            return None;
        }
        Some(Self {
            prefix: &sql[..open],
            tuple: &sql[open..=close],
        })
    }
}

/// Offset of the parenthesis closing the one at the start of `s`.
fn matching_paren(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}
