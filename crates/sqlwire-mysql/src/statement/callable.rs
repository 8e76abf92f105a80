//! Stored-procedure calls with OUT and INOUT parameters.
//!
//! MySQL has no wire-level OUT parameters, so a call runs in three steps:
//!
//! 1. `SET @_sqlwire_<stmt>_<n> = ...` seeds one session variable per
//!    OUT/INOUT placeholder
//! 2. the `CALL` runs with those variables in place of the placeholders
//! 3. `SELECT @_sqlwire_<stmt>_<n>, ...` reads the variables back
//!
//! Parameter modes come from `information_schema.PARAMETERS`, looked up once
//! when the call is prepared.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use sqlwire_core::error::BatchError;
use sqlwire_core::{BatchOutcome, Error, FromValue, Result, Value};

use super::{Params, QueryResult, Statement, UpdateResult, failed_outcomes};
use crate::connection::MySqlConnection;
use crate::error::{server_error, statement_error};
use crate::metadata::ParameterMode;
use crate::resultset::ResultSet;
use crate::stream::Socket;
use crate::types::{interpolate_params, placeholder_positions};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a procedure call produced.
#[derive(Debug, Default)]
pub struct CallResult {
    /// Result sets in the order the procedure produced them.
    pub result_sets: Vec<ResultSet>,
    /// Counts from the final OK packet.
    pub update: UpdateResult,
}

/// One `?` in the argument list.
#[derive(Debug, Clone)]
struct Marker {
    mode: ParameterMode,
    /// Routine parameter name when the placeholder is a whole argument.
    name: Option<String>,
}

impl Marker {
    fn is_output(&self) -> bool {
        self.mode.is_output()
    }
}

/// A prepared `CALL`.
#[derive(Debug, Clone)]
pub struct CallableStatement {
    sql: String,
    call_id: u64,
    routine: String,
    args: Vec<String>,
    markers: Vec<Marker>,
    params: Params,
    batch: Vec<Vec<Option<Value>>>,
    out_values: Vec<Option<Value>>,
    executed: bool,
    closed: bool,
}

fn call_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?is)^\s*(\{\s*)?call\s+((?:`[^`]+`|[\w$]+)(?:\s*\.\s*(?:`[^`]+`|[\w$]+))?)\s*(?:\((.*)\))?\s*(\})?\s*;?\s*$",
            )
            .ok()
        })
        .as_ref()
}

/// `schema.name` / `name`, backticks removed.
fn split_routine_name(name: &str) -> (Option<String>, String) {
    let unquote = |s: &str| s.trim().trim_matches('`').to_string();
    match name.split_once('.') {
        Some((schema, routine)) if !name.starts_with('`') || schema.ends_with('`') => {
            (Some(unquote(schema)), unquote(routine))
        }
        _ => (None, unquote(name)),
    }
}

/// Split an argument list at top-level commas.
fn split_args(args: &str) -> Vec<String> {
    let bytes = args.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(args[start..i].trim().to_string());
                start = i + 1;
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
    let last = args[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last.to_string());
    }
    parts
}

impl CallableStatement {
    pub(crate) fn prepare<S: Socket>(conn: &mut MySqlConnection<S>, sql: &str) -> Result<Self> {
        let pattern = call_pattern().ok_or_else(|| statement_error("call pattern failed to compile"))?;
        let caps = pattern
            .captures(sql)
            .ok_or_else(|| statement_error(format!("not a procedure call: {sql}")))?;
        if caps.get(1).is_some() != caps.get(4).is_some() {
            return Err(statement_error("unbalanced braces in call escape"));
        }
        let routine = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let args = caps.get(3).map(|m| split_args(m.as_str())).unwrap_or_default();

        let (schema, name) = split_routine_name(&routine);
        let schema = schema
            .or_else(|| conn.schema().map(str::to_string))
            .ok_or_else(|| statement_error(format!("no schema selected for procedure '{name}'")))?;
        let parameters = conn.routine_parameters(&schema, &name)?;
        if parameters.len() != args.len() {
            return Err(statement_error(format!(
                "procedure '{schema}.{name}' takes {} argument(s), {} given",
                parameters.len(),
                args.len()
            )));
        }

        let mut markers = Vec::new();
        for (arg, parameter) in args.iter().zip(&parameters) {
            if arg == "?" {
                markers.push(Marker {
                    mode: parameter.mode,
                    name: Some(parameter.name.clone()),
                });
                continue;
            }
            if parameter.mode.is_output() && !arg.starts_with('@') {
                return Err(statement_error(format!(
                    "{:?} parameter '{}' must be a placeholder or a user variable",
                    parameter.mode, parameter.name
                )));
            }
            markers.extend(placeholder_positions(arg).into_iter().map(|_| Marker {
                mode: ParameterMode::In,
                name: None,
            }));
        }

        let call_id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(call_id, routine = %routine, placeholders = markers.len(), "call prepared");
        Ok(Self {
            sql: sql.to_string(),
            call_id,
            routine,
            params: Params::new(markers.len()),
            out_values: vec![None; markers.len()],
            args,
            markers,
            batch: Vec::new(),
            executed: false,
            closed: false,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.markers.len()
    }

    /// Mode of placeholder `index` (1-based).
    pub fn param_mode(&self, index: usize) -> Option<ParameterMode> {
        self.markers.get(index.checked_sub(1)?).map(|m| m.mode)
    }

    fn variable(&self, index: usize) -> String {
        format!("@_sqlwire_{}_{}", self.call_id, index)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(statement_error("statement is closed"))
        } else {
            Ok(())
        }
    }

    /// Values for every placeholder; OUT-only slots may stay unbound.
    fn snapshot(&self) -> Result<Vec<Option<Value>>> {
        self.markers
            .iter()
            .enumerate()
            .map(|(i, marker)| match (self.params.get(i + 1), marker.mode) {
                (Some(value), _) => Ok(Some(value.clone())),
                (None, ParameterMode::Out) => Ok(None),
                (None, _) => Err(statement_error(format!("parameter {} is not set", i + 1))),
            })
            .collect()
    }

    /// Run the call with one set of bound values.
    pub fn call<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<CallResult> {
        self.ensure_open()?;
        let values = self.snapshot()?;
        self.run(conn, &values)
    }

    fn run<S: Socket>(&mut self, conn: &mut MySqlConnection<S>, values: &[Option<Value>]) -> Result<CallResult> {
        let outputs: Vec<usize> = (1..=self.markers.len())
            .filter(|&i| self.markers[i - 1].is_output())
            .collect();

        if !outputs.is_empty() {
            let mut assignments = Vec::with_capacity(outputs.len());
            let mut seeds = Vec::new();
            for &i in &outputs {
                match &values[i - 1] {
                    Some(value) => {
                        assignments.push(format!("{} = ?", self.variable(i)));
                        seeds.push(value.clone());
                    }
                    None => assignments.push(format!("{} = NULL", self.variable(i))),
                }
            }
            conn.execute(&format!("SET {}", assignments.join(", ")), &seeds)?;
        }

        let (call_sql, inputs) = self.render_call(values);
        let text = interpolate_params(&call_sql, &inputs)?;
        let (results, err) = conn.run_multi_results(&text)?;
        if let Some(err) = err {
            return Err(server_error(&err, Some(&self.sql), &inputs));
        }
        let mut outcome = CallResult::default();
        for result in results {
            match result {
                QueryResult::Rows(rs) => outcome.result_sets.push(rs),
                QueryResult::Update(update) => outcome.update = update,
            }
        }

        self.out_values = vec![None; self.markers.len()];
        if !outputs.is_empty() {
            let select = outputs
                .iter()
                .map(|&i| self.variable(i))
                .collect::<Vec<_>>()
                .join(", ");
            let row = conn
                .query_one(&format!("SELECT {select}"), &[])?
                .ok_or_else(|| statement_error("reading OUT parameters returned no row"))?;
            for (slot, value) in outputs.iter().zip(row.into_values()) {
                self.out_values[slot - 1] = Some(value);
            }
        }
        self.executed = true;
        tracing::debug!(
            call_id = self.call_id,
            result_sets = outcome.result_sets.len(),
            outputs = outputs.len(),
            "call executed"
        );
        Ok(outcome)
    }

    /// CALL text with output placeholders replaced by variables, plus the
    /// values for the placeholders that remain.
    fn render_call(&self, values: &[Option<Value>]) -> (String, Vec<Value>) {
        let mut index = 0;
        let mut inputs = Vec::new();
        let mut rendered = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if arg == "?" {
                index += 1;
                if self.markers[index - 1].is_output() {
                    rendered.push(self.variable(index));
                } else {
                    inputs.push(values[index - 1].clone().unwrap_or(Value::Null));
                    rendered.push(arg.clone());
                }
                continue;
            }
            for _ in placeholder_positions(arg) {
                index += 1;
                inputs.push(values[index - 1].clone().unwrap_or(Value::Null));
            }
            rendered.push(arg.clone());
        }
        (format!("CALL {}({})", self.routine, rendered.join(", ")), inputs)
    }

    fn output_index(&self, index: usize) -> Result<usize> {
        let marker = index
            .checked_sub(1)
            .and_then(|i| self.markers.get(i))
            .ok_or_else(|| statement_error(format!("parameter index {index} out of range")))?;
        if !marker.is_output() {
            return Err(statement_error(format!("parameter {index} is not an OUT parameter")));
        }
        if !self.executed {
            return Err(statement_error("statement has not been executed"));
        }
        Ok(index)
    }

    /// Value of OUT/INOUT placeholder `index` (1-based) after the last call.
    pub fn out_value(&self, index: usize) -> Result<&Value> {
        let index = self.output_index(index)?;
        self.out_values[index - 1]
            .as_ref()
            .ok_or_else(|| statement_error(format!("parameter {index} has no value")))
    }

    pub fn out_value_by_name(&self, name: &str) -> Result<&Value> {
        let index = self
            .markers
            .iter()
            .position(|m| m.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .ok_or_else(|| statement_error(format!("no parameter named '{name}'")))?;
        self.out_value(index + 1)
    }

    pub fn out_as<T: FromValue>(&self, index: usize) -> Result<T> {
        T::from_value(self.out_value(index)?)
    }

    pub fn out_as_named<T: FromValue>(&self, name: &str) -> Result<T> {
        T::from_value(self.out_value_by_name(name)?)
    }
}

impl Statement for CallableStatement {
    fn set_param(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.ensure_open()?;
        self.params.set(index, value.into())
    }

    fn clear_params(&mut self) {
        self.params.clear();
    }

    /// First result set the procedure produced, or an empty one.
    fn execute_query<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<ResultSet> {
        let outcome = self.call(conn)?;
        Ok(outcome
            .result_sets
            .into_iter()
            .next()
            .unwrap_or_else(|| ResultSet::empty(Default::default(), 0)))
    }

    fn execute_update<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<UpdateResult> {
        self.call(conn).map(|outcome| outcome.update)
    }

    fn add_batch(&mut self) -> Result<()> {
        self.ensure_open()?;
        let values = self.snapshot()?;
        self.batch.push(values);
        Ok(())
    }

    /// Run each call in turn; OUT values reflect the last successful call.
    fn execute_batch<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<Vec<BatchOutcome>> {
        self.ensure_open()?;
        let batch = std::mem::take(&mut self.batch);
        let total = batch.len();
        let mut outcomes = Vec::with_capacity(total);
        for values in &batch {
            match self.run(conn, values) {
                Ok(outcome) => outcomes.push(BatchOutcome::Success {
                    affected_rows: outcome.update.affected_rows,
                }),
                Err(err) => {
                    return Err(Error::Batch(BatchError {
                        outcomes: failed_outcomes(outcomes, total, err.to_string()),
                        cause: Box::new(err),
                    }));
                }
            }
        }
        Ok(outcomes)
    }

    fn close<S: Socket>(&mut self, _conn: &mut MySqlConnection<S>) -> Result<()> {
        self.closed = true;
        self.batch.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::connected;
    use crate::resultset::fixtures::{err, ok, text_result};
    use crate::stream::testing::ScriptedStream;
    use crate::types::FieldType;

    const AUTOCOMMIT: u16 = 0x0002;
    const MORE: u16 = 0x0008;

    fn parameter_rows(rows: &[(&str, &str, &str, &str)]) -> Vec<(u8, Vec<u8>)> {
        let rows: Vec<Vec<Option<&str>>> = rows
            .iter()
            .map(|(o, n, m, t)| vec![Some(*o), Some(*n), Some(*m), Some(*t)])
            .collect();
        text_result(
            1,
            &[
                ("ORDINAL_POSITION", FieldType::LongLong),
                ("PARAMETER_NAME", FieldType::VarString),
                ("PARAMETER_MODE", FieldType::VarString),
                ("DATA_TYPE", FieldType::VarString),
            ],
            &rows,
            AUTOCOMMIT,
        )
    }

    fn prepare_add_item() -> (
        MySqlConnection<ScriptedStream>,
        ScriptedStream,
        CallableStatement,
    ) {
        let (mut conn, stream) = connected();
        stream.push_packets(&parameter_rows(&[
            ("1", "item", "IN", "varchar"),
            ("2", "qty", "INOUT", "int"),
            ("3", "total", "OUT", "int"),
        ]));
        let stmt = conn.prepare_call("{call shop.add_item(?, ?, ?)}").unwrap();
        stream.clear_written();
        (conn, stream, stmt)
    }

    #[test]
    fn parses_call_syntax() {
        assert_eq!(split_args("?, 'a,b', f(1, 2)"), vec!["?", "'a,b'", "f(1, 2)"]);
        assert!(split_args("  ").is_empty());
        assert_eq!(
            split_routine_name("`shop`.`add_item`"),
            (Some("shop".into()), "add_item".into())
        );
        assert_eq!(split_routine_name("cleanup"), (None, "cleanup".into()));
        let pattern = call_pattern().unwrap();
        assert!(pattern.is_match("CALL p()"));
        assert!(pattern.is_match("{ call db.p(?, ?) }"));
        assert!(!pattern.is_match("SELECT p(1)"));
    }

    #[test]
    fn prepare_resolves_modes() {
        let (_conn, stream, stmt) = prepare_add_item();
        assert_eq!(stmt.param_count(), 3);
        assert_eq!(stmt.param_mode(1), Some(ParameterMode::In));
        assert_eq!(stmt.param_mode(2), Some(ParameterMode::InOut));
        assert_eq!(stmt.param_mode(3), Some(ParameterMode::Out));
        assert!(stream.written().is_empty());
    }

    #[test]
    fn call_round_trips_out_parameters() {
        let (mut conn, stream, mut stmt) = prepare_add_item();
        stmt.set_param(1, "gear").unwrap();
        stmt.set_param(2, 2i32).unwrap();
        assert!(stmt.out_value(3).is_err());

        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        let mut call = text_result(
            1,
            &[("item", FieldType::VarString)],
            &[vec![Some("gear")]],
            AUTOCOMMIT | MORE,
        );
        call.push((5, ok(1, 0, AUTOCOMMIT)));
        stream.push_packets(&call);
        stream.push_packets(&text_result(
            1,
            &[("a", FieldType::LongLong), ("b", FieldType::LongLong)],
            &[vec![Some("3"), Some("30")]],
            AUTOCOMMIT,
        ));

        let outcome = stmt.call(&mut conn).unwrap();
        assert_eq!(outcome.result_sets.len(), 1);
        assert_eq!(outcome.update.affected_rows, 1);
        assert_eq!(stmt.out_as::<i64>(2).unwrap(), 3);
        assert_eq!(stmt.out_as_named::<i64>("TOTAL").unwrap(), 30);
        assert!(stmt.out_value(1).is_err());

        let sent: Vec<String> = stream
            .written_packets()
            .into_iter()
            .map(|(_, p)| String::from_utf8_lossy(&p[1..]).into_owned())
            .collect();
        let (qty, total) = (stmt.variable(2), stmt.variable(3));
        assert_eq!(
            sent,
            vec![
                format!("SET {qty} = 2, {total} = NULL"),
                format!("CALL shop.add_item('gear', {qty}, {total})"),
                format!("SELECT {qty}, {total}"),
            ]
        );
    }

    #[test]
    fn bound_out_parameter_seeds_its_variable() {
        let (mut conn, stream, mut stmt) = prepare_add_item();
        stmt.set_param(1, "gear").unwrap();
        stmt.set_param(2, 2i32).unwrap();
        stmt.set_param(3, 99i32).unwrap();

        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        stream.push_packets(&[(1, ok(1, 0, AUTOCOMMIT))]);
        stream.push_packets(&text_result(
            1,
            &[("a", FieldType::LongLong), ("b", FieldType::LongLong)],
            &[vec![Some("3"), Some("30")]],
            AUTOCOMMIT,
        ));
        stmt.call(&mut conn).unwrap();

        let first = stream.written_packets().remove(0).1;
        let (qty, total) = (stmt.variable(2), stmt.variable(3));
        assert_eq!(
            String::from_utf8_lossy(&first[1..]),
            format!("SET {qty} = 2, {total} = 99")
        );
    }

    #[test]
    fn call_error_reports_procedure_sql() {
        let (mut conn, stream, mut stmt) = prepare_add_item();
        stmt.set_param(1, "gear").unwrap();
        stmt.set_param(2, 1i32).unwrap();
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        stream.push_packets(&[(1, err(1644, "45000", "out of stock"))]);
        let e = stmt.call(&mut conn).unwrap_err();
        assert_eq!(e.sql(), Some("{call shop.add_item(?, ?, ?)}"));
        assert_eq!(e.vendor_code(), Some(1644));
        assert!(conn.is_usable());
    }

    #[test]
    fn argument_count_must_match() {
        let (mut conn, stream) = connected();
        stream.push_packets(&parameter_rows(&[("1", "id", "IN", "int")]));
        let e = conn.prepare_call("CALL shop.remove(?, ?)").unwrap_err();
        assert!(e.to_string().contains("takes 1 argument(s), 2 given"));
    }

    #[test]
    fn unbound_inout_is_rejected() {
        let (mut conn, stream, mut stmt) = prepare_add_item();
        stmt.set_param(1, "gear").unwrap();
        let e = stmt.call(&mut conn).unwrap_err();
        assert!(e.to_string().contains("parameter 2 is not set"));
        assert!(stream.written().is_empty());
    }
}
