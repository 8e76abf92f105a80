//! Server-side prepared statements (COM_STMT_PREPARE / COM_STMT_EXECUTE).

use std::sync::Arc;

use sqlwire_core::{BatchOutcome, Result, Value};

use super::{Params, Statement, UpdateResult, failed_outcomes};
use crate::connection::MySqlConnection;
use crate::error::{protocol_error, server_error, statement_error};
use crate::protocol::command;
use crate::protocol::{Command, ErrPacket, StmtPrepareOk, build_stmt_execute_packet};
use crate::resultset::{Response, ResultSet, RowFormat};
use crate::stream::Socket;
use crate::types::ColumnDefinition;

/// A statement prepared on one connection and executed over the binary
/// protocol.
///
/// The handle stays valid until [`close`](Statement::close), a session
/// reset, or the end of the owning connection.
#[derive(Debug, Clone)]
pub struct ServerPreparedStatement {
    sql: String,
    statement_id: u32,
    param_definitions: Arc<[ColumnDefinition]>,
    columns: Arc<[ColumnDefinition]>,
    owner: u64,
    params: Params,
    batch: Vec<Vec<Value>>,
    closed: bool,
}

impl ServerPreparedStatement {
    pub(crate) fn prepare<S: Socket>(conn: &mut MySqlConnection<S>, sql: &str) -> Result<Self> {
        conn.send_command(Command::StmtPrepare, &command::stmt_prepare(sql))?;
        let payload = conn.receive_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = ErrPacket::decode(&payload, conn.capabilities())?;
            return Err(server_error(&err, Some(sql), &[]));
        }
        let ok = StmtPrepareOk::decode(&payload)?;
        let param_definitions = if ok.num_params > 0 {
            conn.read_columns(usize::from(ok.num_params))?
        } else {
            Arc::from(Vec::<ColumnDefinition>::new())
        };
        let columns = if ok.num_columns > 0 {
            conn.read_columns(usize::from(ok.num_columns))?
        } else {
            Arc::from(Vec::<ColumnDefinition>::new())
        };
        conn.register_statement(ok.statement_id);
        tracing::debug!(
            statement_id = ok.statement_id,
            params = ok.num_params,
            columns = ok.num_columns,
            "statement prepared"
        );
        Ok(Self {
            sql: sql.to_string(),
            statement_id: ok.statement_id,
            param_definitions,
            columns,
            owner: conn.token(),
            params: Params::new(usize::from(ok.num_params)),
            batch: Vec::new(),
            closed: false,
        })
    }

    pub fn statement_id(&self) -> u32 {
        self.statement_id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.count()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Result columns as described at prepare time.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn param_definitions(&self) -> &[ColumnDefinition] {
        &self.param_definitions
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_usable<S: Socket>(&self, conn: &MySqlConnection<S>) -> Result<()> {
        if self.closed {
            return Err(statement_error(format!(
                "statement {} is closed",
                self.statement_id
            )));
        }
        if conn.token() != self.owner {
            return Err(statement_error(format!(
                "statement {} belongs to another connection",
                self.statement_id
            )));
        }
        if !conn.owns_statement(self.statement_id) {
            return Err(statement_error(format!(
                "statement {} was invalidated by a session reset",
                self.statement_id
            )));
        }
        Ok(())
    }

    fn run<S: Socket>(&self, conn: &mut MySqlConnection<S>, values: &[Value]) -> Result<Response> {
        let packet = build_stmt_execute_packet(self.statement_id, values)?;
        conn.send_command(Command::StmtExecute, &packet)?;
        let response = conn.read_response(RowFormat::Binary)?;
        conn.drain_results(&response, RowFormat::Binary)?;
        match response {
            Response::Err(err) => Err(server_error(&err, Some(&self.sql), values)),
            other => Ok(other),
        }
    }

    /// Discard any server-side state of the current execution (COM_STMT_RESET).
    pub fn reset<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<()> {
        self.check_usable(conn)?;
        conn.send_command(Command::StmtReset, &command::stmt_reset(self.statement_id))?;
        conn.read_generic(Some(&self.sql)).map(drop)
    }
}

impl Statement for ServerPreparedStatement {
    fn set_param(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        if self.closed {
            return Err(statement_error("statement is closed"));
        }
        self.params.set(index, value.into())
    }

    fn clear_params(&mut self) {
        self.params.clear();
    }

    fn execute_query<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<ResultSet> {
        self.check_usable(conn)?;
        let values = self.params.bound()?;
        match self.run(conn, &values)? {
            Response::ResultSet(rs) => Ok(rs),
            Response::Ok(ok) => Ok(ResultSet::empty(ok.status, ok.warnings)),
            Response::Err(_) => Err(protocol_error("unreachable ERR after statement execution")),
        }
    }

    fn execute_update<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<UpdateResult> {
        self.check_usable(conn)?;
        let values = self.params.bound()?;
        match self.run(conn, &values)? {
            Response::Ok(ok) => Ok(UpdateResult::from_ok(&ok)),
            Response::ResultSet(rs) => Ok(UpdateResult {
                warnings: rs.warnings(),
                ..UpdateResult::default()
            }),
            Response::Err(_) => Err(protocol_error("unreachable ERR after statement execution")),
        }
    }

    fn add_batch(&mut self) -> Result<()> {
        if self.closed {
            return Err(statement_error("statement is closed"));
        }
        self.batch.push(self.params.bound()?);
        Ok(())
    }

    fn execute_batch<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<Vec<BatchOutcome>> {
        self.check_usable(conn)?;
        let batch = std::mem::take(&mut self.batch);
        let total = batch.len();
        let mut outcomes = Vec::with_capacity(total);
        for values in &batch {
            match self.run(conn, values) {
                Ok(Response::Ok(ok)) => outcomes.push(BatchOutcome::Success {
                    affected_rows: ok.affected_rows,
                }),
                Ok(_) => outcomes.push(BatchOutcome::Success { affected_rows: 0 }),
                Err(err) => {
                    let outcomes = failed_outcomes(outcomes, total, err.to_string());
                    return Err(sqlwire_core::Error::Batch(sqlwire_core::BatchError {
                        outcomes,
                        cause: Box::new(err),
                    }));
                }
            }
        }
        Ok(outcomes)
    }

    /// Release the statement on the server. COM_STMT_CLOSE has no response.
    fn close<S: Socket>(&mut self, conn: &mut MySqlConnection<S>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.batch.clear();
        if conn.token() != self.owner || !conn.forget_statement(self.statement_id) {
            return Ok(());
        }
        tracing::debug!(statement_id = self.statement_id, "statement closed");
        if conn.is_usable() {
            conn.send_command(Command::StmtClose, &command::stmt_close(self.statement_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::connected;
    use crate::resultset::fixtures::{column_count, err, ok, ok_terminator};
    use crate::types::FieldType;
    use crate::types::fixtures::column_packet;
    use sqlwire_core::Error;

    const AUTOCOMMIT: u16 = 0x0002;

    fn prepare_ok(id: u32, columns: u16, params: u16) -> Vec<u8> {
        let mut p = vec![0x00];
        p.extend_from_slice(&id.to_le_bytes());
        p.extend_from_slice(&columns.to_le_bytes());
        p.extend_from_slice(&params.to_le_bytes());
        p.push(0);
        p.extend_from_slice(&0u16.to_le_bytes());
        p
    }

    /// Prepare `SELECT id, name FROM t WHERE id = ?` as statement 7.
    fn prepared() -> (
        MySqlConnection<crate::stream::testing::ScriptedStream>,
        crate::stream::testing::ScriptedStream,
        ServerPreparedStatement,
    ) {
        let (mut conn, stream) = connected();
        stream.push_packets(&[
            (1, prepare_ok(7, 2, 1)),
            (2, column_packet("?", FieldType::LongLong, 0, 63)),
            (3, column_packet("id", FieldType::LongLong, 0, 63)),
            (4, column_packet("name", FieldType::VarString, 0, 255)),
        ]);
        let stmt = conn.prepare("SELECT id, name FROM t WHERE id = ?").unwrap();
        stream.clear_written();
        (conn, stream, stmt)
    }

    #[test]
    fn prepare_reads_definitions() {
        let (conn, _stream, stmt) = prepared();
        assert_eq!(stmt.statement_id(), 7);
        assert_eq!(stmt.param_count(), 1);
        assert_eq!(stmt.column_count(), 2);
        assert_eq!(stmt.columns()[1].name, "name");
        assert!(conn.owns_statement(7));
    }

    #[test]
    fn execute_decodes_binary_rows() {
        let (mut conn, stream, mut stmt) = prepared();
        stmt.set_param(1, 5i64).unwrap();

        let mut row = vec![0x00, 0x00];
        row.extend_from_slice(&5i64.to_le_bytes());
        row.extend_from_slice(&[4, b'g', b'e', b'a', b'r']);
        stream.push_packets(&[
            (1, column_count(2)),
            (2, column_packet("id", FieldType::LongLong, 0, 63)),
            (3, column_packet("name", FieldType::VarString, 0, 255)),
            (4, row),
            (5, ok_terminator(AUTOCOMMIT)),
        ]);

        let rs = stmt.execute_query(&mut conn).unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.rows()[0].get_as::<i64>(0).unwrap(), 5);
        assert_eq!(rs.rows()[0].get_named::<String>("name").unwrap(), "gear");
        assert_eq!(
            stream.written_packets(),
            vec![(0, build_stmt_execute_packet(7, &[Value::BigInt(5)]).unwrap())]
        );
    }

    #[test]
    fn server_error_keeps_params() {
        let (mut conn, stream, mut stmt) = prepared();
        stmt.set_param(1, Value::Null).unwrap();
        stream.push_packets(&[(1, err(1048, "23000", "Column 'id' cannot be null"))]);
        let e = stmt.execute_query(&mut conn).unwrap_err();
        let Error::Query(q) = e else {
            panic!("expected query error");
        };
        assert_eq!(q.params, vec![Value::Null]);
        assert_eq!(q.kind, sqlwire_core::QueryErrorKind::Constraint);
        assert!(conn.is_usable());
    }

    #[test]
    fn close_sends_stmt_close_once() {
        let (mut conn, stream, mut stmt) = prepared();
        stmt.close(&mut conn).unwrap();
        stmt.close(&mut conn).unwrap();
        assert_eq!(stream.written_packets(), vec![(0, vec![0x19, 7, 0, 0, 0])]);
        assert!(!conn.owns_statement(7));
        assert!(stmt.set_param(1, 1).is_err());
        let e = stmt.execute_query(&mut conn).unwrap_err();
        assert!(e.to_string().contains("closed"));
    }

    #[test]
    fn rejects_foreign_connection() {
        let (_conn, _stream, mut stmt) = prepared();
        let (mut other, other_stream) = connected();
        stmt.set_param(1, 1i64).unwrap();
        let e = stmt.execute_query(&mut other).unwrap_err();
        assert!(e.to_string().contains("another connection"));
        assert!(other_stream.written().is_empty());
    }

    #[test]
    fn reset_session_invalidates_statement() {
        let (mut conn, stream, mut stmt) = prepared();
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        conn.reset_session().unwrap();
        stmt.set_param(1, 1i64).unwrap();
        let e = stmt.execute_update(&mut conn).unwrap_err();
        assert!(e.to_string().contains("invalidated"));
    }

    #[test]
    fn stmt_reset_expects_ok() {
        let (mut conn, stream, mut stmt) = prepared();
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        stmt.reset(&mut conn).unwrap();
        assert_eq!(stream.written_packets(), vec![(0, vec![0x1a, 7, 0, 0, 0])]);
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, prepare_ok(3, 0, 1)), (2, column_packet("?", FieldType::LongLong, 0, 63))]);
        let mut stmt = conn.prepare("DELETE FROM t WHERE id = ?").unwrap();
        for id in 1..=3i64 {
            stmt.set_param(1, id).unwrap();
            stmt.add_batch().unwrap();
        }
        stream.push_packets(&[(1, ok(1, 0, AUTOCOMMIT))]);
        stream.push_packets(&[(1, err(1451, "23000", "Cannot delete or update a parent row"))]);

        let e = stmt.execute_batch(&mut conn).unwrap_err();
        let Error::Batch(batch) = e else {
            panic!("expected batch error");
        };
        assert_eq!(batch.outcomes[0], BatchOutcome::Success { affected_rows: 1 });
        assert!(matches!(batch.outcomes[1], BatchOutcome::Failed { .. }));
        assert_eq!(batch.outcomes[2], BatchOutcome::NotExecuted);
        assert_eq!(batch.cause.vendor_code(), Some(1451));
    }
}
