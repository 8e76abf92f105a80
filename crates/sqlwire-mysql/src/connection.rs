//! MySQL connection.
//!
//! A [`MySqlConnection`] is created by a completed handshake and then runs
//! one command at a time:
//!
//! 1. fail fast if the connection is closed or broken
//! 2. reset the sequence counter and send the command
//! 3. read and interpret the response
//! 4. pick up autocommit, status flags and schema changes
//!
//! I/O failures, timeouts and protocol violations leave the stream in an
//! unknown state, so they mark the connection broken. A server ERR does
//! not: the connection stays usable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlwire_core::error::{ConnectionErrorKind, TransactionErrorKind};
use sqlwire_core::{Error, IsolationLevel, Result, Row, Value};

use crate::auth::AuthPlugin;
use crate::config::MySqlConfig;
use crate::error::{closed_error, protocol_error, server_error};
use crate::handshake::{Authenticator, Handshake};
use crate::metadata::ConnectionMetadata;
use crate::protocol::command::{self, ChangeUser, SetOption};
use crate::protocol::{
    CapabilityFlags, Command, ErrPacket, GenericResponse, InitialHandshake, OkPacket, ServerVersion,
    StatusFlags,
};
use crate::resultset::{Response, ResultSet, RowFormat};
use crate::statement::{
    CallableStatement, ClientPreparedStatement, QueryResult, ServerPreparedStatement, UpdateResult,
};
use crate::stream::{MySqlStream, Socket};
use crate::transport::PacketTransport;
use crate::types::{ColumnDefinition, interpolate_params};

static NEXT_CONNECTION_TOKEN: AtomicU64 = AtomicU64::new(1);

/// MySQL error raised for an unknown savepoint.
const ER_SP_DOES_NOT_EXIST: u16 = 1305;

/// Lifecycle of a connection after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    /// Transport failed; the connection must be discarded.
    Broken,
    Closed,
}

/// A blocking MySQL connection over any [`Socket`].
pub struct MySqlConnection<S: Socket = MySqlStream> {
    transport: PacketTransport<S>,
    config: MySqlConfig,
    server: InitialHandshake,
    capabilities: CapabilityFlags,
    status: StatusFlags,
    state: ConnectionState,
    autocommit: bool,
    schema: Option<String>,
    tls: bool,
    plugin: AuthPlugin,
    token: u64,
    statements: Vec<u32>,
    multi_statements: bool,
    last_ok: OkPacket,
}

impl<S: Socket> std::fmt::Debug for MySqlConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.server.connection_id)
            .field("server_version", &self.server.server_version_raw)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("schema", &self.schema)
            .field("autocommit", &self.autocommit)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<MySqlStream> {
    /// Open a TCP connection and run the handshake.
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        let stream = MySqlStream::connect(&config)?;
        Self::handshake(stream, config)
    }
}

impl<S: Socket> MySqlConnection<S> {
    /// Run the handshake over an already connected stream.
    pub fn handshake(stream: S, config: MySqlConfig) -> Result<Self> {
        let established = Handshake::new(&config).run(stream)?;
        let mut conn = Self {
            transport: established.transport,
            server: established.server,
            capabilities: established.capabilities,
            status: established.status,
            state: ConnectionState::Ready,
            autocommit: established.status.contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT),
            schema: None,
            tls: established.tls,
            plugin: established.plugin,
            token: NEXT_CONNECTION_TOKEN.fetch_add(1, Ordering::Relaxed),
            statements: Vec::new(),
            multi_statements: false,
            last_ok: OkPacket::default(),
            config,
        };
        if let Some(database) = conn.config.database.clone() {
            if conn.capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                conn.schema = Some(database);
            } else {
                conn.set_schema(&database)?;
            }
        }
        tracing::debug!(
            connection_id = conn.server.connection_id,
            server_version = %conn.server.server_version_raw,
            schema = ?conn.schema,
            "connection ready"
        );
        Ok(conn)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `true` while the connection can run commands.
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Ready && !self.transport.is_broken()
    }

    pub fn connection_id(&self) -> u32 {
        self.server.connection_id
    }

    pub fn server_version(&self) -> ServerVersion {
        self.server.server_version
    }

    pub fn server_version_string(&self) -> &str {
        &self.server.server_version_raw
    }

    pub fn is_mariadb(&self) -> bool {
        self.server.is_mariadb()
    }

    /// Capabilities negotiated during the handshake.
    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn status(&self) -> StatusFlags {
        self.status
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn in_transaction(&self) -> bool {
        self.status.contains(StatusFlags::SERVER_STATUS_IN_TRANS)
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// The last OK packet (affected rows, insert id, warnings, info).
    pub fn last_ok(&self) -> &OkPacket {
        &self.last_ok
    }

    pub fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata {
            connection_id: self.server.connection_id,
            server_version: self.server.server_version_raw.clone(),
            is_mariadb: self.server.is_mariadb(),
            capabilities: self.capabilities.names().collect(),
            charset: self.config.charset,
            user: self.config.user.clone(),
            schema: self.schema.clone(),
            tls: self.tls,
            auth_plugin: self.plugin.name(),
            autocommit: self.autocommit,
        }
    }

    // ---------------------------------------------------------------------
    // Command cycle
    // ---------------------------------------------------------------------

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ConnectionState::Ready if !self.transport.is_broken() => Ok(()),
            ConnectionState::Closed => Err(closed_error()),
            _ => Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is broken and must be discarded",
            )),
        }
    }

    /// Record fatal failures in the lifecycle before handing them back.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            let fatal = self.transport.is_broken()
                || matches!(err, Error::Protocol(_) | Error::Timeout | Error::Io(_));
            if fatal && self.state == ConnectionState::Ready {
                tracing::debug!(
                    connection_id = self.server.connection_id,
                    error = %err,
                    "connection marked broken"
                );
                self.transport.mark_broken();
                self.state = ConnectionState::Broken;
            }
        }
        result
    }

    /// Start a command exchange.
    pub(crate) fn send_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        tracing::debug!(command = command.name(), len = payload.len(), "send command");
        self.transport.reset_sequence_id();
        let result = self.transport.send(payload);
        self.track(result)
    }

    /// Read one response of the current exchange.
    pub(crate) fn read_response(&mut self, format: RowFormat) -> Result<Response> {
        let result = crate::resultset::read_response(&mut self.transport, self.capabilities, format);
        let response = self.track(result)?;
        match &response {
            Response::Ok(ok) => self.apply_ok(ok),
            Response::ResultSet(rs) => self.apply_status(rs.status()),
            Response::Err(_) => {}
        }
        Ok(response)
    }

    /// Read the rest of a multi-result stream after `first`.
    ///
    /// Stops at the first ERR, which MySQL never follows with more results.
    pub(crate) fn read_results(
        &mut self,
        first: Response,
        format: RowFormat,
    ) -> Result<(Vec<QueryResult>, Option<ErrPacket>)> {
        let mut results = Vec::new();
        let mut response = first;
        loop {
            let more = response.more_results();
            match response {
                Response::Ok(ok) => results.push(QueryResult::Update(UpdateResult::from_ok(&ok))),
                Response::ResultSet(rs) => results.push(QueryResult::Rows(rs)),
                Response::Err(err) => return Ok((results, Some(err))),
            }
            if !more {
                return Ok((results, None));
            }
            response = self.read_response(format)?;
        }
    }

    /// Consume any further results so the next command starts clean.
    pub(crate) fn drain_results(&mut self, first: &Response, format: RowFormat) -> Result<()> {
        let mut more = first.more_results();
        while more {
            let response = self.read_response(format)?;
            more = response.more_results();
            if let Response::Err(err) = response {
                tracing::debug!(code = err.error_code, "error in trailing result discarded");
                break;
            }
        }
        Ok(())
    }

    /// Read one raw packet of the current exchange.
    pub(crate) fn receive_packet(&mut self) -> Result<Vec<u8>> {
        let result = self.transport.receive();
        self.track(result)
    }

    /// Read `count` column definitions (and the EOF that follows them on
    /// servers without DEPRECATE_EOF).
    pub(crate) fn read_columns(&mut self, count: usize) -> Result<Arc<[ColumnDefinition]>> {
        let result = crate::resultset::read_column_definitions(&mut self.transport, count, self.capabilities);
        self.track(result)
    }

    /// Read a bare OK/ERR(/EOF) answer.
    pub(crate) fn read_generic(&mut self, sql: Option<&str>) -> Result<OkPacket> {
        let caps = self.capabilities;
        let result = self.transport.receive_with(|p| GenericResponse::decode(p, caps));
        match self.track(result)? {
            GenericResponse::Ok(ok) => {
                self.apply_ok(&ok);
                Ok(ok)
            }
            GenericResponse::Eof(eof) => {
                self.apply_status(eof.status);
                Ok(OkPacket {
                    status: eof.status,
                    warnings: eof.warnings,
                    ..OkPacket::default()
                })
            }
            GenericResponse::Err(err) => Err(server_error(&err, sql, &[])),
        }
    }

    fn simple_command(&mut self, command: Command, payload: &[u8]) -> Result<OkPacket> {
        self.send_command(command, payload)?;
        self.read_generic(None)
    }

    fn apply_status(&mut self, status: StatusFlags) {
        self.status = status;
        self.autocommit = status.contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT);
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.apply_status(ok.status);
        if let Some(schema) = ok.schema_change() {
            self.schema = Some(schema);
        }
        self.last_ok = ok.clone();
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn register_statement(&mut self, id: u32) {
        self.statements.push(id);
    }

    pub(crate) fn forget_statement(&mut self, id: u32) -> bool {
        let before = self.statements.len();
        self.statements.retain(|&s| s != id);
        self.statements.len() != before
    }

    pub(crate) fn owns_statement(&self, id: u32) -> bool {
        self.statements.contains(&id)
    }

    pub(crate) fn open_statement_count(&self) -> usize {
        self.statements.len()
    }

    pub(crate) fn multi_statements_enabled(&self) -> bool {
        self.multi_statements
    }

    // ---------------------------------------------------------------------
    // Text protocol
    // ---------------------------------------------------------------------

    /// Run a text-protocol statement with client-side parameter interpolation.
    fn run_text(&mut self, sql: &str, params: &[Value]) -> Result<Response> {
        let text = if params.is_empty() {
            sql.to_string()
        } else {
            interpolate_params(sql, params)?
        };
        self.send_command(Command::Query, &command::query(&text))?;
        let response = self.read_response(RowFormat::Text)?;
        self.drain_results(&response, RowFormat::Text)?;
        match response {
            Response::Err(err) => Err(server_error(&err, Some(sql), params)),
            other => Ok(other),
        }
    }

    /// Execute a query and return its rows. Statements without a result
    /// set yield an empty result.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        match self.run_text(sql, params)? {
            Response::ResultSet(rs) => Ok(rs),
            Response::Ok(ok) => Ok(ResultSet::empty(ok.status, ok.warnings)),
            Response::Err(_) => Err(protocol_error("unreachable ERR after text query")),
        }
    }

    /// First row of a query, if any.
    pub fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Execute a statement that does not return rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<UpdateResult> {
        match self.run_text(sql, params)? {
            Response::Ok(ok) => Ok(UpdateResult::from_ok(&ok)),
            Response::ResultSet(rs) => Ok(UpdateResult {
                warnings: rs.warnings(),
                ..UpdateResult::default()
            }),
            Response::Err(_) => Err(protocol_error("unreachable ERR after text statement")),
        }
    }

    /// Run several `;`-separated statements and collect every result.
    ///
    /// Multi-statement mode is switched on for the call if it is not
    /// already enabled.
    pub fn query_multi(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        let (results, err) = self.with_multi_statements(|conn| conn.run_multi_results(sql))?;
        match err {
            Some(err) => Err(server_error(&err, Some(sql), &[])),
            None => Ok(results),
        }
    }

    /// Send `sql` as one COM_QUERY and collect the whole result stream.
    pub(crate) fn run_multi_results(&mut self, sql: &str) -> Result<(Vec<QueryResult>, Option<ErrPacket>)> {
        self.send_command(Command::Query, &command::query(sql))?;
        let first = self.read_response(RowFormat::Text)?;
        self.read_results(first, RowFormat::Text)
    }

    /// Run `f` with multi-statements on, switching them off afterwards
    /// even when `f` fails.
    pub(crate) fn with_multi_statements<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if self.multi_statements {
            return f(self);
        }
        self.set_multi_statements(true)?;
        let result = f(self);
        let reset = if self.is_usable() {
            self.set_multi_statements(false)
        } else {
            Ok(())
        };
        let value = result?;
        reset?;
        Ok(value)
    }

    pub fn set_multi_statements(&mut self, enabled: bool) -> Result<()> {
        let option = if enabled {
            SetOption::MultiStatementsOn
        } else {
            SetOption::MultiStatementsOff
        };
        self.simple_command(Command::SetOption, &command::set_option(option))?;
        self.multi_statements = enabled;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    /// Prepare a server-side statement.
    pub fn prepare(&mut self, sql: &str) -> Result<ServerPreparedStatement> {
        ServerPreparedStatement::prepare(self, sql)
    }

    /// Prepare a statement whose parameters are interpolated client-side.
    pub fn prepare_client(&mut self, sql: &str) -> Result<ClientPreparedStatement> {
        self.ensure_ready()?;
        Ok(ClientPreparedStatement::new(sql))
    }

    /// Prepare a `CALL` of a stored procedure.
    pub fn prepare_call(&mut self, sql: &str) -> Result<CallableStatement> {
        CallableStatement::prepare(self, sql)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled { "SET autocommit=1" } else { "SET autocommit=0" };
        self.execute(sql, &[])?;
        self.autocommit = enabled;
        Ok(())
    }

    /// Turn autocommit off; the next statement opens a transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.autocommit {
            self.set_autocommit(false)?;
        }
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.require_manual_commit("commit")?;
        self.execute("COMMIT", &[]).map(drop)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.require_manual_commit("rollback")?;
        self.execute("ROLLBACK", &[]).map(drop)
    }

    fn require_manual_commit(&self, operation: &str) -> Result<()> {
        self.ensure_ready()?;
        if self.autocommit {
            return Err(Error::transaction(
                TransactionErrorKind::AutocommitEnabled,
                format!("cannot {operation} while autocommit is enabled"),
            ));
        }
        Ok(())
    }

    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.require_manual_commit("set a savepoint")?;
        let name = validate_savepoint(name)?;
        self.execute(&format!("SAVEPOINT `{name}`"), &[]).map(drop)
    }

    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_manual_commit("roll back to a savepoint")?;
        let name = validate_savepoint(name)?;
        let result = self.execute(&format!("ROLLBACK TO SAVEPOINT `{name}`"), &[]);
        savepoint_result(result, name)
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_manual_commit("release a savepoint")?;
        let name = validate_savepoint(name)?;
        let result = self.execute(&format!("RELEASE SAVEPOINT `{name}`"), &[]);
        savepoint_result(result, name)
    }

    pub fn set_transaction_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.execute(
            &format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            &[],
        )
        .map(drop)
    }

    pub fn transaction_isolation(&mut self) -> Result<IsolationLevel> {
        let sql = format!("SELECT @@SESSION.{}", self.isolation_variable());
        let value: String = self
            .query_one(&sql, &[])?
            .ok_or_else(|| protocol_error("isolation level query returned no rows"))?
            .get_as(0)?;
        IsolationLevel::from_server_name(&value)
            .ok_or_else(|| protocol_error(format!("unknown isolation level '{value}'")))
    }

    /// `transaction_isolation` replaced `tx_isolation` in MySQL 5.7.20 and
    /// MariaDB 11.1.1.
    fn isolation_variable(&self) -> &'static str {
        let version = self.server.server_version;
        let modern = if self.server.is_mariadb() {
            version.at_least(11, 1, 1)
        } else {
            version.at_least(5, 7, 20)
        };
        if modern {
            "transaction_isolation"
        } else {
            "tx_isolation"
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
        self.execute(&format!("SET SESSION TRANSACTION {mode}"), &[])
            .map(drop)
    }

    // ---------------------------------------------------------------------
    // Session management
    // ---------------------------------------------------------------------

    /// Change the default schema (COM_INIT_DB).
    pub fn set_schema(&mut self, schema: &str) -> Result<()> {
        self.simple_command(Command::InitDb, &command::init_db(schema))?;
        self.schema = Some(schema.to_string());
        Ok(())
    }

    pub fn ping(&mut self) -> Result<()> {
        self.simple_command(Command::Ping, &command::ping()).map(drop)
    }

    /// Human-readable server statistics (COM_STATISTICS).
    pub fn statistics(&mut self) -> Result<String> {
        self.send_command(Command::Statistics, &command::statistics())?;
        let result = self.transport.receive();
        let payload = self.track(result)?;
        if payload.first() == Some(&0xFF) {
            let err = ErrPacket::decode(&payload, self.capabilities)?;
            return Err(server_error(&err, None, &[]));
        }
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    fn supports_reset_connection(&self) -> bool {
        let version = self.server.server_version;
        if self.server.is_mariadb() {
            version.at_least(10, 2, 4)
        } else {
            version.at_least(5, 7, 3)
        }
    }

    /// Restore the session to its just-connected state: autocommit on,
    /// the configured schema, no user variables or temporary tables, no
    /// server-side statements.
    pub fn reset_session(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let reset = if self.supports_reset_connection() {
            match self.simple_command(Command::ResetConnection, &command::reset_connection()) {
                Ok(_) => Ok(()),
                Err(Error::Query(q)) => {
                    tracing::debug!(code = ?q.vendor_code, "COM_RESET_CONNECTION refused, using COM_CHANGE_USER");
                    self.reauthenticate()
                }
                Err(e) => Err(e),
            }
        } else {
            self.reauthenticate()
        };
        reset?;

        self.statements.clear();
        self.multi_statements = false;
        self.autocommit = true;
        let configured = self.config.database.clone();
        if let Some(database) = configured {
            if self.schema.as_deref() != Some(database.as_str()) {
                self.set_schema(&database)?;
            }
        }
        tracing::debug!(connection_id = self.server.connection_id, "session reset");
        Ok(())
    }

    fn reauthenticate(&mut self) -> Result<()> {
        let user = self.config.user.clone();
        let password = self.config.password.clone().unwrap_or_default();
        let database = self.config.database.clone();
        self.change_user(&user, &password, database.as_deref())
    }

    /// Re-authenticate as another user (COM_CHANGE_USER). Session state is
    /// reset by the server.
    pub fn change_user(&mut self, user: &str, password: &str, database: Option<&str>) -> Result<()> {
        self.ensure_ready()?;
        let config = self.config.clone();
        let mut auth = Authenticator::new(&config, self.plugin, self.server.scramble.clone(), self.tls)
            .with_password(password);
        let auth_response = auth.initial_response()?;
        let attributes = config.connect_attributes();
        let payload = ChangeUser {
            user,
            auth_response: &auth_response,
            database,
            charset: config.charset,
            auth_plugin: auth.plugin().name(),
            attributes: &attributes,
        }
        .encode(self.capabilities);
        self.send_command(Command::ChangeUser, &payload)?;

        let result = auth.run(&mut self.transport, self.capabilities);
        let ok = match result {
            Ok(ok) => ok,
            Err(err) => {
                // A failed COM_CHANGE_USER leaves the server expecting a new handshake.
                self.transport.mark_broken();
                self.state = ConnectionState::Broken;
                return Err(err);
            }
        };
        self.plugin = auth.plugin();
        self.apply_ok(&ok);
        self.statements.clear();
        self.multi_statements = false;
        self.config.user = user.to_string();
        self.config.password = Some(password.to_string()).filter(|p| !p.is_empty());
        self.config.database = database.map(str::to_string);
        self.schema = self.config.database.clone();
        tracing::debug!(user, "changed user");
        Ok(())
    }

    /// Close the connection: roll back an open transaction, release
    /// server-side statements and send COM_QUIT. Later calls fail with
    /// a closed-connection error.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Broken => {
                self.transport.shutdown();
                self.state = ConnectionState::Closed;
                return Ok(());
            }
            ConnectionState::Ready => {}
        }

        if !self.autocommit && self.is_usable() {
            if let Err(e) = self.execute("ROLLBACK", &[]) {
                tracing::warn!(error = %e, "rollback during close failed");
            }
        }
        if !self.statements.is_empty() && self.is_usable() {
            tracing::warn!(count = self.statements.len(), "closing server statements implicitly");
            for id in std::mem::take(&mut self.statements) {
                if self.send_command(Command::StmtClose, &command::stmt_close(id)).is_err() {
                    break;
                }
            }
        }
        if self.is_usable() {
            let _ = self.send_command(Command::Quit, &command::quit());
        }
        self.transport.shutdown();
        self.state = ConnectionState::Closed;
        tracing::debug!(connection_id = self.server.connection_id, "connection closed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut PacketTransport<S> {
        &mut self.transport
    }
}

impl<S: Socket> Drop for MySqlConnection<S> {
    fn drop(&mut self) {
        if self.state == ConnectionState::Ready && !self.transport.is_broken() {
            self.transport.reset_sequence_id();
            let _ = self.transport.send(&command::quit());
            self.transport.shutdown();
        }
    }
}

fn validate_savepoint(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(Error::transaction(
            TransactionErrorKind::InvalidSavepoint,
            format!("invalid savepoint name '{name}'"),
        ))
    }
}

fn savepoint_result(result: Result<UpdateResult>, name: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.vendor_code() == Some(ER_SP_DOES_NOT_EXIST) => Err(Error::transaction(
            TransactionErrorKind::SavepointNotFound,
            format!("savepoint '{name}' does not exist"),
        )),
        Err(err) => Err(err),
    }
}

impl<S: Socket + 'static> sqlwire_core::Connection for MySqlConnection<S> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        MySqlConnection::query(self, sql, params).map(ResultSet::into_rows)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        MySqlConnection::execute(self, sql, params).map(|r| r.affected_rows)
    }

    fn ping(&mut self) -> Result<()> {
        MySqlConnection::ping(self)
    }

    fn reset_session(&mut self) -> Result<()> {
        MySqlConnection::reset_session(self)
    }

    fn is_usable(&self) -> bool {
        MySqlConnection::is_usable(self)
    }

    fn close(&mut self) -> Result<()> {
        MySqlConnection::close(self)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Connections over scripted streams.

    use super::*;
    use crate::config::SslMode;
    use crate::protocol::handshake::fixtures::greeting;
    use crate::resultset::fixtures::ok;
    use crate::stream::testing::ScriptedStream;

    pub const SCRAMBLE: [u8; 20] = *b"01234567890123456789";

    pub fn server_caps() -> u32 {
        CapabilityFlags::DEFAULT_CLIENT.bits()
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB.bits()
            | CapabilityFlags::CLIENT_MULTI_STATEMENTS.bits()
    }

    /// A ready connection; `stream` has its handshake bytes cleared.
    pub fn connected() -> (MySqlConnection<ScriptedStream>, ScriptedStream) {
        let stream = ScriptedStream::from_packets(&[
            (0, greeting(server_caps(), "mysql_native_password", &SCRAMBLE)),
            (2, ok(0, 0, 0x0002)),
        ]);
        let config = MySqlConfig::new()
            .user("app")
            .password("secret")
            .ssl_mode(SslMode::Disable);
        let conn = MySqlConnection::handshake(stream.clone(), config).unwrap();
        stream.clear_written();
        (conn, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::resultset::fixtures::{err, ok, text_result};
    use crate::stream::testing::ScriptedStream;
    use crate::types::FieldType;

    const AUTOCOMMIT: u16 = 0x0002;
    const IN_TRANS: u16 = 0x0001;

    #[test]
    fn query_decodes_rows() {
        let (mut conn, stream) = connected();
        stream.push_packets(&text_result(
            1,
            &[("id", FieldType::LongLong), ("name", FieldType::VarString)],
            &[vec![Some("1"), Some("widget")]],
            AUTOCOMMIT,
        ));
        let rs = conn
            .query("SELECT id, name FROM items WHERE name = ?", &[Value::Text("it's".into())])
            .unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.rows()[0].get_named::<String>("name").unwrap(), "widget");
        assert_eq!(
            stream.written_packets(),
            vec![(0, b"\x03SELECT id, name FROM items WHERE name = 'it''s'".to_vec())]
        );
    }

    #[test]
    fn execute_reports_affected_rows() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, ok(3, 42, AUTOCOMMIT))]);
        let result = conn.execute("UPDATE t SET x = 1", &[]).unwrap();
        assert_eq!(result.affected_rows, 3);
        assert_eq!(result.last_insert_id, 42);
        assert_eq!(conn.last_ok().affected_rows, 3);
    }

    #[test]
    fn duplicate_key_maps_to_constraint() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, err(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'"))]);
        let e = conn
            .execute("INSERT INTO t (id) VALUES (?)", &[Value::Int(1)])
            .unwrap_err();
        let Error::Query(q) = &e else {
            panic!("expected query error, got {e:?}");
        };
        assert_eq!(q.kind, sqlwire_core::QueryErrorKind::Constraint);
        assert_eq!(q.sqlstate.as_deref(), Some("23000"));
        assert_eq!(q.sql.as_deref(), Some("INSERT INTO t (id) VALUES (?)"));
        assert_eq!(q.params, vec![Value::Int(1)]);
        assert!(conn.is_usable());
    }

    #[test]
    fn commit_requires_autocommit_off() {
        let (mut conn, stream) = connected();
        let e = conn.commit().unwrap_err();
        assert!(matches!(
            e,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::AutocommitEnabled
        ));
        assert!(stream.written().is_empty());

        stream.push_packets(&[(1, ok(0, 0, 0))]);
        conn.begin().unwrap();
        assert!(!conn.autocommit());
        stream.push_packets(&[(1, ok(0, 0, IN_TRANS))]);
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        assert!(conn.in_transaction());
        stream.push_packets(&[(1, ok(0, 0, 0))]);
        conn.commit().unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn savepoint_names_are_validated() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, ok(0, 0, 0))]);
        conn.set_autocommit(false).unwrap();
        for bad in ["", "1abc", "a-b", "a`b"] {
            let e = conn.savepoint(bad).unwrap_err();
            assert!(matches!(
                e,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::InvalidSavepoint
            ));
        }
        stream.clear_written();
        stream.push_packets(&[(1, err(1305, "42000", "SAVEPOINT sp1 does not exist"))]);
        let e = conn.rollback_to_savepoint("sp1").unwrap_err();
        assert!(matches!(
            e,
            Error::Transaction(ref t) if t.kind == TransactionErrorKind::SavepointNotFound
        ));
        assert_eq!(stream.written_packets()[0].1, b"\x03ROLLBACK TO SAVEPOINT `sp1`".to_vec());
    }

    #[test]
    fn isolation_variable_follows_server_version() {
        let (mut conn, stream) = connected();
        stream.push_packets(&text_result(
            1,
            &[("@@SESSION.transaction_isolation", FieldType::VarString)],
            &[vec![Some("READ-COMMITTED")]],
            AUTOCOMMIT,
        ));
        assert_eq!(conn.transaction_isolation().unwrap(), IsolationLevel::ReadCommitted);
        assert_eq!(
            stream.written_packets()[0].1,
            b"\x03SELECT @@SESSION.transaction_isolation".to_vec()
        );
    }

    #[test]
    fn multi_statements_are_switched_off_after_query_multi() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        stream.push_packets(&[
            (1, ok(1, 0, AUTOCOMMIT | 0x0008)),
            (2, err(1146, "42S02", "Table 'x' doesn't exist")),
        ]);
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);

        let e = conn.query_multi("DELETE FROM a; DELETE FROM x").unwrap_err();
        assert_eq!(e.query_kind(), Some(sqlwire_core::QueryErrorKind::Syntax));
        assert!(!conn.multi_statements_enabled());
        let sent = stream.written_packets();
        assert_eq!(sent[0].1, vec![0x1b, 0, 0]);
        assert_eq!(sent[2].1, vec![0x1b, 1, 0]);
    }

    #[test]
    fn query_multi_collects_results() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        let mut packets = vec![(1, ok(2, 0, AUTOCOMMIT | 0x0008))];
        packets.extend(text_result(
            2,
            &[("n", FieldType::LongLong)],
            &[vec![Some("5")]],
            AUTOCOMMIT,
        ));
        stream.push_packets(&packets);
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);

        let results = conn.query_multi("UPDATE t SET a = 1; SELECT 5 AS n").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].affected_rows(), 2);
        assert!(matches!(results[1], QueryResult::Rows(ref rs) if rs.len() == 1));
    }

    #[test]
    fn io_failure_breaks_connection() {
        let (mut conn, _stream) = connected();
        let e = conn.ping().unwrap_err();
        assert!(e.is_connection_error());
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(!conn.is_usable());
        let e = conn.ping().unwrap_err();
        assert!(e.to_string().contains("broken"));
    }

    #[test]
    fn protocol_violation_breaks_connection() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(5, ok(0, 0, AUTOCOMMIT))]);
        assert!(matches!(conn.ping().unwrap_err(), Error::Protocol(_)));
        assert_eq!(conn.state(), ConnectionState::Broken);
    }

    #[test]
    fn close_rolls_back_and_quits() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, ok(0, 0, 0))]);
        conn.set_autocommit(false).unwrap();
        conn.register_statement(9);
        stream.clear_written();
        stream.push_packets(&[(1, ok(0, 0, 0))]);

        conn.close().unwrap();
        let sent: Vec<Vec<u8>> = stream.written_packets().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            sent,
            vec![b"\x03ROLLBACK".to_vec(), vec![0x19, 9, 0, 0, 0], vec![0x01]]
        );

        let e = conn.ping().unwrap_err();
        assert!(matches!(
            e,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Closed
        ));
        assert_eq!(stream.written_packets().len(), 3);
        assert!(conn.close().is_ok());
    }

    #[test]
    fn reset_session_uses_reset_connection() {
        let (mut conn, stream) = connected();
        conn.register_statement(4);
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        conn.reset_session().unwrap();
        assert_eq!(stream.written_packets(), vec![(0, vec![0x1f])]);
        assert!(!conn.owns_statement(4));
        assert!(conn.autocommit());
    }

    #[test]
    fn change_user_reauthenticates() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, ok(0, 0, AUTOCOMMIT))]);
        conn.change_user("report", "pw", Some("analytics")).unwrap();
        let sent = stream.written_packets();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with(b"\x11report\0\x14"));
        assert_eq!(conn.schema(), Some("analytics"));
        assert_eq!(conn.metadata().user, "report");
    }

    #[test]
    fn statistics_returns_text() {
        let (mut conn, stream) = connected();
        stream.push_packets(&[(1, b"Uptime: 10  Threads: 1".to_vec())]);
        assert_eq!(conn.statistics().unwrap(), "Uptime: 10  Threads: 1");
    }

    #[test]
    fn schema_change_tracked_from_session_state() {
        let (mut conn, stream) = connected();
        // OK with SERVER_SESSION_STATE_CHANGED and a schema entry
        let mut packet = vec![0x00, 0, 0];
        packet.extend_from_slice(&(AUTOCOMMIT | 0x4000).to_le_bytes());
        packet.extend_from_slice(&[0, 0]);
        packet.push(0); // info
        packet.extend_from_slice(&[7, 0x01, 5, 4, b's', b'h', b'o', b'p']);
        stream.push_packets(&[(1, packet)]);
        conn.execute("USE shop", &[]).unwrap();
        assert_eq!(conn.schema(), Some("shop"));
    }

    #[test]
    fn connect_with_db_fallback_uses_init_db() {
        use crate::protocol::handshake::fixtures::greeting;
        let caps = server_caps() & !CapabilityFlags::CLIENT_CONNECT_WITH_DB.bits();
        let stream = ScriptedStream::from_packets(&[
            (0, greeting(caps, "mysql_native_password", &SCRAMBLE)),
            (2, ok(0, 0, AUTOCOMMIT)),
            (1, ok(0, 0, AUTOCOMMIT)),
        ]);
        let config = MySqlConfig::new()
            .user("app")
            .database("shop")
            .ssl_mode(crate::config::SslMode::Disable);
        let conn = MySqlConnection::handshake(stream.clone(), config).unwrap();
        assert_eq!(conn.schema(), Some("shop"));
        assert_eq!(stream.written_packets().last(), Some(&(0, b"\x02shop".to_vec())));
    }
}
