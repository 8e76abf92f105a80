//! Connection and catalog metadata.
//!
//! [`ConnectionMetadata`] is a point-in-time snapshot of what the handshake
//! negotiated. The catalog queries read `information_schema` through the
//! normal text protocol.

use serde::Serialize;

use sqlwire_core::{Result, Row, Value};

use crate::connection::MySqlConnection;
use crate::error::protocol_error;
use crate::stream::Socket;

/// Snapshot of a connection's negotiated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionMetadata {
    pub connection_id: u32,
    pub server_version: String,
    pub is_mariadb: bool,
    pub capabilities: Vec<&'static str>,
    pub charset: u8,
    pub user: String,
    pub schema: Option<String>,
    pub tls: bool,
    pub auth_plugin: &'static str,
    pub autocommit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    /// `BASE TABLE`, `VIEW` or `SYSTEM VIEW`.
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub ordinal: u32,
    pub data_type: String,
    /// Full type, e.g. `int unsigned` or `varchar(64)`.
    pub column_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// `PRI`, `UNI`, `MUL` or empty.
    pub key: String,
    pub extra: String,
}

/// Direction of a stored-procedure parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParameterMode {
    In,
    Out,
    InOut,
}

impl ParameterMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode.trim().to_ascii_uppercase().as_str() {
            "IN" => Some(ParameterMode::In),
            "OUT" => Some(ParameterMode::Out),
            "INOUT" => Some(ParameterMode::InOut),
            _ => None,
        }
    }

    /// `true` for parameters the server writes back.
    pub fn is_output(self) -> bool {
        matches!(self, ParameterMode::Out | ParameterMode::InOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutineParameter {
    /// 1-based position in the parameter list.
    pub ordinal: u32,
    pub name: String,
    pub mode: ParameterMode,
    pub data_type: String,
}

fn text(row: &Row, index: usize) -> Result<String> {
    Ok(row.get_as::<Option<String>>(index)?.unwrap_or_default())
}

impl<S: Socket> MySqlConnection<S> {
    /// Names of all schemas visible to the current user.
    pub fn schemas(&mut self) -> Result<Vec<String>> {
        self.query(
            "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME",
            &[],
        )?
        .into_iter()
        .map(|row| text(&row, 0))
        .collect()
    }

    pub fn tables(&mut self, schema: &str) -> Result<Vec<TableInfo>> {
        self.query(
            "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? ORDER BY TABLE_NAME",
            &[Value::Text(schema.to_string())],
        )?
        .into_iter()
        .map(|row| {
            Ok(TableInfo {
                schema: text(&row, 0)?,
                name: text(&row, 1)?,
                table_type: text(&row, 2)?,
            })
        })
        .collect()
    }

    pub fn columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMetadata>> {
        self.query(
            "SELECT COLUMN_NAME, ORDINAL_POSITION, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, \
             COLUMN_DEFAULT, COLUMN_KEY, EXTRA FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            &[Value::Text(schema.to_string()), Value::Text(table.to_string())],
        )?
        .into_iter()
        .map(|row| {
            Ok(ColumnMetadata {
                name: text(&row, 0)?,
                ordinal: row.get_as(1)?,
                data_type: text(&row, 2)?,
                column_type: text(&row, 3)?,
                nullable: text(&row, 4)?.eq_ignore_ascii_case("YES"),
                default: row.get_as(5)?,
                key: text(&row, 6)?,
                extra: text(&row, 7)?,
            })
        })
        .collect()
    }

    /// Parameters of a stored procedure, in declaration order.
    pub fn routine_parameters(&mut self, schema: &str, name: &str) -> Result<Vec<RoutineParameter>> {
        self.query(
            "SELECT ORDINAL_POSITION, PARAMETER_NAME, PARAMETER_MODE, DATA_TYPE \
             FROM information_schema.PARAMETERS \
             WHERE SPECIFIC_SCHEMA = ? AND SPECIFIC_NAME = ? AND ROUTINE_TYPE = 'PROCEDURE' \
             AND ORDINAL_POSITION > 0 ORDER BY ORDINAL_POSITION",
            &[Value::Text(schema.to_string()), Value::Text(name.to_string())],
        )?
        .into_iter()
        .map(|row| {
            let mode = text(&row, 2)?;
            Ok(RoutineParameter {
                ordinal: row.get_as(0)?,
                name: text(&row, 1)?,
                mode: ParameterMode::parse(&mode)
                    .ok_or_else(|| protocol_error(format!("unknown parameter mode '{mode}'")))?,
                data_type: text(&row, 3)?,
            })
        })
        .collect()
    }
}
