//! Command-phase request payloads.
//!
//! Each builder returns the payload only; the transport frames it.

use crate::protocol::handshake::encode_attributes;
use crate::protocol::writer::PacketWriter;
use crate::protocol::{CapabilityFlags, Command};

/// COM_SET_OPTION values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SetOption {
    MultiStatementsOn = 0,
    MultiStatementsOff = 1,
}

fn with_command(command: Command, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(command as u8);
    payload.extend_from_slice(body);
    payload
}

pub fn query(sql: &str) -> Vec<u8> {
    with_command(Command::Query, sql.as_bytes())
}

pub fn stmt_prepare(sql: &str) -> Vec<u8> {
    with_command(Command::StmtPrepare, sql.as_bytes())
}

pub fn stmt_close(statement_id: u32) -> Vec<u8> {
    with_command(Command::StmtClose, &statement_id.to_le_bytes())
}

pub fn stmt_reset(statement_id: u32) -> Vec<u8> {
    with_command(Command::StmtReset, &statement_id.to_le_bytes())
}

pub fn quit() -> Vec<u8> {
    with_command(Command::Quit, &[])
}

pub fn ping() -> Vec<u8> {
    with_command(Command::Ping, &[])
}

pub fn statistics() -> Vec<u8> {
    with_command(Command::Statistics, &[])
}

pub fn reset_connection() -> Vec<u8> {
    with_command(Command::ResetConnection, &[])
}

pub fn init_db(schema: &str) -> Vec<u8> {
    with_command(Command::InitDb, schema.as_bytes())
}

pub fn set_option(option: SetOption) -> Vec<u8> {
    with_command(Command::SetOption, &(option as u16).to_le_bytes())
}

/// COM_CHANGE_USER body fields.
#[derive(Debug, Clone)]
pub struct ChangeUser<'a> {
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub charset: u8,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl ChangeUser<'_> {
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, caps: CapabilityFlags) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(Command::ChangeUser as u8);
        w.write_null_string(self.user);
        if caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            w.write_u8(self.auth_response.len() as u8);
            w.write_bytes(self.auth_response);
        } else {
            w.write_bytes(self.auth_response);
            w.write_u8(0);
        }
        w.write_null_string(self.database.unwrap_or(""));
        w.write_u16_le(u16::from(self.charset));
        if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            w.write_null_string(self.auth_plugin);
        }
        if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            w.write_lenenc_bytes(&encode_attributes(self.attributes));
        }
        w.into_bytes()
    }
}
