//! Connection-phase negotiation.
//!
//! The handshake runs as an explicit state machine:
//!
//! ```text
//! Initial ──greeting──▶ CapabilitiesNegotiated ──SSL request──▶ TlsUpgraded
//!                                 │                                  │
//!                                 └────────handshake response────────┤
//!                                                                    ▼
//!                              Failed ◀──ERR── Authenticating ──OK──▶ Authenticated
//! ```
//!
//! The authentication loop ([`Authenticator`]) is shared with
//! COM_CHANGE_USER, which re-enters it on an established connection.

use sqlwire_core::Result;

use crate::auth::{self, AuthPlugin, caching_sha2};
use crate::config::MySqlConfig;
use crate::error::{auth_error, handshake_server_error, malformed, protocol_error};
use crate::protocol::handshake::AuthPacket;
use crate::protocol::{
    CapabilityFlags, ErrPacket, HandshakeResponse41, InitialHandshake, OkPacket, SslRequest,
    StatusFlags,
};
use crate::stream::Socket;
use crate::tls;
use crate::transport::PacketTransport;

/// Upper bound on server packets in one authentication exchange.
const MAX_AUTH_ROUNDS: usize = 8;

/// Where the connection phase currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    CapabilitiesNegotiated,
    TlsUpgraded,
    Authenticating,
    Authenticated,
    Failed,
}

/// Everything the command phase needs from a finished handshake.
#[derive(Debug)]
pub struct Established<S: Socket> {
    pub transport: PacketTransport<S>,
    pub server: InitialHandshake,
    pub capabilities: CapabilityFlags,
    pub status: StatusFlags,
    pub tls: bool,
    pub plugin: AuthPlugin,
}

/// Drives one connection through the connection phase.
#[derive(Debug)]
pub struct Handshake<'a> {
    config: &'a MySqlConfig,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    pub fn new(config: &'a MySqlConfig) -> Self {
        Self {
            config,
            state: HandshakeState::Initial,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn advance(&mut self, next: HandshakeState) {
        tracing::trace!(from = ?self.state, to = ?next, "handshake state");
        self.state = next;
    }

    /// Run the whole connection phase over `stream`.
    pub fn run<S: Socket>(&mut self, stream: S) -> Result<Established<S>> {
        let result = self.run_inner(PacketTransport::new(stream));
        if result.is_err() {
            self.advance(HandshakeState::Failed);
        }
        result
    }

    fn run_inner<S: Socket>(&mut self, mut transport: PacketTransport<S>) -> Result<Established<S>> {
        let config = self.config;

        let greeting = transport.receive()?;
        if greeting.first() == Some(&0xFF) {
            let err = ErrPacket::decode(&greeting, CapabilityFlags::CLIENT_PROTOCOL_41)?;
            return Err(handshake_server_error(&err));
        }
        let server = InitialHandshake::decode(&greeting)?;
        if !server.capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
            return Err(protocol_error(format!(
                "server {} does not support protocol 4.1",
                server.server_version_raw
            )));
        }

        let mut capabilities = config.capability_flags() & server.capabilities;
        tracing::debug!(
            server_version = %server.server_version_raw,
            connection_id = server.connection_id,
            plugin = %server.auth_plugin,
            capabilities = ?capabilities,
            "received server greeting"
        );
        self.advance(HandshakeState::CapabilitiesNegotiated);

        let use_tls = tls::should_upgrade(config.ssl_mode, server.capabilities)?;
        if use_tls {
            capabilities.insert(CapabilityFlags::CLIENT_SSL);
            let request = SslRequest {
                capabilities,
                max_packet_size: config.max_packet_size,
                charset: config.charset,
            };
            transport.send(&request.encode())?;
            transport = transport.into_upgraded(|stream| stream.upgrade_tls(config))?;
            tracing::debug!("connection upgraded to TLS");
            self.advance(HandshakeState::TlsUpgraded);
        }

        let plugin = AuthPlugin::from_name(&server.auth_plugin).unwrap_or_else(|_| {
            tracing::debug!(
                plugin = %server.auth_plugin,
                "server default plugin unsupported, offering mysql_native_password"
            );
            AuthPlugin::NativePassword
        });
        let mut auth = Authenticator::new(config, plugin, server.scramble.clone(), use_tls);
        let auth_response = auth.initial_response()?;
        let attributes = config.connect_attributes();
        let response = HandshakeResponse41 {
            capabilities,
            max_packet_size: config.max_packet_size,
            charset: config.charset,
            user: &config.user,
            auth_response: &auth_response,
            database: config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &attributes,
        };
        transport.send(&response.encode())?;
        self.advance(HandshakeState::Authenticating);

        let ok = auth.run(&mut transport, capabilities)?;
        self.advance(HandshakeState::Authenticated);
        transport.reset_sequence_id();
        tracing::debug!(
            user = %config.user,
            plugin = auth.plugin().name(),
            tls = use_tls,
            "authenticated"
        );

        Ok(Established {
            transport,
            server,
            capabilities,
            status: ok.status,
            tls: use_tls,
            plugin: auth.plugin(),
        })
    }
}

/// The plugin-driven authentication exchange.
#[derive(Debug)]
pub struct Authenticator<'a> {
    password: &'a str,
    plugin: AuthPlugin,
    scramble: Vec<u8>,
    secure: bool,
    server_public_key: Option<&'a str>,
    allow_key_retrieval: bool,
    awaiting_public_key: bool,
}

impl<'a> Authenticator<'a> {
    pub fn new(config: &'a MySqlConfig, plugin: AuthPlugin, scramble: Vec<u8>, secure: bool) -> Self {
        Self {
            password: config.password.as_deref().unwrap_or(""),
            plugin,
            scramble,
            secure,
            server_public_key: config.server_public_key.as_deref(),
            allow_key_retrieval: config.allow_public_key_retrieval,
            awaiting_public_key: false,
        }
    }

    /// Override the password (COM_CHANGE_USER authenticates someone else).
    pub fn with_password(mut self, password: &'a str) -> Self {
        self.password = password;
        self
    }

    pub fn plugin(&self) -> AuthPlugin {
        self.plugin
    }

    /// First auth-data blob for the current plugin and scramble.
    pub fn initial_response(&mut self) -> Result<Vec<u8>> {
        self.awaiting_public_key = false;
        match self.plugin {
            AuthPlugin::NativePassword => Ok(auth::mysql_native_password(self.password, &self.scramble)),
            AuthPlugin::CachingSha2Password => {
                Ok(auth::caching_sha2_password(self.password, &self.scramble))
            }
            AuthPlugin::Sha256Password => {
                if self.password.is_empty() {
                    Ok(vec![0])
                } else if self.secure {
                    Ok(auth::clear_password(self.password))
                } else if let Some(pem) = self.server_public_key {
                    auth::encrypt_password(self.password, &self.scramble, pem)
                } else if self.allow_key_retrieval {
                    self.awaiting_public_key = true;
                    Ok(vec![auth::SHA256_REQUEST_PUBLIC_KEY])
                } else {
                    Err(insecure_channel(self.plugin))
                }
            }
            AuthPlugin::ClearPassword => {
                if self.secure {
                    Ok(auth::clear_password(self.password))
                } else {
                    Err(auth_error(
                        "mysql_clear_password is only used over a TLS connection",
                    ))
                }
            }
        }
    }

    /// Read server packets until OK or ERR, answering continuations.
    pub fn run<S: Socket>(
        &mut self,
        transport: &mut PacketTransport<S>,
        caps: CapabilityFlags,
    ) -> Result<OkPacket> {
        for _ in 0..MAX_AUTH_ROUNDS {
            let payload = transport.receive()?;
            match AuthPacket::decode(&payload, caps)? {
                AuthPacket::Ok(ok) => return Ok(ok),
                AuthPacket::Err(err) => return Err(handshake_server_error(&err)),
                AuthPacket::Switch(switch) => {
                    let next = AuthPlugin::from_name(&switch.plugin)?;
                    if next != self.plugin {
                        tracing::warn!(
                            from = self.plugin.name(),
                            to = next.name(),
                            "server switched authentication plugin"
                        );
                    }
                    self.plugin = next;
                    self.scramble = switch.scramble;
                    let response = self.initial_response()?;
                    transport.send(&response)?;
                }
                AuthPacket::MoreData(data) => {
                    if let Some(response) = self.continue_with(&data, &payload)? {
                        transport.send(&response)?;
                    }
                }
            }
        }
        Err(auth_error(format!(
            "authentication did not finish within {MAX_AUTH_ROUNDS} rounds"
        )))
    }

    /// Answer a 0x01 continuation packet; `None` means wait for the next packet.
    fn continue_with(&mut self, data: &[u8], payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.awaiting_public_key {
            self.awaiting_public_key = false;
            let pem = std::str::from_utf8(data)
                .map_err(|_| malformed("public key", payload))?;
            return auth::encrypt_password(self.password, &self.scramble, pem).map(Some);
        }
        match (self.plugin, data) {
            (AuthPlugin::CachingSha2Password, [caching_sha2::FAST_AUTH_SUCCESS]) => {
                tracing::trace!("caching_sha2_password fast auth accepted");
                Ok(None)
            }
            (AuthPlugin::CachingSha2Password, [caching_sha2::PERFORM_FULL_AUTH]) => {
                self.full_auth().map(Some)
            }
            _ => Err(malformed("authentication continuation", payload)),
        }
    }

    fn full_auth(&mut self) -> Result<Vec<u8>> {
        if self.secure {
            Ok(auth::clear_password(self.password))
        } else if let Some(pem) = self.server_public_key {
            auth::encrypt_password(self.password, &self.scramble, pem)
        } else if self.allow_key_retrieval {
            self.awaiting_public_key = true;
            Ok(vec![caching_sha2::REQUEST_PUBLIC_KEY])
        } else {
            Err(insecure_channel(self.plugin))
        }
    }
}

fn insecure_channel(plugin: AuthPlugin) -> sqlwire_core::Error {
    auth_error(format!(
        "{} needs the full password but the connection is not encrypted; \
         enable TLS, configure server_public_key or allow_public_key_retrieval",
        plugin.name()
    ))
}
