//! TLS/SSL support for MySQL connections.
//!
//! # MySQL TLS Handshake Flow
//!
//! 1. Server sends the initial handshake with `CLIENT_SSL`
//! 2. Client sends the 32-byte SSL request (sequence id 1)
//! 3. Client performs the TLS handshake on the same socket
//! 4. Client sends the full handshake response over TLS (sequence id 2)
//!
//! # SSL modes
//!
//! - `Preferred` / `Required`: encrypt, accept the server certificate unchecked
//!   (unless a CA is configured, in which case the chain is verified)
//! - `VerifyCa`: verify the chain against the configured CA, ignore the host name
//! - `VerifyIdentity`: verify the chain and the host name
//!
//! The rustls implementation lives behind the `tls` feature. Without it,
//! `Preferred` silently stays in plaintext and the other modes fail.

use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{Error, Result};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::CapabilityFlags;

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// `true` when this build can encrypt connections.
pub const fn tls_available() -> bool {
    cfg!(feature = "tls")
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
///
/// Errors when TLS is required but the server (or this build) cannot do it.
pub fn should_upgrade(ssl_mode: SslMode, server_caps: CapabilityFlags) -> Result<bool> {
    let server_supports = server_caps.contains(CapabilityFlags::CLIENT_SSL);
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports && tls_available()),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if !server_supports {
                Err(tls_error("TLS required but the server does not support it"))
            } else if !tls_available() {
                Err(tls_error(
                    "TLS required but sqlwire-mysql was built without the `tls` feature",
                ))
            } else {
                Ok(true)
            }
        }
    }
}

/// Validate TLS configuration for the given SSL mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<()> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(Error::config(
            "client certificate and client key must be configured together",
        ));
    }
    match ssl_mode {
        SslMode::VerifyCa | SslMode::VerifyIdentity
            if tls_config.ca_cert_path.is_none() && !tls_config.danger_skip_verify =>
        {
            Err(Error::config(
                "VerifyCa/VerifyIdentity need a CA certificate (or danger_skip_verify)",
            ))
        }
        _ => Ok(()),
    }
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Ssl, message)
}

// ============================================================================
// rustls stream (feature-gated)
// ============================================================================

/// TLS connection wrapper using rustls.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    pub fn new(
        mut stream: S,
        tls_config: &TlsConfig,
        host: &str,
        ssl_mode: SslMode,
    ) -> Result<Self> {
        let config = build_client_config(tls_config, ssl_mode)?;

        let sni_name = tls_config.server_name.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(sni_name.to_string())
            .map_err(|e| tls_error(format!("invalid server name '{sni_name}': {e}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("failed to create TLS connection: {e}")))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
        }
        tracing::debug!(
            version = ?conn.protocol_version(),
            cipher = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "tls established"
        );

        Ok(TlsStream { conn, stream })
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).read(buf)
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).flush()
    }
}

#[cfg(feature = "tls")]
fn build_client_config(tls_config: &TlsConfig, ssl_mode: SslMode) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?;

    let builder = match (ssl_mode, &tls_config.ca_cert_path) {
        (SslMode::Disable, _) => return Err(tls_error("TLS requested with SslMode::Disable")),
        _ if tls_config.danger_skip_verify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::AcceptAny(provider))),
        (SslMode::Preferred | SslMode::Required, None) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::AcceptAny(provider))),
        (SslMode::VerifyIdentity, None) => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots)
        }
        (SslMode::VerifyCa, None) => return Err(tls_error("VerifyCa needs a CA certificate")),
        (SslMode::VerifyCa, Some(ca_path)) => {
            let roots = load_roots(ca_path)?;
            let inner = rustls::client::WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots),
                provider,
            )
            .build()
            .map_err(|e| tls_error(format!("failed to build certificate verifier: {e}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verify::IgnoreHostname(inner)))
        }
        (_, Some(ca_path)) => builder.with_root_certificates(load_roots(ca_path)?),
    };

    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn load_roots(ca_path: &std::path::Path) -> Result<rustls::RootCertStore> {
    let certs = read_certs(ca_path)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(roots)
}

#[cfg(feature = "tls")]
fn read_certs(path: &std::path::Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse '{}': {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates found in '{}'", path.display())));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    let (Some(cert_path), Some(key_path)) = (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };
    let certs = read_certs(cert_path)?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_error(format!("failed to open client key '{}': {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| tls_error(format!("no private key found in '{}'", key_path.display())))?;
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("failed to configure client auth: {e}")))
}

#[cfg(feature = "tls")]
mod verify {
    use std::sync::Arc;

    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any certificate chain; signatures are still checked.
    #[derive(Debug)]
    pub(super) struct AcceptAny(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    /// Full chain verification with the host-name check waived.
    #[derive(Debug)]
    pub(super) struct IgnoreHostname(pub(super) Arc<WebPkiServerVerifier>);

    impl ServerCertVerifier for IgnoreHostname {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            match self
                .0
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            {
                Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                    Ok(ServerCertVerified::assertion())
                }
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            self.0.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            self.0.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_verify_schemes()
        }
    }
}

// ============================================================================
// Stand-in when the `tls` feature is disabled
// ============================================================================

/// Never constructed without the `tls` feature; [`should_upgrade`] refuses
/// to upgrade first.
#[cfg(not(feature = "tls"))]
#[derive(Debug)]
pub struct TlsStream<S> {
    stream: S,
}

#[cfg(not(feature = "tls"))]
impl<S> TlsStream<S> {
    pub fn new(_stream: S, _tls_config: &TlsConfig, _host: &str, _ssl_mode: SslMode) -> Result<Self> {
        Err(tls_error(
            "TLS support requires the `tls` feature of sqlwire-mysql",
        ))
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

#[cfg(not(feature = "tls"))]
impl<S: std::io::Read> std::io::Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

#[cfg(not(feature = "tls"))]
impl<S: std::io::Write> std::io::Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSL: CapabilityFlags = CapabilityFlags::CLIENT_SSL;

    #[test]
    fn disable_never_upgrades() {
        assert!(!should_upgrade(SslMode::Disable, SSL).unwrap());
        assert!(!should_upgrade(SslMode::Disable, CapabilityFlags::empty()).unwrap());
    }

    #[test]
    fn preferred_falls_back_to_plaintext() {
        assert!(!should_upgrade(SslMode::Preferred, CapabilityFlags::empty()).unwrap());
        assert_eq!(should_upgrade(SslMode::Preferred, SSL).unwrap(), tls_available());
    }

    #[test]
    fn required_modes_need_server_support() {
        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            let err = should_upgrade(mode, CapabilityFlags::empty()).unwrap_err();
            assert!(matches!(
                err,
                Error::Connection(ref c) if c.kind == ConnectionErrorKind::Ssl
            ));
            assert_eq!(should_upgrade(mode, SSL).is_ok(), tls_available());
        }
    }

    #[test]
    fn verify_modes_need_ca_or_skip() {
        let config = TlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &config).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
        assert!(validate_tls_config(SslMode::VerifyIdentity, &config).is_err());
        assert!(validate_tls_config(SslMode::VerifyCa, &TlsConfig::new().ca_cert("/ca.pem")).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &TlsConfig::new().skip_verify(true)).is_ok());
    }

    #[test]
    fn client_cert_requires_key() {
        let config = TlsConfig::new().ca_cert("/ca.pem").client_cert("/client.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_err());
        let config = config.client_key("/client-key.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_ok());
    }
}
