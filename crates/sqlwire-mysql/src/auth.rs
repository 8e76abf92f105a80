//! MySQL authentication plugins.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast path (server has the password hash cached):
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + scramble)
//! ```
//!
//! Full authentication sends the password in clear text over TLS, or
//! RSA-OAEP encrypted (XORed with the scramble) otherwise. `sha256_password`
//! uses the same full-authentication exchange from the start.

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use sqlwire_core::Result;

use crate::error::auth_error;

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Continuation codes used by caching_sha2_password.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key.
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Server needs the full password.
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password asks for the public key with a single 0x01 byte.
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// Scramble length used by every supported plugin.
pub const SCRAMBLE_LEN: usize = 20;

/// A supported authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
    ClearPassword,
}

impl AuthPlugin {
    /// Look up a plugin by its wire name. Unknown plugins are an
    /// authentication error.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD | "" => Ok(AuthPlugin::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2Password),
            plugins::SHA256_PASSWORD => Ok(AuthPlugin::Sha256Password),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(AuthPlugin::ClearPassword),
            other => Err(auth_error(format!(
                "unsupported authentication plugin '{other}'"
            ))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256Password => plugins::SHA256_PASSWORD,
            AuthPlugin::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }
}

/// Strip the NUL some servers append to the 20-byte scramble.
fn seed(scramble: &[u8]) -> &[u8] {
    if scramble.len() > SCRAMBLE_LEN {
        &scramble[..SCRAMBLE_LEN]
    } else {
        scramble
    }
}

/// mysql_native_password response; empty for an empty password.
pub fn mysql_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed(scramble));
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();
    xor(&stage1, &stage3)
}

/// caching_sha2_password fast-auth response; empty for an empty password.
pub fn caching_sha2_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash_hash: [u8; 32] = Sha256::digest(hash).into();
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed(scramble));
    let mix: [u8; 32] = hasher.finalize().into();
    xor(&hash, &mix)
}

/// Password followed by NUL, as sent in clear text over a secure channel.
pub fn clear_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// RSA-OAEP(SHA-1) encrypt `password\0` XORed with the scramble.
pub fn encrypt_password(password: &str, scramble: &[u8], public_key_pem: &str) -> Result<Vec<u8>> {
    let scramble = seed(scramble);
    if scramble.is_empty() {
        return Err(auth_error("cannot encrypt password: empty scramble"));
    }
    let mut plain = clear_password(password);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= scramble[i % scramble.len()];
    }

    let key = parse_public_key(public_key_pem)?;
    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_error(format!("RSA encryption of password failed: {e}")))
}

/// Accepts SubjectPublicKeyInfo ("BEGIN PUBLIC KEY") or PKCS#1
/// ("BEGIN RSA PUBLIC KEY") PEM.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    let pem = pem.trim_matches(char::from(0)).trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("invalid RSA public key from server: {e}")))
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    /// A fresh 1024-bit key pair; small keys keep the tests quick.
    pub fn key_pair() -> (RsaPrivateKey, String) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    }
}
