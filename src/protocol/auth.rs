//! Pluggable authentication mechanisms.
//!
//! The server advertises a plugin name in its greeting (and may request a
//! switch mid-handshake); the client answers each challenge nonce with a
//! plugin-specific scramble.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Status byte inside an auth-more-data payload: cached credentials matched.
pub const CACHING_SHA2_FAST_AUTH_OK: u8 = 0x03;
/// Status byte inside an auth-more-data payload: full authentication needed.
pub const CACHING_SHA2_FULL_AUTH: u8 = 0x04;

/// The closed set of supported authentication plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    /// `mysql_native_password`: SHA1 challenge/response.
    NativePassword,
    /// `caching_sha2_password`: SHA256 fast path; full auth requires TLS.
    CachingSha2,
    /// `mysql_clear_password`: plaintext, only usable over TLS.
    ClearPassword,
}

impl AuthPlugin {
    /// Look up a plugin by the server-advertised name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mysql_native_password" => Ok(AuthPlugin::NativePassword),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2),
            "mysql_clear_password" => Ok(AuthPlugin::ClearPassword),
            other => Err(Error::Auth(format!(
                "server requested unsupported auth plugin {other:?}"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2 => "caching_sha2_password",
            AuthPlugin::ClearPassword => "mysql_clear_password",
        }
    }

    /// Whether this plugin may only run over an encrypted transport.
    pub fn requires_tls(self) -> bool {
        matches!(self, AuthPlugin::ClearPassword)
    }

    /// Answer the server's challenge nonce.
    pub fn respond(self, password: &str, nonce: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::NativePassword => native_password_scramble(password, nonce),
            AuthPlugin::CachingSha2 => caching_sha2_scramble(password, nonce),
            AuthPlugin::ClearPassword => {
                let mut out = password.as_bytes().to_vec();
                out.push(0);
                out
            }
        }
    }
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// scramble = SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
fn native_password_scramble(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let password_hash = sha1(password.as_bytes());
    let double_hash = sha1(&password_hash);

    let mut combined = Vec::with_capacity(nonce.len() + double_hash.len());
    combined.extend_from_slice(nonce);
    combined.extend_from_slice(&double_hash);
    let scramble_hash = sha1(&combined);

    password_hash
        .iter()
        .zip(scramble_hash.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// scramble = SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)
fn caching_sha2_scramble(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let password_hash = sha256(password.as_bytes());
    let double_hash = sha256(&password_hash);

    let mut combined = Vec::with_capacity(double_hash.len() + nonce.len());
    combined.extend_from_slice(&double_hash);
    combined.extend_from_slice(nonce);
    let scramble_hash = sha256(&combined);

    password_hash
        .iter()
        .zip(scramble_hash.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}
