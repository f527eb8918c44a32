//! Symmetric key material for sealed frames.
//!
//! Keys are provisioned out of band: both ends must already hold the same
//! encryption key and the same authentication key. The base64 form is the
//! exchange format for config files and command lines.

use base64::Engine;
use nanolink_types::{KeyConfig, WireError, WireResult};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key length in bytes (AES-256 and the HMAC key share it).
pub const KEY_LEN: usize = 32;

/// A 256-bit key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WireKey([u8; KEY_LEN]);

impl WireKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a standard-alphabet base64 key. The decoded length must be exact.
    pub fn from_base64(encoded: &str) -> WireResult<Self> {
        let mut decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| WireError::Configuration(format!("Invalid base64 key: {e}")))?;
        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(WireError::Configuration(format!(
                "Key must be {KEY_LEN} bytes, got {len}"
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for WireKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WireKey(<redacted>)")
    }
}

/// The encryption/authentication key pair of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub encrypt: WireKey,
    pub auth: WireKey,
}

impl SessionKeys {
    pub fn new(encrypt: WireKey, auth: WireKey) -> Self {
        Self { encrypt, auth }
    }

    pub fn generate() -> Self {
        Self::new(WireKey::generate(), WireKey::generate())
    }

    pub fn from_base64(encrypt: &str, auth: &str) -> WireResult<Self> {
        Ok(Self::new(
            WireKey::from_base64(encrypt)?,
            WireKey::from_base64(auth)?,
        ))
    }

    /// Keys from the `[keys]` config section: both, neither, or an error.
    pub fn from_config(config: &KeyConfig) -> WireResult<Option<Self>> {
        match (&config.encrypt_key, &config.auth_key) {
            (Some(enc), Some(auth)) => Self::from_base64(enc, auth).map(Some),
            (None, None) => Ok(None),
            _ => Err(WireError::Configuration(
                "encrypt_key and auth_key must be provided together".into(),
            )),
        }
    }
}
