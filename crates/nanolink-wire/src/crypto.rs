//! Sign-then-encrypt envelope for sealed frames.
//!
//! The plaintext payload is tagged with HMAC-SHA-512/256 under the auth key,
//! the tag is prepended, and `tag || payload` is sealed with AES-256-GCM under
//! the encryption key. The 12-byte nonce is random per call and travels in
//! front of the ciphertext:
//!
//! ```text
//! ciphertext = nonce(12) || AES-256-GCM(tag || payload)
//! ```

use crate::keys::SessionKeys;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use nanolink_types::{WireError, WireResult};
use sha2::Sha512_256;
use subtle::ConstantTimeEq;

type HmacSha512_256 = Hmac<Sha512_256>;

/// Length of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Length of the integrity tag produced by [`sign`].
pub const TAG_LEN: usize = 32;

/// Compute the integrity tag of `data`.
pub fn sign(auth_key: &[u8; 32], data: &[u8]) -> [u8; TAG_LEN] {
    let mut mac =
        <HmacSha512_256 as Mac>::new_from_slice(auth_key).expect("HMAC accepts any key size");
    mac.update(data);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

/// Verify a tag in constant time. A tag of the wrong length never matches.
pub fn verify(auth_key: &[u8; 32], data: &[u8], tag: &[u8]) -> bool {
    let expected = sign(auth_key, data);
    expected.as_slice().ct_eq(tag).into()
}

/// Tag and encrypt `payload`. Returns the tag length and the sealed bytes.
pub fn seal(keys: &SessionKeys, payload: &[u8]) -> WireResult<(usize, Vec<u8>)> {
    let tag = sign(keys.auth.as_bytes(), payload);
    let mut plaintext = Vec::with_capacity(TAG_LEN + payload.len());
    plaintext.extend_from_slice(&tag);
    plaintext.extend_from_slice(payload);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(keys.encrypt.as_bytes()));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| WireError::Encoding(format!("Encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_LEN + sealed.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&sealed);
    Ok((TAG_LEN, result))
}

/// Decrypt `ciphertext` and verify the tag in its first `tag_len` bytes.
///
/// Every failure is reported as [`WireError::Authentication`]. A failed
/// decryption still runs one HMAC pass so both failures cost the same.
pub fn open(keys: &SessionKeys, ciphertext: &[u8], tag_len: usize) -> WireResult<Vec<u8>> {
    if ciphertext.len() < NONCE_LEN {
        let _ = verify(keys.auth.as_bytes(), ciphertext, &[]);
        return Err(WireError::Authentication);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(keys.encrypt.as_bytes()));
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let mut plaintext = match cipher.decrypt(nonce, sealed) {
        Ok(p) => p,
        Err(_) => {
            let _ = verify(keys.auth.as_bytes(), sealed, &[]);
            return Err(WireError::Authentication);
        }
    };

    if tag_len > plaintext.len() {
        return Err(WireError::Authentication);
    }
    let payload = plaintext.split_off(tag_len);
    if !verify(keys.auth.as_bytes(), &payload, &plaintext) {
        return Err(WireError::Authentication);
    }
    Ok(payload)
}
