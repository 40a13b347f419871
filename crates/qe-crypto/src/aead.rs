//! Authenticated encryption primitives
//!
//! Randomized: XChaCha20-Poly1305
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//! Used for field values (repeated values must not produce equal ciphertexts)
//! and for anything the server seals.
//!
//! Deterministic: AES-256-SIV with a zero nonce. Used for index-row contents,
//! whose associated data (the row id) is already unique per row.

use aes_siv::{Aes256SivAead, Nonce};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use qe_core::{QeError, QeResult};
use rand::RngCore;

use crate::prf::hkdf_derive;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Encrypt with XChaCha20-Poly1305 under a fresh random nonce.
///
/// Returns: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt_randomized(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> QeResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| QeError::invalid(format!("encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Inverse of [`encrypt_randomized`]; fails with `DecryptionFailed` on any
/// authentication mismatch.
pub fn decrypt_randomized(key: &[u8; KEY_SIZE], encrypted: &[u8], aad: &[u8]) -> QeResult<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        return Err(QeError::DecryptionFailed(format!(
            "ciphertext too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.into());

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| QeError::DecryptionFailed("invalid key, corrupted data, or wrong context".into()))
}

/// Encrypt with AES-256-SIV. Same key + plaintext + aad always gives the same output.
pub fn encrypt_deterministic(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> QeResult<Vec<u8>> {
    let cipher = siv_cipher(key)?;
    cipher
        .encrypt(&Nonce::default(), Payload { msg: plaintext, aad })
        .map_err(|e| QeError::invalid(format!("deterministic encryption failed: {e}")))
}

pub fn decrypt_deterministic(key: &[u8; KEY_SIZE], encrypted: &[u8], aad: &[u8]) -> QeResult<Vec<u8>> {
    let cipher = siv_cipher(key)?;
    cipher
        .decrypt(&Nonce::default(), Payload { msg: encrypted, aad })
        .map_err(|_| QeError::DecryptionFailed("invalid key, corrupted data, or wrong context".into()))
}

fn siv_cipher(key: &[u8; KEY_SIZE]) -> QeResult<Aes256SivAead> {
    // AES-256-SIV takes a 64-byte key (two 32-byte sub-keys)
    let double_key: [u8; 64] = hkdf_derive(key, b"qe-aes-siv")?;
    Ok(Aes256SivAead::new((&double_key).into()))
}
