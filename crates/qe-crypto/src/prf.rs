//! Pseudo-random function and key expansion
//!
//! PRF: HMAC-SHA256, 32-byte output. Integer inputs are encoded as 8-byte
//! little-endian so that a label and a slot/position share one domain.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use qe_core::{QeError, QeResult};
use sha2::Sha256;

use crate::KEY_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256(key, data)
pub fn prf(key: &[u8], data: &[u8]) -> QeResult<[u8; KEY_SIZE]> {
    if key.is_empty() {
        return Err(QeError::invalid("PRF key must not be empty"));
    }
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| QeError::invalid(format!("PRF key rejected: {e}")))?;
    mac.update(data);
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// HMAC-SHA256(key, le64(n))
pub fn prf_u64(key: &[u8], n: u64) -> QeResult<[u8; KEY_SIZE]> {
    prf(key, &n.to_le_bytes())
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub fn hkdf_derive<const N: usize>(ikm: &[u8], info: &[u8]) -> QeResult<[u8; N]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; N];
    hkdf.expand(info, &mut okm)
        .map_err(|e| QeError::invalid(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
