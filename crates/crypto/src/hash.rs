//! SHA-256, HMAC-SHA256 and HKDF primitives.
//!
//! The overlay handshake only needs a small slice of RFC 5869: an extract
//! step with an all-zero salt and a single-block expand. Both are built on
//! [`hmac_sha256`].

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{Limits, WriteXdr};

type HmacSha256 = Hmac<Sha256>;

/// Computes the SHA-256 hash of `data`.
///
/// ```
/// use fba_crypto::sha256;
///
/// let hash = sha256(b"hello");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Computes the SHA-256 hash over several chunks without concatenating them.
pub fn sha256_multi(chunks: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// Hashes the XDR encoding of `value`.
pub fn xdr_sha256<T: WriteXdr>(value: &T) -> Result<[u8; 32], stellar_xdr::curr::Error> {
    let bytes = value.to_xdr(Limits::none())?;
    Ok(sha256(&bytes))
}

/// Computes HMAC-SHA256 of `data` under a 32-byte key.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    hmac_sha256_multi(key, &[data])
}

/// Computes HMAC-SHA256 over several chunks.
///
/// ```
/// use fba_crypto::{hmac_sha256, hmac_sha256_multi};
///
/// let key = [7u8; 32];
/// assert_eq!(hmac_sha256(&key, b"seqbody"), hmac_sha256_multi(&key, &[b"seq", b"body"]));
/// ```
pub fn hmac_sha256_multi(key: &[u8; 32], chunks: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// Verifies an HMAC-SHA256 tag in constant time.
pub fn hmac_sha256_verify(tag: &[u8; 32], key: &[u8; 32], chunks: &[&[u8]]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.verify_slice(tag).is_ok()
}

/// HKDF-Extract with an all-zero salt: `HMAC(0^32, ikm)`.
pub fn hkdf_extract(ikm: &[u8]) -> [u8; 32] {
    hmac_sha256(&[0u8; 32], ikm)
}

/// Single-block HKDF-Expand: `HMAC(prk, info ‖ 0x01)`.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8]) -> [u8; 32] {
    hmac_sha256_multi(prk, &[info, &[0x01]])
}
