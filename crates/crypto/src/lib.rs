//! Cryptographic primitives for the overlay handshake.
//!
//! - **Ed25519**: node identity, certificate signing ([`SecretKey`], [`PublicKey`])
//! - **Curve25519**: per-connection ECDH ([`Curve25519Secret`], [`Curve25519Public`])
//! - **SHA-256 / HMAC-SHA256**: hashing and message authentication
//! - **HKDF**: extract/expand for MAC key derivation
//!
//! Randomness always comes from a caller-supplied RNG so that the overlay
//! can run deterministically under a seeded generator.
//!
//! ```
//! use fba_crypto::{SecretKey, sha256};
//!
//! let secret = SecretKey::from_seed(&sha256(b"node seed"));
//! let signature = secret.sign(b"hello");
//! assert!(secret.public_key().verify(b"hello", &signature).is_ok());
//! ```

mod curve25519;
mod error;
mod hash;
mod keys;

pub use curve25519::{Curve25519Public, Curve25519Secret};
pub use error::CryptoError;
pub use hash::{
    hkdf_expand, hkdf_extract, hmac_sha256, hmac_sha256_multi, hmac_sha256_verify, sha256,
    sha256_multi, xdr_sha256,
};
pub use keys::{PublicKey, SecretKey, Signature};
