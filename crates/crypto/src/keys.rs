//! Ed25519 node identity keys.
//!
//! - [`PublicKey`]: 32-byte verifying key, the node id on the wire
//! - [`SecretKey`]: 32-byte signing seed
//! - [`Signature`]: 64-byte Ed25519 signature

use crate::error::CryptoError;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use std::fmt;

/// An Ed25519 public key.
///
/// `Display` shows a short hex prefix, which is what peers are called in
/// logs and drop reasons.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Creates a public key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        use ed25519_dalek::Verifier;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// First eight hex characters of the key.
    pub fn short_id(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.as_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_id())
    }
}

impl TryFrom<&stellar_xdr::curr::PublicKey> for PublicKey {
    type Error = CryptoError;

    fn try_from(xdr: &stellar_xdr::curr::PublicKey) -> Result<Self, Self::Error> {
        match xdr {
            stellar_xdr::curr::PublicKey::PublicKeyTypeEd25519(stellar_xdr::curr::Uint256(
                bytes,
            )) => Self::from_bytes(bytes),
        }
    }
}

impl From<&PublicKey> for stellar_xdr::curr::PublicKey {
    fn from(pk: &PublicKey) -> Self {
        stellar_xdr::curr::PublicKey::PublicKeyTypeEd25519(stellar_xdr::curr::Uint256(
            *pk.as_bytes(),
        ))
    }
}

impl From<&PublicKey> for stellar_xdr::curr::NodeId {
    fn from(pk: &PublicKey) -> Self {
        stellar_xdr::curr::NodeId(pk.into())
    }
}

/// An Ed25519 signing key. The seed is zeroized on drop by `ed25519_dalek`.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generates a key from the supplied cryptographic random source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: SigningKey::generate(rng),
        }
    }

    /// Deterministically creates a key from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            inner: SigningKey::from_bytes(seed),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.inner.sign(message).to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.verifying_key())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self {
            inner: SigningKey::from_bytes(self.inner.as_bytes()),
        }
    }
}

/// A 64-byte Ed25519 signature. No validation happens until
/// [`PublicKey::verify`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 64]);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

impl From<Signature> for stellar_xdr::curr::Signature {
    fn from(sig: Signature) -> Self {
        // 64 bytes always fits BytesM<64>.
        stellar_xdr::curr::Signature(sig.0.to_vec().try_into().unwrap_or_default())
    }
}

impl TryFrom<&stellar_xdr::curr::Signature> for Signature {
    type Error = CryptoError;

    fn try_from(xdr: &stellar_xdr::curr::Signature) -> Result<Self, Self::Error> {
        let bytes: [u8; 64] =
            xdr.0
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: 64,
                    got: xdr.0.len(),
                })?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_signing() {
        let secret = SecretKey::generate(&mut StdRng::seed_from_u64(1));
        let public = secret.public_key();

        let signature = secret.sign(b"hello world");
        assert!(public.verify(b"hello world", &signature).is_ok());
        assert!(public.verify(b"wrong message", &signature).is_err());
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = SecretKey::from_seed(&[8u8; 32]);
        let b = SecretKey::from_seed(&[8u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"m"), b.sign(b"m"));
    }

    #[test]
    fn test_xdr_round_trip() {
        let secret = SecretKey::from_seed(&[2u8; 32]);
        let public = secret.public_key();

        let xdr: stellar_xdr::curr::PublicKey = (&public).into();
        assert_eq!(PublicKey::try_from(&xdr).unwrap(), public);

        let sig = secret.sign(b"payload");
        let xdr_sig: stellar_xdr::curr::Signature = sig.into();
        assert_eq!(Signature::try_from(&xdr_sig).unwrap(), sig);
    }

    #[test]
    fn test_short_id() {
        let public = SecretKey::from_seed(&[1u8; 32]).public_key();
        assert_eq!(public.short_id().len(), 8);
        assert_eq!(public.to_string(), public.short_id());
    }
}
