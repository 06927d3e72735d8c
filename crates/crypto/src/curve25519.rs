//! Curve25519 ECDH for per-connection session keys.
//!
//! Each connection generates a fresh Curve25519 keypair; the public half is
//! carried in the HELLO certificate and signed with the node's long-lived
//! Ed25519 key. These keys must never be reused for signing.

use crate::hkdf_extract;
use rand::RngCore;
use std::hash::{Hash, Hasher};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

/// A secret Curve25519 scalar. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Curve25519Secret {
    inner: StaticSecret,
}

/// A public Curve25519 point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Curve25519Public {
    inner: PublicKey,
}

impl Curve25519Secret {
    /// Generates a secret from the supplied random source.
    pub fn from_rng<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Creates a secret from raw scalar bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Derives the public point for this secret.
    pub fn derive_public(&self) -> Curve25519Public {
        Curve25519Public {
            inner: PublicKey::from(&self.inner),
        }
    }

    /// Computes the raw shared secret `self * remote`.
    pub fn diffie_hellman(&self, remote: &Curve25519Public) -> [u8; 32] {
        self.inner.diffie_hellman(&remote.inner).to_bytes()
    }

    /// Derives the session PRK shared by both ends of a connection.
    ///
    /// `HKDF_extract(ecdh ‖ publicA ‖ publicB)` where A is the side that
    /// initiated the connection. Both ends must agree on `local_first`
    /// from their own point of view: the caller passes `true`, the acceptor
    /// `false`.
    pub fn derive_shared_key(
        &self,
        local_public: &Curve25519Public,
        remote_public: &Curve25519Public,
        local_first: bool,
    ) -> [u8; 32] {
        let shared = self.diffie_hellman(remote_public);
        let (public_a, public_b) = if local_first {
            (local_public, remote_public)
        } else {
            (remote_public, local_public)
        };

        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(&shared);
        buf.extend_from_slice(public_a.as_bytes());
        buf.extend_from_slice(public_b.as_bytes());
        hkdf_extract(&buf)
    }
}

impl std::fmt::Debug for Curve25519Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Curve25519Secret([REDACTED])")
    }
}

impl Curve25519Public {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: PublicKey::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.inner.as_bytes()
    }
}

impl std::fmt::Debug for Curve25519Public {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Curve25519Public({})", hex::encode(&self.as_bytes()[..8]))
    }
}

impl Hash for Curve25519Public {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl From<&stellar_xdr::curr::Curve25519Public> for Curve25519Public {
    fn from(xdr: &stellar_xdr::curr::Curve25519Public) -> Self {
        Self::from_bytes(xdr.key)
    }
}

impl From<Curve25519Public> for stellar_xdr::curr::Curve25519Public {
    fn from(key: Curve25519Public) -> Self {
        stellar_xdr::curr::Curve25519Public {
            key: key.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_diffie_hellman_agreement() {
        let mut rng = StdRng::seed_from_u64(1);
        let alice = Curve25519Secret::from_rng(&mut rng);
        let bob = Curve25519Secret::from_rng(&mut rng);

        assert_eq!(
            alice.diffie_hellman(&bob.derive_public()),
            bob.diffie_hellman(&alice.derive_public())
        );
    }

    #[test]
    fn test_derive_shared_key_both_sides_agree() {
        let mut rng = StdRng::seed_from_u64(2);
        let caller = Curve25519Secret::from_rng(&mut rng);
        let acceptor = Curve25519Secret::from_rng(&mut rng);
        let caller_pub = caller.derive_public();
        let acceptor_pub = acceptor.derive_public();

        let k1 = caller.derive_shared_key(&caller_pub, &acceptor_pub, true);
        let k2 = acceptor.derive_shared_key(&acceptor_pub, &caller_pub, false);
        assert_eq!(k1, k2);

        // Disagreeing on the ordering yields different keys.
        let k3 = caller.derive_shared_key(&caller_pub, &acceptor_pub, false);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = Curve25519Secret::from_rng(&mut StdRng::seed_from_u64(9));
        let b = Curve25519Secret::from_rng(&mut StdRng::seed_from_u64(9));
        assert_eq!(a.derive_public(), b.derive_public());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = Curve25519Secret::from_bytes([5u8; 32]);
        assert!(format!("{:?}", secret).contains("REDACTED"));
    }
}
