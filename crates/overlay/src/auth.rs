//! Handshake certificates and per-connection message authentication.
//!
//! # Handshake
//!
//! 1. Each side generates a Curve25519 keypair for the connection and sends
//!    HELLO carrying an [`AuthCert`] (the Curve25519 public key signed with
//!    the node's Ed25519 identity) and a random nonce.
//! 2. On HELLO, each side verifies the certificate and derives two MAC keys
//!    from the ECDH result and both nonces ([`AuthContext::derive_keys`]).
//! 3. From then on every message except HELLO and ERROR carries
//!    `HMAC(sendKey, seq ‖ xdr(message))`, with `seq` counting from zero in
//!    each direction.
//!
//! # Key Derivation
//!
//! - Extract: `K = HKDF_extract(ecdh ‖ A_pub ‖ B_pub)`, A being the caller
//! - Expand: `key = HKDF_expand(K, prefix ‖ nonce1 ‖ nonce2)`
//!
//! The caller sends with prefix 0 and receives with prefix 1; the acceptor
//! mirrors this, so each direction has its own key.

use crate::LocalNode;
use fba_crypto::{
    hkdf_expand, hmac_sha256_multi, hmac_sha256_verify, sha256_multi, Curve25519Public,
    Curve25519Secret, PublicKey, Signature,
};
use rand::RngCore;
use stellar_xdr::curr::{
    self as xdr, AuthenticatedMessage, AuthenticatedMessageV0, EnvelopeType, HmacSha256Mac,
    Limits, StellarMessage, WriteXdr,
};

/// Certificate lifetime in seconds.
pub const AUTH_CERT_EXPIRATION_SECONDS: u64 = 3600;

/// Binds a per-connection Curve25519 key to a node's Ed25519 identity.
///
/// The signature covers
/// `sha256(network_id ‖ ENVELOPE_TYPE_AUTH ‖ expiration ‖ pubkey)`.
#[derive(Debug, Clone)]
pub struct AuthCert {
    pub pubkey: Curve25519Public,
    /// Unix seconds after which the certificate is rejected.
    pub expiration: u64,
    pub sig: Signature,
}

impl AuthCert {
    pub fn new(local: &LocalNode, pubkey: Curve25519Public, now_unix: u64) -> Self {
        let expiration = now_unix + AUTH_CERT_EXPIRATION_SECONDS;
        let hash = Self::signed_hash(&local.network_id, expiration, &pubkey);
        Self {
            pubkey,
            expiration,
            sig: local.secret_key.sign(&hash),
        }
    }

    fn signed_hash(network_id: &[u8; 32], expiration: u64, pubkey: &Curve25519Public) -> [u8; 32] {
        sha256_multi(&[
            network_id,
            &(EnvelopeType::Auth as i32).to_be_bytes(),
            &expiration.to_be_bytes(),
            pubkey.as_bytes(),
        ])
    }

    /// Checks expiry and the signature against the claimed node key.
    pub fn verify(&self, network_id: &[u8; 32], node_key: &PublicKey, now_unix: u64) -> bool {
        if self.expiration < now_unix {
            return false;
        }
        let hash = Self::signed_hash(network_id, self.expiration, &self.pubkey);
        node_key.verify(&hash, &self.sig).is_ok()
    }

    pub fn to_xdr(&self) -> xdr::AuthCert {
        xdr::AuthCert {
            pubkey: self.pubkey.into(),
            expiration: self.expiration,
            sig: self.sig.into(),
        }
    }

    /// Parses a certificate; `None` if the signature has the wrong length.
    pub fn from_xdr(cert: &xdr::AuthCert) -> Option<Self> {
        Some(Self {
            pubkey: Curve25519Public::from(&cert.pubkey),
            expiration: cert.expiration,
            sig: Signature::try_from(&cert.sig).ok()?,
        })
    }
}

/// Why an incoming authenticated message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacFailure {
    UnexpectedSequence { expected: u64, got: u64 },
    BadMac,
}

struct MacKeys {
    send: [u8; 32],
    recv: [u8; 32],
}

/// Session keys and sequence counters for one connection.
pub struct AuthContext {
    secret: Curve25519Secret,
    public: Curve25519Public,
    cert: AuthCert,
    local_nonce: [u8; 32],
    we_called_remote: bool,
    keys: Option<MacKeys>,
    send_seq: u64,
    recv_seq: u64,
}

impl AuthContext {
    pub fn new<R: RngCore + ?Sized>(
        local: &LocalNode,
        we_called_remote: bool,
        now_unix: u64,
        rng: &mut R,
    ) -> Self {
        let secret = Curve25519Secret::from_rng(rng);
        let public = secret.derive_public();
        let cert = AuthCert::new(local, public, now_unix);
        let mut local_nonce = [0u8; 32];
        rng.fill_bytes(&mut local_nonce);
        Self {
            secret,
            public,
            cert,
            local_nonce,
            we_called_remote,
            keys: None,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    pub fn cert(&self) -> &AuthCert {
        &self.cert
    }

    pub fn local_nonce(&self) -> &[u8; 32] {
        &self.local_nonce
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn send_sequence(&self) -> u64 {
        self.send_seq
    }

    pub fn recv_sequence(&self) -> u64 {
        self.recv_seq
    }

    /// Derives both MAC keys from the remote certificate key and nonce and
    /// resets both sequence counters to zero.
    pub fn derive_keys(&mut self, remote_pubkey: &Curve25519Public, remote_nonce: &[u8; 32]) {
        let shared = self
            .secret
            .derive_shared_key(&self.public, remote_pubkey, self.we_called_remote);
        let (send_prefix, recv_prefix) = if self.we_called_remote {
            (0u8, 1u8)
        } else {
            (1u8, 0u8)
        };

        let send = hkdf_expand(&shared, &expand_info(send_prefix, &self.local_nonce, remote_nonce));
        let recv = hkdf_expand(&shared, &expand_info(recv_prefix, remote_nonce, &self.local_nonce));
        self.keys = Some(MacKeys { send, recv });
        self.send_seq = 0;
        self.recv_seq = 0;
    }

    /// Wraps an outgoing message.
    ///
    /// HELLO and ERROR travel with sequence 0 and an all-zero MAC; everything
    /// else consumes the next send sequence number.
    pub fn seal(&mut self, message: StellarMessage) -> crate::Result<AuthenticatedMessage> {
        let unauthenticated = matches!(
            message,
            StellarMessage::Hello(_) | StellarMessage::ErrorMsg(_)
        );
        let (sequence, mac) = match (&self.keys, unauthenticated) {
            (Some(keys), false) => {
                let sequence = self.send_seq;
                let body = message.to_xdr(Limits::none())?;
                let mac = hmac_sha256_multi(&keys.send, &[&sequence.to_be_bytes(), &body]);
                self.send_seq += 1;
                (sequence, mac)
            }
            _ => (0, [0u8; 32]),
        };
        Ok(AuthenticatedMessage::V0(AuthenticatedMessageV0 {
            sequence,
            message,
            mac: HmacSha256Mac { mac },
        }))
    }

    /// Checks sequence and MAC of an incoming message.
    ///
    /// The expected sequence advances whether or not the check passes; a
    /// failure is fatal to the connection anyway.
    pub fn open(&mut self, message: &AuthenticatedMessageV0) -> crate::Result<Result<(), MacFailure>> {
        let Some(keys) = &self.keys else {
            return Ok(Ok(()));
        };
        let expected = self.recv_seq;
        self.recv_seq += 1;
        if message.sequence != expected {
            return Ok(Err(MacFailure::UnexpectedSequence {
                expected,
                got: message.sequence,
            }));
        }
        let body = message.message.to_xdr(Limits::none())?;
        if !hmac_sha256_verify(
            &message.mac.mac,
            &keys.recv,
            &[&message.sequence.to_be_bytes(), &body],
        ) {
            return Ok(Err(MacFailure::BadMac));
        }
        Ok(Ok(()))
    }
}

fn expand_info(prefix: u8, nonce1: &[u8; 32], nonce2: &[u8; 32]) -> Vec<u8> {
    let mut info = Vec::with_capacity(65);
    info.push(prefix);
    info.extend_from_slice(nonce1);
    info.extend_from_slice(nonce2);
    info
}

/// Current wall-clock time in unix seconds, for certificate expiry.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fba_crypto::SecretKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use stellar_xdr::curr::{SendMore, VecM};

    fn node(seed: u8) -> LocalNode {
        LocalNode::new(SecretKey::from_seed(&[seed; 32]), "test network")
    }

    fn handshake() -> (AuthContext, AuthContext) {
        let mut rng = StdRng::seed_from_u64(42);
        let mut caller = AuthContext::new(&node(1), true, 1_000, &mut rng);
        let mut acceptor = AuthContext::new(&node(2), false, 1_000, &mut rng);

        let caller_pub = caller.cert().pubkey;
        let caller_nonce = *caller.local_nonce();
        let acceptor_pub = acceptor.cert().pubkey;
        let acceptor_nonce = *acceptor.local_nonce();

        caller.derive_keys(&acceptor_pub, &acceptor_nonce);
        acceptor.derive_keys(&caller_pub, &caller_nonce);
        (caller, acceptor)
    }

    fn v0(msg: AuthenticatedMessage) -> AuthenticatedMessageV0 {
        match msg {
            AuthenticatedMessage::V0(v0) => v0,
        }
    }

    #[test]
    fn test_auth_cert_verify() {
        let local = node(1);
        let pubkey = Curve25519Secret::from_bytes([9u8; 32]).derive_public();
        let cert = AuthCert::new(&local, pubkey, 1_000);

        assert!(cert.verify(&local.network_id, &local.public_key(), 1_000));
        // Expired.
        assert!(!cert.verify(&local.network_id, &local.public_key(), 1_000 + 3601));
        // Wrong network.
        assert!(!cert.verify(&[0u8; 32], &local.public_key(), 1_000));
        // Wrong signer.
        assert!(!cert.verify(&local.network_id, &node(2).public_key(), 1_000));

        let parsed = AuthCert::from_xdr(&cert.to_xdr()).unwrap();
        assert!(parsed.verify(&local.network_id, &local.public_key(), 1_000));
    }

    #[test]
    fn test_sealed_messages_open_on_the_other_side() {
        let (mut caller, mut acceptor) = handshake();

        for i in 0..3 {
            let msg = caller
                .seal(StellarMessage::SendMore(SendMore { num_messages: i }))
                .unwrap();
            let msg = v0(msg);
            assert_eq!(msg.sequence, i as u64);
            assert_eq!(acceptor.open(&msg).unwrap(), Ok(()));
        }

        let reply = v0(acceptor.seal(StellarMessage::GetPeers).unwrap());
        assert_eq!(caller.open(&reply).unwrap(), Ok(()));
    }

    #[test]
    fn test_replay_rejected() {
        let (mut caller, mut acceptor) = handshake();
        let first = v0(caller.seal(StellarMessage::GetPeers).unwrap());
        assert_eq!(acceptor.open(&first).unwrap(), Ok(()));
        assert_eq!(
            acceptor.open(&first).unwrap(),
            Err(MacFailure::UnexpectedSequence {
                expected: 1,
                got: 0
            })
        );
    }

    #[test]
    fn test_tampered_mac_rejected() {
        let (mut caller, mut acceptor) = handshake();
        let mut msg = v0(caller.seal(StellarMessage::Peers(VecM::default())).unwrap());
        msg.mac.mac[0] ^= 1;
        assert_eq!(acceptor.open(&msg).unwrap(), Err(MacFailure::BadMac));
    }

    #[test]
    fn test_hello_and_error_not_maced() {
        let (mut caller, _) = handshake();
        let hello = v0(caller.seal(StellarMessage::Hello(stellar_xdr::curr::Hello {
            ledger_version: 0,
            overlay_version: 0,
            overlay_min_version: 0,
            network_id: stellar_xdr::curr::Hash([0; 32]),
            version_str: Default::default(),
            listening_port: 0,
            peer_id: stellar_xdr::curr::NodeId(stellar_xdr::curr::PublicKey::PublicKeyTypeEd25519(
                stellar_xdr::curr::Uint256([0; 32]),
            )),
            cert: stellar_xdr::curr::AuthCert {
                pubkey: stellar_xdr::curr::Curve25519Public { key: [0; 32] },
                expiration: 0,
                sig: Default::default(),
            },
            nonce: stellar_xdr::curr::Uint256([0; 32]),
        })).unwrap());
        assert_eq!(hello.sequence, 0);
        assert_eq!(hello.mac.mac, [0u8; 32]);
        assert_eq!(caller.send_sequence(), 0);

        let auth = v0(caller.seal(StellarMessage::GetPeers).unwrap());
        assert_ne!(auth.mac.mac, [0u8; 32]);
        assert_eq!(caller.send_sequence(), 1);
    }

    #[test]
    fn test_open_without_keys_accepts() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = AuthContext::new(&node(1), true, 0, &mut rng);
        let msg = AuthenticatedMessageV0 {
            sequence: 99,
            message: StellarMessage::GetPeers,
            mac: HmacSha256Mac { mac: [0u8; 32] },
        };
        assert!(!ctx.has_keys());
        assert_eq!(ctx.open(&msg).unwrap(), Ok(()));
    }
}
