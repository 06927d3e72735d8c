use thiserror::Error;

/// Failures from key parsing and signature checks.
///
/// The overlay maps all of these onto a handshake failure, so the variants
/// only need to be precise enough for logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("bytes are not an Ed25519 curve point")]
    InvalidPublicKey,

    #[error("signature does not verify")]
    InvalidSignature,

    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}
