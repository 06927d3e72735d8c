//! Failures of the local overlay machinery.
//!
//! Protocol violations by a remote peer are *not* errors in this sense: they
//! end in a [`DropReason`](crate::DropReason) recorded on the connection.
//! [`OverlayError`] covers framing, XDR, storage and sockets.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    Message(String),

    /// A frame exceeded the size allowed in the current connection state.
    #[error("message too large: {size} bytes (limit: {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// No socket could be opened to the peer.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The referenced connection is not in the arena.
    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    /// Peer directory or ban list storage failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverlayError {
    /// Whether the same call might succeed later, e.g. a refused dial or a
    /// transient accept failure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OverlayError::ConnectionFailed(_) | OverlayError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OverlayError::MessageTooLarge {
            size: 5000,
            limit: 4096,
        };
        assert_eq!(err.to_string(), "message too large: 5000 bytes (limit: 4096)");
    }

    #[test]
    fn test_retriable() {
        assert!(OverlayError::ConnectionFailed("refused".into()).is_retriable());
        assert!(!OverlayError::UnknownConnection(7).is_retriable());
        assert!(!OverlayError::Message("short".into()).is_retriable());
    }
}
