//! Frame codec for overlay messages.
//!
//! Each message on the wire is an XDR `AuthenticatedMessage` prefixed with a
//! 4-byte big-endian length:
//!
//! ```text
//! +------------------+------------------+
//! | Length (4 bytes) | XDR Message Body |
//! +------------------+------------------+
//! ```
//!
//! Bit 31 of the length is the record-mark flag; it is set on everything
//! except HELLO. Bits 0-30 carry the body length.

use crate::{OverlayError, Result};
use bytes::{Buf, BufMut, BytesMut};
use stellar_xdr::curr::{AuthenticatedMessage, Limits, ReadXdr, StellarMessage, WriteXdr};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted once the connection is authenticated (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest frame accepted before authentication completes.
pub const MAX_UNAUTHENTICATED_MESSAGE_SIZE: usize = 4096;

/// Smallest valid body: version discriminant, sequence, MAC.
const MIN_MESSAGE_SIZE: usize = 12;

const RECORD_MARK: u32 = 0x8000_0000;

/// A decoded frame plus its on-wire body length.
#[derive(Debug)]
pub struct MessageFrame {
    pub message: AuthenticatedMessage,
    pub raw_len: usize,
}

/// Streaming length-prefixed codec, usable with `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct MessageCodec {
    decode_state: DecodeState,
    authenticated: bool,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    ReadingLength,
    ReadingBody {
        len: usize,
    },
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifts the frame size limit to [`MAX_MESSAGE_SIZE`].
    pub fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    fn max_size(&self) -> usize {
        if self.authenticated {
            MAX_MESSAGE_SIZE
        } else {
            MAX_UNAUTHENTICATED_MESSAGE_SIZE
        }
    }

    /// Encodes a message with its length prefix.
    pub fn encode_message(message: &AuthenticatedMessage) -> Result<Vec<u8>> {
        let body = message.to_xdr(Limits::none())?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(OverlayError::MessageTooLarge {
                size: body.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32 | record_mark(message)).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decodes a frame body (without its length prefix).
    pub fn decode_message(bytes: &[u8]) -> Result<AuthenticatedMessage> {
        AuthenticatedMessage::from_xdr(bytes, Limits::none())
            .map_err(|e| OverlayError::Message(format!("failed to decode XDR: {}", e)))
    }
}

fn record_mark(message: &AuthenticatedMessage) -> u32 {
    match message {
        AuthenticatedMessage::V0(v0) if matches!(v0.message, StellarMessage::Hello(_)) => 0,
        AuthenticatedMessage::V0(_) => RECORD_MARK,
    }
}

impl Decoder for MessageCodec {
    type Item = MessageFrame;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.decode_state {
                DecodeState::ReadingLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let raw = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    let len = (raw & !RECORD_MARK) as usize;

                    if len < MIN_MESSAGE_SIZE {
                        return Err(OverlayError::Message(format!(
                            "message too small: {} bytes",
                            len
                        )));
                    }
                    let limit = self.max_size();
                    if len > limit {
                        return Err(OverlayError::MessageTooLarge { size: len, limit });
                    }

                    src.advance(4);
                    src.reserve(len);
                    self.decode_state = DecodeState::ReadingBody { len };
                }
                DecodeState::ReadingBody { len } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.decode_state = DecodeState::ReadingLength;
                    let message = Self::decode_message(&body)?;
                    return Ok(Some(MessageFrame {
                        message,
                        raw_len: len,
                    }));
                }
            }
        }
    }
}

impl Encoder<AuthenticatedMessage> for MessageCodec {
    type Error = OverlayError;

    fn encode(&mut self, message: AuthenticatedMessage, dst: &mut BytesMut) -> Result<()> {
        let body = message.to_xdr(Limits::none())?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(OverlayError::MessageTooLarge {
                size: body.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32 | record_mark(&message));
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Message classification helpers.
pub mod helpers {
    use stellar_xdr::curr::StellarMessage;

    /// Flood-class messages are governed by flow-control credit.
    pub fn is_flood_message(message: &StellarMessage) -> bool {
        matches!(
            message,
            StellarMessage::Transaction(_)
                | StellarMessage::ScpMessage(_)
                | StellarMessage::FloodAdvert(_)
                | StellarMessage::FloodDemand(_)
        )
    }

    /// Wire name of the message type, as used in drop reasons and metric names.
    pub fn message_type_name(message: &StellarMessage) -> &'static str {
        match message {
            StellarMessage::ErrorMsg(_) => "ERROR",
            StellarMessage::Hello(_) => "HELLO",
            StellarMessage::Auth(_) => "AUTH",
            StellarMessage::DontHave(_) => "DONT_HAVE",
            StellarMessage::GetPeers => "GET_PEERS",
            StellarMessage::Peers(_) => "PEERS",
            StellarMessage::GetTxSet(_) => "GET_TX_SET",
            StellarMessage::TxSet(_) => "TX_SET",
            StellarMessage::GeneralizedTxSet(_) => "GENERALIZED_TX_SET",
            StellarMessage::Transaction(_) => "TRANSACTION",
            StellarMessage::GetScpQuorumset(_) => "GET_SCP_QUORUMSET",
            StellarMessage::ScpQuorumset(_) => "SCP_QUORUMSET",
            StellarMessage::ScpMessage(_) => "SCP_MESSAGE",
            StellarMessage::GetScpState(_) => "GET_SCP_STATE",
            StellarMessage::SendMore(_) => "SEND_MORE",
            StellarMessage::SendMoreExtended(_) => "SEND_MORE_EXTENDED",
            StellarMessage::FloodAdvert(_) => "FLOOD_ADVERT",
            StellarMessage::FloodDemand(_) => "FLOOD_DEMAND",
            other => other.name(),
        }
    }
}
