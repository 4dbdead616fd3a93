//! Binary envelope codec.
//!
//! The sole entry points for putting envelopes on and off the wire. Decoding
//! never trusts its input: every failure maps to a [`ProtocolError`] that the
//! receiving side reports as `ERROR{PROTOCOL_ERROR}` without tearing down
//! the connection.

use prost::Message;
use thiserror::Error;

use crate::message::Envelope;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    /// Truncated varint, length prefix past the end of input, and any other
    /// wire-level corruption.
    #[error("malformed message: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("unknown or missing payload variant")]
    UnknownPayload,
}

/// Encode an envelope into a single binary WebSocket message.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_to_vec()
}

/// Decode a binary WebSocket message into an envelope.
///
/// Unknown field tags are skipped for forward compatibility; an envelope
/// whose payload discriminator is absent or unrecognized is rejected.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    let envelope = Envelope::decode(bytes)?;
    match &envelope.payload {
        Some(payload) if payload.kind.is_some() => Ok(envelope),
        _ => Err(ProtocolError::UnknownPayload),
    }
}

/// Heuristic for peers still speaking the retired text protocol. A binary
/// envelope always starts with a field tag byte; JSON starts with a brace
/// or bracket.
pub fn looks_textual(bytes: &[u8]) -> bool {
    matches!(bytes.first(), Some(b'{') | Some(b'['))
}
