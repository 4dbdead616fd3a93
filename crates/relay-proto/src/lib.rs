//! Wire protocol shared by the relay server and tunnel client.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, looks_textual, ProtocolError};
pub use message::{
    new_correlation_id, unix_millis, ControlAction, ControlPayload, Envelope, ErrorCode,
    ErrorPayload, FrameType, MessageType, Payload, PayloadKind, RequestPayload, ResponsePayload,
    WebSocketFramePayload,
};
