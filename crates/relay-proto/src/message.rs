//! Protocol messages exchanged between tunnel clients and the relay server.
//!
//! Every WebSocket message carries exactly one binary-encoded [`Envelope`]
//! (protobuf wire format, one envelope per WS message, no splitting). Field
//! numbers and enum ordinals are part of the wire contract and must not be
//! reassigned.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Top-level carrier of every protocol message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Opaque id linking a request to its reply; re-echoed by the responder.
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    #[prost(enumeration = "MessageType", tag = "2")]
    pub message_type: i32,
    /// Unix epoch milliseconds.
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<Payload>,
}

/// Wrapper around the payload union.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(oneof = "PayloadKind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<PayloadKind>,
}

/// Discriminated payload union. Exactly one variant is present per envelope.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum PayloadKind {
    #[prost(message, tag = "1")]
    Request(RequestPayload),
    #[prost(message, tag = "2")]
    Response(ResponsePayload),
    #[prost(message, tag = "3")]
    Error(ErrorPayload),
    #[prost(message, tag = "4")]
    Control(ControlPayload),
    #[prost(message, tag = "5")]
    WebSocketFrame(WebSocketFramePayload),
}

/// A forwarded HTTP request, or the initial upgrade of an external WebSocket
/// when `web_socket_upgrade` is set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestPayload {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(map = "string, string", tag = "3")]
    pub headers: HashMap<String, String>,
    #[prost(map = "string, string", tag = "4")]
    pub query: HashMap<String, String>,
    /// Raw body bytes. Deliberately not base64: bodies travel verbatim.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub body: Option<Vec<u8>>,
    #[prost(bool, tag = "6")]
    pub web_socket_upgrade: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponsePayload {
    #[prost(int32, tag = "1")]
    pub status_code: i32,
    #[prost(map = "string, string", tag = "2")]
    pub headers: HashMap<String, String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub body: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorPayload {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlPayload {
    #[prost(enumeration = "ControlAction", tag = "1")]
    pub action: i32,
    #[prost(string, optional, tag = "2")]
    pub subdomain: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub public_url: Option<String>,
}

/// A single WebSocket frame relayed between an external client and the
/// origin, keyed by the correlation id of its proxy session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebSocketFramePayload {
    #[prost(enumeration = "FrameType", tag = "1")]
    pub frame_type: i32,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,
    #[prost(bool, tag = "3")]
    pub is_binary: bool,
    #[prost(int32, optional, tag = "4")]
    pub close_code: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub close_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    Control = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Timeout = 0,
    UpstreamError = 1,
    InvalidRequest = 2,
    ServerError = 3,
    RateLimited = 4,
    ProtocolError = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ControlAction {
    Register = 0,
    Registered = 1,
    Unregister = 2,
    Heartbeat = 3,
    Status = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameType {
    Text = 0,
    Binary = 1,
    Ping = 2,
    Pong = 3,
    Close = 4,
}

/// Current time as Unix epoch milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Fresh opaque correlation id.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Envelope {
    fn with_payload(correlation_id: impl Into<String>, message_type: MessageType, kind: PayloadKind) -> Self {
        Envelope {
            correlation_id: correlation_id.into(),
            message_type: message_type as i32,
            timestamp: unix_millis(),
            payload: Some(Payload { kind: Some(kind) }),
        }
    }

    pub fn request(correlation_id: impl Into<String>, request: RequestPayload) -> Self {
        Self::with_payload(correlation_id, MessageType::Request, PayloadKind::Request(request))
    }

    pub fn response(correlation_id: impl Into<String>, response: ResponsePayload) -> Self {
        Self::with_payload(correlation_id, MessageType::Response, PayloadKind::Response(response))
    }

    pub fn error(correlation_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::with_payload(
            correlation_id,
            MessageType::Error,
            PayloadKind::Error(ErrorPayload {
                code: code as i32,
                message: message.into(),
            }),
        )
    }

    pub fn control(correlation_id: impl Into<String>, control: ControlPayload) -> Self {
        Self::with_payload(correlation_id, MessageType::Control, PayloadKind::Control(control))
    }

    /// WebSocket frames travel as REQUEST-typed envelopes; the payload
    /// discriminator identifies them on the receiving side.
    pub fn web_socket_frame(correlation_id: impl Into<String>, frame: WebSocketFramePayload) -> Self {
        Self::with_payload(correlation_id, MessageType::Request, PayloadKind::WebSocketFrame(frame))
    }

    pub fn payload_kind(&self) -> Option<&PayloadKind> {
        self.payload.as_ref().and_then(|p| p.kind.as_ref())
    }

    pub fn into_payload_kind(self) -> Option<PayloadKind> {
        self.payload.and_then(|p| p.kind)
    }
}

impl ControlPayload {
    pub fn registered(subdomain: impl Into<String>, public_url: impl Into<String>) -> Self {
        ControlPayload {
            action: ControlAction::Registered as i32,
            subdomain: Some(subdomain.into()),
            public_url: Some(public_url.into()),
        }
    }

    pub fn heartbeat() -> Self {
        ControlPayload {
            action: ControlAction::Heartbeat as i32,
            subdomain: None,
            public_url: None,
        }
    }

    pub fn unregister() -> Self {
        ControlPayload {
            action: ControlAction::Unregister as i32,
            subdomain: None,
            public_url: None,
        }
    }

    pub fn action_opt(&self) -> Option<ControlAction> {
        ControlAction::try_from(self.action).ok()
    }
}

impl WebSocketFramePayload {
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        WebSocketFramePayload {
            frame_type: FrameType::Text as i32,
            data: Some(data.into()),
            is_binary: false,
            close_code: None,
            close_reason: None,
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        WebSocketFramePayload {
            frame_type: FrameType::Binary as i32,
            data: Some(data.into()),
            is_binary: true,
            close_code: None,
            close_reason: None,
        }
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        WebSocketFramePayload {
            frame_type: FrameType::Ping as i32,
            data: Some(data.into()),
            is_binary: false,
            close_code: None,
            close_reason: None,
        }
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        WebSocketFramePayload {
            frame_type: FrameType::Pong as i32,
            data: Some(data.into()),
            is_binary: false,
            close_code: None,
            close_reason: None,
        }
    }

    pub fn close(code: Option<u16>, reason: Option<String>) -> Self {
        WebSocketFramePayload {
            frame_type: FrameType::Close as i32,
            data: None,
            is_binary: false,
            close_code: code.map(i32::from),
            close_reason: reason,
        }
    }

    pub fn frame_type_opt(&self) -> Option<FrameType> {
        FrameType::try_from(self.frame_type).ok()
    }
}

impl ErrorPayload {
    pub fn code_opt(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.code).ok()
    }
}
