//! Origin WebSocket bridge: one outbound WS to the local origin per external
//! proxy session, pumping frames in both directions until either side closes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use relay_proto::{codec, Envelope, FrameType, RequestPayload, WebSocketFramePayload};

use crate::origin_http::serialize_query;

/// Headers the handshake owns; everything else (subprotocols, cookies, auth)
/// is carried over to the origin.
const MANAGED_HEADERS: &[&str] = &[
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
];

pub type BridgeTable = Arc<DashMap<String, mpsc::Sender<WebSocketFramePayload>>>;

pub async fn bridge(
    local_url: String,
    correlation_id: String,
    request: RequestPayload,
    out: mpsc::Sender<Message>,
    bridges: BridgeTable,
    mut frame_rx: mpsc::Receiver<WebSocketFramePayload>,
) {
    let url = websocket_url(&local_url, &request);
    let origin = match dial_origin(&url, &request.headers).await {
        Ok(origin) => origin,
        Err(message) => {
            warn!(%correlation_id, url = %url, "Origin WebSocket failed: {message}");
            let close = WebSocketFramePayload::close(Some(1011), Some(message));
            let _ = send_frame(&out, &correlation_id, close).await;
            bridges.remove(&correlation_id);
            return;
        }
    };
    info!(%correlation_id, url = %url, "Origin WebSocket bridge opened");

    let (mut sink, mut stream) = origin.split();
    loop {
        tokio::select! {
            // Frames from the external client, relayed by the server.
            frame = frame_rx.recv() => match frame {
                Some(frame) => match frame.frame_type_opt() {
                    Some(FrameType::Text) => {
                        let data = frame.data.unwrap_or_default();
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(FrameType::Binary) => {
                        let data = frame.data.unwrap_or_default();
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(FrameType::Ping) => {
                        let data = frame.data.unwrap_or_default();
                        if sink.send(Message::Ping(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(FrameType::Pong) => {
                        let data = frame.data.unwrap_or_default();
                        if sink.send(Message::Pong(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(FrameType::Close) => {
                        let _ = sink.send(close_message(&frame)).await;
                        break;
                    }
                    None => debug!(%correlation_id, "Unknown frame type, dropping"),
                },
                // Upstream gone: release the origin side too.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            // Frames from the origin, forwarded upstream.
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let frame = WebSocketFramePayload::text(text.as_bytes().to_vec());
                    if send_frame(&out, &correlation_id, frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let frame = WebSocketFramePayload::binary(data.to_vec());
                    if send_frame(&out, &correlation_id, frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let frame = WebSocketFramePayload::ping(data.to_vec());
                    if send_frame(&out, &correlation_id, frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(data))) => {
                    let frame = WebSocketFramePayload::pong(data.to_vec());
                    if send_frame(&out, &correlation_id, frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(close))) => {
                    let (code, reason) = match close {
                        Some(frame) => (
                            Some(u16::from(frame.code)),
                            Some(frame.reason.to_string()),
                        ),
                        None => (None, None),
                    };
                    let frame = WebSocketFramePayload::close(code, reason);
                    let _ = send_frame(&out, &correlation_id, frame).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%correlation_id, "Origin socket error: {e}");
                    let frame = WebSocketFramePayload::close(Some(1011), None);
                    let _ = send_frame(&out, &correlation_id, frame).await;
                    break;
                }
                None => {
                    let frame = WebSocketFramePayload::close(Some(1000), None);
                    let _ = send_frame(&out, &correlation_id, frame).await;
                    break;
                }
            },
        }
    }

    bridges.remove(&correlation_id);
    info!(%correlation_id, "Origin WebSocket bridge closed");
}

async fn dial_origin(
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    String,
> {
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid origin URL: {e}"))?;
    for (name, value) in headers {
        if MANAGED_HEADERS.iter().any(|managed| name.eq_ignore_ascii_case(managed)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            request.headers_mut().insert(name, value);
        }
    }
    match connect_async(request).await {
        Ok((ws, _)) => Ok(ws),
        Err(e) => Err(format!("origin connection failed: {e}")),
    }
}

fn close_message(frame: &WebSocketFramePayload) -> Message {
    let close = frame.close_code.and_then(|code| u16::try_from(code).ok()).map(|code| CloseFrame {
        code: CloseCode::from(code),
        reason: frame.close_reason.clone().unwrap_or_default().into(),
    });
    Message::Close(close)
}

async fn send_frame(
    out: &mpsc::Sender<Message>,
    correlation_id: &str,
    frame: WebSocketFramePayload,
) -> Result<(), ()> {
    let envelope = Envelope::web_socket_frame(correlation_id, frame);
    out.send(Message::Binary(codec::encode(&envelope).into()))
        .await
        .map_err(|_| ())
}

/// Promote the origin's HTTP URL to its WebSocket counterpart.
pub(crate) fn websocket_url(local_url: &str, request: &RequestPayload) -> String {
    let base = if let Some(rest) = local_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = local_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        local_url.to_string()
    };
    let mut url = format!("{base}{}", request.path);
    if !request.query.is_empty() {
        url.push('?');
        url.push_str(&serialize_query(&request.query));
    }
    url
}
