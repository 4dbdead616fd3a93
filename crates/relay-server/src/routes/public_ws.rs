//! External WebSocket proxy: terminates an external WS connection, forwards
//! its upgrade to the tunnel as a REQUEST{webSocketUpgrade}, then shuttles
//! frames in both directions until either side closes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequest, Query, State,
    },
    http::{HeaderMap, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_proto::{Envelope, FrameType, RequestPayload, WebSocketFramePayload};

use crate::close_code;
use crate::registry::{ExternalProxySession, OutboundMessage, SessionClosed, Tunnel};
use crate::routes::proxy::{parse_query, resolve_subdomain};
use crate::routes::close_socket;
use crate::state::AppState;

/// Handshake headers forwarded with the upgrade request.
const UPGRADE_HEADERS: &[&str] = &[
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
];

#[derive(Deserialize)]
pub struct PubQuery {
    /// Tooling that cannot control Host carries the subdomain here.
    #[serde(rename = "X-Relay-Subdomain")]
    subdomain: Option<String>,
}

pub async fn public_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PubQuery>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let subdomain = query
        .subdomain
        .filter(|value| !value.is_empty())
        .or_else(|| resolve_subdomain(&headers, &state.settings.domain));
    let path = uri.path().to_string();
    let query_map = parse_query(&uri);
    let upgrade_headers = collect_upgrade_headers(&headers);

    ws.on_upgrade(move |socket| {
        handle_external(socket, state, subdomain, path, query_map, upgrade_headers)
    })
}

/// Entry point for WS upgrades arriving on arbitrary paths via the proxy
/// fallback.
pub async fn handle_fallback_upgrade(state: Arc<AppState>, req: Request<Body>) -> Response {
    let headers = req.headers().clone();
    let uri = req.uri().clone();

    let query_map = parse_query(&uri);
    let subdomain = query_map
        .get("X-Relay-Subdomain")
        .filter(|value| !value.is_empty())
        .cloned()
        .or_else(|| resolve_subdomain(&headers, &state.settings.domain));
    let path = uri.path().to_string();
    let upgrade_headers = collect_upgrade_headers(&headers);

    match WebSocketUpgrade::from_request(req, &state).await {
        Ok(ws) => ws
            .on_upgrade(move |socket| {
                handle_external(socket, state, subdomain, path, query_map, upgrade_headers)
            })
            .into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn collect_upgrade_headers(headers: &HeaderMap) -> HashMap<String, String> {
    UPGRADE_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

async fn handle_external(
    socket: WebSocket,
    state: Arc<AppState>,
    subdomain: Option<String>,
    path: String,
    query: HashMap<String, String>,
    upgrade_headers: HashMap<String, String>,
) {
    let Some(subdomain) = subdomain else {
        close_socket(socket, close_code::PROTOCOL_ERROR, "subdomain required").await;
        return;
    };

    let Some(tunnel) = state.registry.lookup(&subdomain) else {
        debug!(subdomain = %subdomain, "External WS for unknown subdomain");
        close_socket(socket, close_code::GOING_AWAY, "no tunnel for subdomain").await;
        return;
    };
    if !tunnel.is_active() {
        close_socket(socket, close_code::GOING_AWAY, "tunnel is not active").await;
        return;
    }

    let correlation_id = relay_proto::new_correlation_id();
    let (frame_tx, mut frame_rx) = mpsc::channel::<WebSocketFramePayload>(64);
    tunnel.ws_proxies.insert(
        correlation_id.clone(),
        ExternalProxySession::new(&subdomain, &correlation_id, frame_tx),
    );
    info!(subdomain = %subdomain, %correlation_id, path = %path, "External WebSocket session opened");

    let upgrade = Envelope::request(
        correlation_id.as_str(),
        RequestPayload {
            method: "GET".to_string(),
            path,
            headers: upgrade_headers,
            query,
            body: None,
            web_socket_upgrade: true,
        },
    );
    if tunnel.send(OutboundMessage::Envelope(upgrade)).await.is_err() {
        tunnel.ws_proxies.remove(&correlation_id);
        close_socket(socket, close_code::GOING_AWAY, "tunnel closed").await;
        return;
    }
    // The session task never keeps the tunnel handle; replies re-resolve it
    // by subdomain so a replaced tunnel is picked up naturally.
    drop(tunnel);

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let frame = WebSocketFramePayload::text(text.as_bytes().to_vec());
                    if send_upstream(&state, &subdomain, &correlation_id, frame).await.is_err() {
                        let _ = sink.send(close_message(close_code::GOING_AWAY, "tunnel closed")).await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let frame = WebSocketFramePayload::binary(data.to_vec());
                    if send_upstream(&state, &subdomain, &correlation_id, frame).await.is_err() {
                        let _ = sink.send(close_message(close_code::GOING_AWAY, "tunnel closed")).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(frame.code), Some(frame.reason.to_string())),
                        None => (None, None),
                    };
                    let _ = send_upstream(
                        &state,
                        &subdomain,
                        &correlation_id,
                        WebSocketFramePayload::close(code, reason),
                    )
                    .await;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong are handled by the library
                Some(Err(e)) => {
                    debug!(subdomain = %subdomain, %correlation_id, "External socket error: {e}");
                    let _ = send_upstream(
                        &state,
                        &subdomain,
                        &correlation_id,
                        WebSocketFramePayload::close(Some(close_code::GOING_AWAY), None),
                    )
                    .await;
                    break;
                }
                None => {
                    let _ = send_upstream(
                        &state,
                        &subdomain,
                        &correlation_id,
                        WebSocketFramePayload::close(Some(close_code::GOING_AWAY), None),
                    )
                    .await;
                    break;
                }
            },
            outbound = frame_rx.recv() => match outbound {
                Some(frame) => {
                    if write_frame(&mut sink, frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Re-resolve: the tunnel may have been replaced or removed meanwhile.
    if let Some(tunnel) = state.registry.lookup(&subdomain) {
        tunnel.ws_proxies.remove(&correlation_id);
    }
    info!(subdomain = %subdomain, %correlation_id, "External WebSocket session closed");
}

/// Forward a frame to the tunnel, re-resolving it by subdomain.
async fn send_upstream(
    state: &AppState,
    subdomain: &str,
    correlation_id: &str,
    frame: WebSocketFramePayload,
) -> Result<(), SessionClosed> {
    let tunnel = state.registry.lookup(subdomain).ok_or(SessionClosed)?;
    if !tunnel.is_active() {
        return Err(SessionClosed);
    }
    tunnel
        .send(OutboundMessage::Envelope(Envelope::web_socket_frame(
            correlation_id,
            frame,
        )))
        .await
}

/// Write a tunnel-originated frame to the external socket. A Close frame
/// (from the origin or from tunnel-loss cleanup) terminates the writer.
async fn write_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: WebSocketFramePayload,
) -> Result<(), ()> {
    match frame.frame_type_opt() {
        Some(FrameType::Text) => {
            let data = frame.data.unwrap_or_default();
            let text = String::from_utf8_lossy(&data).into_owned();
            sink.send(Message::Text(text.into())).await.map_err(|_| ())
        }
        Some(FrameType::Binary) => {
            let data = frame.data.unwrap_or_default();
            sink.send(Message::Binary(data.into())).await.map_err(|_| ())
        }
        // The origin's ping/pong surfaces to the external client as a pong.
        Some(FrameType::Ping) | Some(FrameType::Pong) => {
            let data = frame.data.unwrap_or_default();
            sink.send(Message::Pong(data.into())).await.map_err(|_| ())
        }
        Some(FrameType::Close) => {
            let code = frame
                .close_code
                .and_then(|code| u16::try_from(code).ok())
                .unwrap_or(close_code::GOING_AWAY);
            let reason = frame.close_reason.unwrap_or_default();
            let _ = sink.send(close_message(code, &reason)).await;
            Err(())
        }
        None => {
            warn!("Unknown frame type {}, dropping", frame.frame_type);
            Ok(())
        }
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

/// Route a WEBSOCKET_FRAME envelope from the tunnel to its proxy session.
/// Called by the tunnel endpoint's dispatch loop.
pub async fn route_frame(tunnel: &Tunnel, correlation_id: &str, frame: WebSocketFramePayload) {
    let sender = match tunnel.ws_proxies.get(correlation_id) {
        Some(session) => session.frame_sender(),
        None => {
            debug!(subdomain = %tunnel.subdomain, %correlation_id, "Frame for unknown proxy session, dropping");
            return;
        }
    };
    if sender.send(frame).await.is_err() {
        debug!(subdomain = %tunnel.subdomain, %correlation_id, "Proxy session writer gone");
    }
}
