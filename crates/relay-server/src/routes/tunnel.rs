//! Tunnel endpoint: accepts the client's long-lived WebSocket at `/ws`,
//! authenticates it, binds it to a subdomain, and dispatches every inbound
//! protocol message for the lifetime of the session.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_proto::{codec, ControlAction, ControlPayload, Envelope, ErrorCode, PayloadKind};

use crate::close_code;
use crate::registry::{OutboundMessage, ReplyError, Tunnel};
use crate::routes::{close_socket, public_ws};
use crate::state::AppState;
use crate::subdomain;

#[derive(Deserialize)]
pub struct TunnelQuery {
    secret: Option<String>,
    subdomain: Option<String>,
}

pub async fn tunnel_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TunnelQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let secret = query
        .secret
        .or_else(|| header_value(&headers, "x-secret-key"));
    let requested = query
        .subdomain
        .or_else(|| header_value(&headers, "x-subdomain"));

    // Validation outcomes are delivered post-upgrade as WS close codes, so
    // clients can distinguish policy violations from try-again-later.
    ws.on_upgrade(move |socket| handle_tunnel(socket, state, secret, requested))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Constant-time membership test against the allow-list.
fn verify_secret(candidate: Option<&str>, allow_list: &[String]) -> bool {
    let Some(candidate) = candidate else {
        return false;
    };
    allow_list
        .iter()
        .fold(false, |found, key| found | bool::from(candidate.as_bytes().ct_eq(key.as_bytes())))
}

/// DNS-label shape: lowercase alphanumeric edges, inner hyphens, max 63.
pub fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let only_allowed = label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    only_allowed && !label.starts_with('-') && !label.ends_with('-')
}

async fn handle_tunnel(
    socket: WebSocket,
    state: Arc<AppState>,
    secret: Option<String>,
    requested: Option<String>,
) {
    if !verify_secret(secret.as_deref(), &state.settings.secret_keys) {
        warn!("Tunnel rejected: invalid or missing secret");
        close_socket(socket, close_code::POLICY_VIOLATION, "invalid secret key").await;
        return;
    }

    if state.registry.tunnel_count() >= state.settings.max_tunnels {
        warn!(limit = state.settings.max_tunnels, "Tunnel rejected: tunnel limit reached");
        close_socket(socket, close_code::TRY_AGAIN_LATER, "tunnel limit reached").await;
        return;
    }

    let requested = requested.filter(|label| !label.is_empty());
    let subdomain = match requested {
        Some(label) => {
            if !is_valid_label(&label) {
                warn!(subdomain = %label, "Tunnel rejected: invalid subdomain format");
                close_socket(socket, close_code::POLICY_VIOLATION, "invalid subdomain").await;
                return;
            }
            if state.registry.has(&label) {
                warn!(subdomain = %label, "Tunnel rejected: subdomain already taken");
                close_socket(socket, close_code::POLICY_VIOLATION, "subdomain already taken").await;
                return;
            }
            label
        }
        None => match subdomain::generate(&state.registry) {
            Some(label) => label,
            None => {
                warn!("Tunnel rejected: subdomain generation exhausted");
                close_socket(socket, close_code::TRY_AGAIN_LATER, "no subdomain available").await;
                return;
            }
        },
    };

    let (out_tx, out_rx) = mpsc::channel::<OutboundMessage>(64);
    let tunnel = Arc::new(Tunnel::new(subdomain.clone(), out_tx));
    if !state.registry.register(&subdomain, tunnel.clone()) {
        // Lost the allocation race to a concurrent registration.
        warn!(subdomain = %subdomain, "Tunnel rejected: subdomain registered concurrently");
        close_socket(socket, close_code::POLICY_VIOLATION, "subdomain already taken").await;
        return;
    }

    let public_url = state.settings.public_url(&subdomain);
    info!(subdomain = %subdomain, %public_url, "Tunnel registered");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let registered = Envelope::control(
        relay_proto::new_correlation_id(),
        ControlPayload::registered(subdomain.as_str(), public_url.as_str()),
    );
    if tunnel.send(OutboundMessage::Envelope(registered)).await.is_ok() {
        read_loop(stream, &state, &tunnel).await;
    }

    state.registry.unregister_exact(&tunnel);
    let _ = tunnel.try_send(OutboundMessage::Close {
        code: close_code::GOING_AWAY,
        reason: String::new(),
    });
    drop(tunnel);
    let _ = writer.await;
    info!(subdomain = %subdomain, "Tunnel closed");
}

/// Sole writer for this session's socket; everything outbound funnels
/// through the tunnel's queue.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(message) = out_rx.recv().await {
        match message {
            OutboundMessage::Envelope(envelope) => {
                let bytes = codec::encode(&envelope);
                if sink.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            OutboundMessage::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WebSocket>, state: &Arc<AppState>, tunnel: &Arc<Tunnel>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(bytes)) => dispatch_message(state, tunnel, &bytes).await,
            Ok(Message::Text(_)) => {
                // A peer still speaking the retired text protocol. Answer
                // with a protocol error and keep the connection open so it
                // can retry in binary.
                warn!(subdomain = %tunnel.subdomain, "Text frame on binary protocol");
                reply_protocol_error(tunnel, "binary envelopes required").await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong are handled by the library
            Err(e) => {
                warn!(subdomain = %tunnel.subdomain, "Tunnel socket error: {e}");
                break;
            }
        }
    }
}

async fn dispatch_message(state: &Arc<AppState>, tunnel: &Arc<Tunnel>, bytes: &[u8]) {
    let envelope = match codec::decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            // Decode errors are local to the message, never fatal to the
            // session.
            if codec::looks_textual(bytes) {
                warn!(subdomain = %tunnel.subdomain, "Peer appears to speak the text protocol");
            }
            warn!(subdomain = %tunnel.subdomain, size = bytes.len(), "Undecodable message: {e}");
            reply_protocol_error(tunnel, e.to_string()).await;
            return;
        }
    };

    let correlation_id = envelope.correlation_id.clone();
    match envelope.into_payload_kind() {
        Some(PayloadKind::Response(response)) => {
            state.registry.complete_pending(&correlation_id, response);
        }
        Some(PayloadKind::Error(error)) => {
            state
                .registry
                .complete_pending_exceptionally(&correlation_id, ReplyError::Upstream(error));
        }
        Some(PayloadKind::WebSocketFrame(frame)) => {
            public_ws::route_frame(tunnel, &correlation_id, frame).await;
        }
        Some(PayloadKind::Control(control)) => match control.action_opt() {
            Some(ControlAction::Heartbeat) => tunnel.touch(),
            Some(ControlAction::Unregister) => {
                info!(subdomain = %tunnel.subdomain, "Client requested unregistration");
                state.registry.unregister(&tunnel.subdomain);
            }
            other => debug!(subdomain = %tunnel.subdomain, action = ?other, "Ignoring control message"),
        },
        Some(PayloadKind::Request(_)) => {
            warn!(subdomain = %tunnel.subdomain, %correlation_id, "Unexpected REQUEST from client, ignoring");
        }
        None => {
            warn!(subdomain = %tunnel.subdomain, %correlation_id, "Envelope without payload, ignoring");
        }
    }
}

async fn reply_protocol_error(tunnel: &Tunnel, message: impl Into<String>) {
    let envelope = Envelope::error(relay_proto::new_correlation_id(), ErrorCode::ProtocolError, message);
    let _ = tunnel.send(OutboundMessage::Envelope(envelope)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_must_match_allow_list() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        assert!(verify_secret(Some("k1"), &keys));
        assert!(verify_secret(Some("k2"), &keys));
        assert!(!verify_secret(Some("k3"), &keys));
        assert!(!verify_secret(Some(""), &keys));
        assert!(!verify_secret(None, &keys));
        assert!(!verify_secret(Some("k1"), &[]));
    }

    #[test]
    fn label_validation_boundaries() {
        assert!(is_valid_label("abc"));
        assert!(is_valid_label("a"));
        assert!(is_valid_label("my-app-2"));
        assert!(is_valid_label(&"a".repeat(63)));

        assert!(!is_valid_label(""));
        assert!(!is_valid_label("-x"));
        assert!(!is_valid_label("x-"));
        assert!(!is_valid_label("Upper"));
        assert!(!is_valid_label("a_b"));
        assert!(!is_valid_label(&"a".repeat(64)));
    }
}
