//! Upstream session: connects to the relay, then reads envelopes and fans
//! them out to the origin HTTP caller and the origin WebSocket bridges.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_proto::{codec, ControlAction, ControlPayload, Envelope, PayloadKind};

use crate::config::ClientConfig;
use crate::origin_ws::BridgeTable;
use crate::{origin_http, origin_ws, ClientError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug)]
pub enum SessionEnd {
    /// Interrupted locally; do not reconnect.
    Shutdown,
    /// The upstream connection ended; the reconnector decides what next.
    Closed,
}

pub async fn connect_and_serve(
    config: &ClientConfig,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, ClientError> {
    let request = config
        .server_url()
        .into_client_request()
        .map_err(|e| ClientError::Connect(format!("Invalid server URL {}: {e}", config.display_url())))?;

    info!(server = %config.display_url(), "Connecting to relay server…");
    let (ws, _response) = connect_async(request)
        .await
        .map_err(|error| classify_connect_error(error, config))?;
    info!("Connected, waiting for registration");

    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(sink, out_rx));
    let heartbeat = tokio::spawn(heartbeat_loop(out_tx.clone()));

    let bridges: BridgeTable = Arc::new(DashMap::new());
    let http = origin_http::client();

    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Interrupted, closing tunnel");
                let _ = out_tx.send(Message::Close(None)).await;
                break SessionEnd::Shutdown;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => {
                    handle_message(config, &bytes, &out_tx, &bridges, &http).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = &frame {
                        if frame.code == CloseCode::Policy {
                            heartbeat.abort();
                            bridges.clear();
                            return Err(rejection_error(frame.reason.as_str()));
                        }
                        info!(code = %frame.code, reason = %frame.reason, "Server closed the tunnel");
                    } else {
                        info!("Server closed the tunnel");
                    }
                    break SessionEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection to relay lost: {e}");
                    break SessionEnd::Closed;
                }
                None => {
                    warn!("Connection to relay closed");
                    break SessionEnd::Closed;
                }
            },
        }
    };

    heartbeat.abort();
    // Dropping the frame senders tells every bridge to release its origin WS.
    bridges.clear();
    drop(out_tx);
    // In-flight origin calls still hold queue handles; don't let a slow
    // origin delay the reconnect.
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    Ok(end)
}

/// Sole writer for the upstream socket; origin tasks and the heartbeat all
/// funnel through the queue.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || is_close {
            break;
        }
    }
}

async fn heartbeat_loop(out_tx: mpsc::Sender<Message>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let envelope = Envelope::control(relay_proto::new_correlation_id(), ControlPayload::heartbeat());
        if out_tx
            .send(Message::Binary(codec::encode(&envelope).into()))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn handle_message(
    config: &ClientConfig,
    bytes: &[u8],
    out_tx: &mpsc::Sender<Message>,
    bridges: &BridgeTable,
    http: &reqwest::Client,
) {
    let envelope = match codec::decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(size = bytes.len(), "Undecodable message from server: {e}");
            return;
        }
    };

    let correlation_id = envelope.correlation_id.clone();
    match envelope.into_payload_kind() {
        Some(PayloadKind::Request(request)) if request.web_socket_upgrade => {
            debug!(%correlation_id, path = %request.path, "External WebSocket session requested");
            let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_QUEUE);
            bridges.insert(correlation_id.clone(), frame_tx);
            tokio::spawn(origin_ws::bridge(
                config.local_url(),
                correlation_id,
                request,
                out_tx.clone(),
                bridges.clone(),
                frame_rx,
            ));
        }
        Some(PayloadKind::Request(request)) => {
            debug!(%correlation_id, method = %request.method, path = %request.path, "Forwarded request");
            tokio::spawn(origin_http::handle(
                http.clone(),
                config.local_url(),
                correlation_id,
                request,
                out_tx.clone(),
            ));
        }
        Some(PayloadKind::WebSocketFrame(frame)) => {
            let sender = bridges.get(&correlation_id).map(|entry| entry.value().clone());
            match sender {
                Some(sender) => {
                    let _ = sender.send(frame).await;
                }
                None => debug!(%correlation_id, "Frame for unknown bridge, dropping"),
            }
        }
        Some(PayloadKind::Control(control)) => match control.action_opt() {
            Some(ControlAction::Registered) => {
                let public_url = control.public_url.unwrap_or_default();
                info!("Tunnel ready: {public_url} -> localhost:{}", config.port);
            }
            Some(ControlAction::Unregister) => {
                info!("Server is shutting down this tunnel");
            }
            action => debug!(%correlation_id, ?action, "Ignoring control message"),
        },
        Some(PayloadKind::Error(error)) => {
            warn!(%correlation_id, "Error from server: {}", error.message);
        }
        Some(PayloadKind::Response(_)) => {
            warn!(%correlation_id, "Unexpected RESPONSE from server, ignoring");
        }
        None => {
            warn!(%correlation_id, "Envelope without payload, ignoring");
        }
    }
}

/// A policy-violation close is terminal: bad secret or a rejected subdomain.
fn rejection_error(reason: &str) -> ClientError {
    if reason.to_ascii_lowercase().contains("subdomain") {
        ClientError::Rejected(format!("Subdomain rejected by server: {reason}"))
    } else {
        ClientError::AuthFailed
    }
}

/// Turn a handshake failure into an actionable message. Raw error types
/// never reach the user.
fn classify_connect_error(error: tungstenite::Error, config: &ClientConfig) -> ClientError {
    let url = config.display_url();
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                401 | 403 => ClientError::AuthFailed,
                404 => ClientError::Connect(format!(
                    "Tunnel endpoint not found at {url}; is this a relay server?"
                )),
                503 => ClientError::Connect(format!(
                    "Relay server at {url} is unavailable, try again later"
                )),
                code => ClientError::Connect(format!("Relay server at {url} answered HTTP {code}")),
            }
        }
        tungstenite::Error::Tls(_) => ClientError::Connect(format!(
            "TLS certificate validation failed for {url}; if the relay uses plain ws://, retry with --insecure"
        )),
        tungstenite::Error::Io(io) => {
            let detail = io.to_string();
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                ClientError::Connect(format!("Connection refused by {url}; is the relay server running?"))
            } else if io.kind() == std::io::ErrorKind::TimedOut {
                ClientError::Connect(format!("Connection to {url} timed out"))
            } else if detail.contains("lookup") || detail.contains("resolve") {
                ClientError::Connect(format!(
                    "DNS lookup failed for {}; check the server URL",
                    config.server
                ))
            } else {
                ClientError::Connect(format!("Could not connect to {url}: {detail}"))
            }
        }
        tungstenite::Error::Url(_) => {
            ClientError::Connect(format!("Invalid server URL: {url}; check --server"))
        }
        other => ClientError::Connect(format!("Could not connect to {url}: {other}")),
    }
}
