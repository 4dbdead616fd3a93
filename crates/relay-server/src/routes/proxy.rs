//! Host-routed HTTP forwarding: the router fallback that turns an external
//! request into a REQUEST envelope, awaits the correlated reply from the
//! tunnel, and writes it back as the HTTP response.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use relay_proto::{Envelope, ErrorCode, RequestPayload, ResponsePayload};

use crate::registry::{OutboundMessage, ReplyError, TunnelRegistry};
use crate::routes::public_ws;
use crate::state::AppState;

/// Hop-by-hop headers stripped from responses on the return path.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const ALLOWED_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

struct Reject {
    status: StatusCode,
    message: String,
}

impl Reject {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for Reject {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Removes the pending entry when the handler exits on any path, including
/// an external client disconnect that drops the future mid-await. Terminal
/// completions have already taken the entry out, making this a noop then.
struct PendingGuard<'a> {
    registry: &'a TunnelRegistry,
    subdomain: &'a str,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister_pending(self.subdomain, self.correlation_id);
    }
}

pub async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    // A WebSocket upgrade on any path belongs to the external WS proxy.
    if is_ws_upgrade(req.headers()) {
        return public_ws::handle_fallback_upgrade(state, req).await;
    }
    match forward(state, req).await {
        Ok(response) => response,
        Err(reject) => reject.into_response(),
    }
}

pub(crate) fn is_ws_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn forward(state: Arc<AppState>, req: Request<Body>) -> Result<Response, Reject> {
    if !ALLOWED_METHODS.contains(req.method()) {
        return Err(Reject::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
    }

    let subdomain = resolve_subdomain(req.headers(), &state.settings.domain)
        .ok_or_else(|| Reject::new(StatusCode::BAD_REQUEST, "Missing or invalid Host header"))?;

    let tunnel = state.registry.lookup(&subdomain).ok_or_else(|| {
        debug!(subdomain = %subdomain, "Unknown tunnel subdomain");
        Reject::new(
            StatusCode::NOT_FOUND,
            format!("No tunnel registered for '{subdomain}'"),
        )
    })?;
    if !tunnel.is_active() {
        return Err(Reject::new(StatusCode::SERVICE_UNAVAILABLE, "Tunnel is not active"));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri());
    let headers = headers_to_map(req.headers());

    let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        let bytes = to_bytes(req.into_body(), state.settings.max_body_size)
            .await
            .map_err(|_| {
                Reject::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body exceeds the configured maximum",
                )
            })?;
        if bytes.is_empty() {
            None
        } else {
            Some(bytes.to_vec())
        }
    } else {
        None
    };

    let correlation_id = relay_proto::new_correlation_id();
    let (reply_tx, reply_rx) = oneshot::channel();
    if !state
        .registry
        .register_pending(&subdomain, &correlation_id, reply_tx)
    {
        return Err(Reject::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Correlation id collision",
        ));
    }
    let _guard = PendingGuard {
        registry: &state.registry,
        subdomain: &subdomain,
        correlation_id: &correlation_id,
    };

    let envelope = Envelope::request(
        correlation_id.as_str(),
        RequestPayload {
            method: method.to_string(),
            path,
            headers,
            query,
            body,
            web_socket_upgrade: false,
        },
    );

    if tunnel.send(OutboundMessage::Envelope(envelope)).await.is_err() {
        return Err(Reject::new(
            StatusCode::BAD_GATEWAY,
            "Error from tunnel: session closed",
        ));
    }

    match tokio::time::timeout(state.settings.request_timeout(), reply_rx).await {
        Err(_elapsed) => {
            warn!(subdomain = %subdomain, %correlation_id, "Request to tunnel timed out");
            Err(Reject::new(StatusCode::GATEWAY_TIMEOUT, "Request to tunnel timed out"))
        }
        Ok(Err(_dropped)) => Err(Reject::new(StatusCode::SERVICE_UNAVAILABLE, "Tunnel disconnected")),
        Ok(Ok(Err(ReplyError::Cancelled))) => {
            Err(Reject::new(StatusCode::SERVICE_UNAVAILABLE, "Tunnel disconnected"))
        }
        Ok(Ok(Err(ReplyError::Upstream(error)))) => {
            let status = if error.code_opt() == Some(ErrorCode::Timeout) {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            Err(Reject::new(status, format!("Error from tunnel: {}", error.message)))
        }
        Ok(Ok(Ok(response))) => Ok(build_response(response)),
    }
}

/// Subdomain resolution: `X-Relay-Subdomain` override first, else the Host
/// header with any port stripped; a host under the base domain yields its
/// prefix, anything else its first label.
pub fn resolve_subdomain(headers: &HeaderMap, base_domain: &str) -> Option<String> {
    if let Some(value) = headers
        .get("x-relay-subdomain")
        .and_then(|value| value.to_str().ok())
    {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_ascii_lowercase());
        }
    }

    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or_default().trim();
    if host.is_empty() {
        return None;
    }
    let suffix = format!(".{base_domain}");
    let label = match host.strip_suffix(suffix.as_str()) {
        Some(prefix) => prefix,
        None => host.split('.').next().unwrap_or_default(),
    };
    if label.is_empty() {
        None
    } else {
        Some(label.to_ascii_lowercase())
    }
}

pub(crate) fn parse_query(uri: &Uri) -> HashMap<String, String> {
    let Some(query) = uri.query() else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

/// Case-insensitive mapping; duplicate names keep the last value.
pub(crate) fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn build_response(payload: ResponsePayload) -> Response {
    let status =
        StatusCode::from_u16(payload.status_code as u16).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &payload.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    let body = payload.body.map(Body::from).unwrap_or_else(Body::empty);
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::registry::Tunnel;
    use crate::{build_router, close_code};
    use axum::body::Bytes;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::try_from(*value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn subdomain_from_override_header() {
        let headers = headers(&[("x-relay-subdomain", "abc"), ("host", "tun.example.com")]);
        assert_eq!(resolve_subdomain(&headers, "tun.example.com"), Some("abc".to_string()));
    }

    #[test]
    fn subdomain_from_host_under_base_domain() {
        let headers = headers(&[("host", "abc.tun.example.com")]);
        assert_eq!(resolve_subdomain(&headers, "tun.example.com"), Some("abc".to_string()));
    }

    #[test]
    fn subdomain_host_port_is_stripped() {
        let headers = headers(&[("host", "abc.tun.example.com:8443")]);
        assert_eq!(resolve_subdomain(&headers, "tun.example.com"), Some("abc".to_string()));
    }

    #[test]
    fn subdomain_from_foreign_host_takes_first_label() {
        let headers = headers(&[("host", "abc.other.org")]);
        assert_eq!(resolve_subdomain(&headers, "tun.example.com"), Some("abc".to_string()));
    }

    #[test]
    fn subdomain_missing_host_is_none() {
        assert_eq!(resolve_subdomain(&HeaderMap::new(), "tun.example.com"), None);
        let blank = headers(&[("host", "")]);
        assert_eq!(resolve_subdomain(&blank, "tun.example.com"), None);
    }

    #[test]
    fn subdomain_is_lowercased() {
        let headers = headers(&[("host", "ABC.tun.example.com")]);
        // Host comparison is exact, so an uppercased host misses the base
        // suffix and falls back to its first label.
        assert_eq!(resolve_subdomain(&headers, "tun.example.com"), Some("abc".to_string()));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_from_responses() {
        let mut response_headers = HashMap::new();
        response_headers.insert("Content-Type".to_string(), "text/plain".to_string());
        response_headers.insert("Connection".to_string(), "keep-alive".to_string());
        response_headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        response_headers.insert("X-Origin".to_string(), "yes".to_string());
        let response = build_response(ResponsePayload {
            status_code: 201,
            headers: response_headers,
            body: Some(b"done".to_vec()),
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("content-type"));
        assert!(response.headers().contains_key("x-origin"));
        assert!(!response.headers().contains_key("connection"));
        assert!(!response.headers().contains_key("transfer-encoding"));
    }

    #[test]
    fn invalid_status_code_maps_to_bad_gateway() {
        let response = build_response(ResponsePayload {
            status_code: 9999,
            headers: HashMap::new(),
            body: None,
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn query_parsing_decodes_pairs() {
        let uri: Uri = "http://abc.tun.example.com/search?q=hello%20world&page=2"
            .parse()
            .unwrap();
        let query = parse_query(&uri);
        assert_eq!(query.get("q").map(String::as_str), Some("hello world"));
        assert_eq!(query.get("page").map(String::as_str), Some("2"));
    }

    // ── Router-level tests ────────────────────────────────────────────

    fn test_settings() -> ServerSettings {
        ServerSettings {
            domain: "tun.example.com".to_string(),
            secret_keys: vec!["k1".to_string()],
            request_timeout: 1,
            max_body_size: 64,
            ..Default::default()
        }
    }

    /// A tunnel whose client echoes every forwarded request back as a fixed
    /// 200 response carrying the request body.
    fn spawn_echo_tunnel(state: &Arc<AppState>, subdomain: &str) {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        state
            .registry
            .register(subdomain, Arc::new(Tunnel::new(subdomain, out_tx)));
        let registry_state = state.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let OutboundMessage::Envelope(envelope) = message {
                    let id = envelope.correlation_id.clone();
                    if let Some(relay_proto::PayloadKind::Request(request)) =
                        envelope.into_payload_kind()
                    {
                        let mut headers = HashMap::new();
                        headers.insert("x-echo-method".to_string(), request.method.clone());
                        headers.insert("Connection".to_string(), "close".to_string());
                        registry_state.registry.complete_pending(
                            &id,
                            ResponsePayload {
                                status_code: 200,
                                headers,
                                body: request.body.or_else(|| Some(b"pong".to_vec())),
                            },
                        );
                    }
                }
            }
        });
    }

    async fn send(
        state: Arc<AppState>,
        request: Request<Body>,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let response = build_router(state).oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        (parts.status, parts.headers, bytes)
    }

    #[tokio::test]
    async fn get_is_forwarded_and_replied() {
        let state = Arc::new(AppState::new(test_settings()));
        spawn_echo_tunnel(&state, "abc");
        let request = Request::builder()
            .uri("/ping")
            .header("host", "abc.tun.example.com")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), b"pong");
        assert_eq!(headers.get("x-echo-method").unwrap(), "GET");
        // Hop-by-hop header from the origin must not reach the caller.
        assert!(!headers.contains_key("connection"));
    }

    #[tokio::test]
    async fn post_body_travels_verbatim() {
        let state = Arc::new(AppState::new(test_settings()));
        spawn_echo_tunnel(&state, "abc");
        let request = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header("host", "abc.tun.example.com")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"k":"v"}"#))
            .unwrap();
        let (status, _, body) = send(state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), br#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn unknown_subdomain_is_404() {
        let state = Arc::new(AppState::new(test_settings()));
        let request = Request::builder()
            .uri("/ping")
            .header("host", "nope.tun.example.com")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_host_is_400() {
        let state = Arc::new(AppState::new(test_settings()));
        let request = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let (status, _, _) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn disallowed_method_is_405() {
        let state = Arc::new(AppState::new(test_settings()));
        spawn_echo_tunnel(&state, "abc");
        let request = Request::builder()
            .method(Method::TRACE)
            .uri("/ping")
            .header("host", "abc.tun.example.com")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(state, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn body_at_limit_passes_beyond_limit_is_413() {
        let state = Arc::new(AppState::new(test_settings()));
        spawn_echo_tunnel(&state, "abc");

        let at_limit = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header("host", "abc.tun.example.com")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let (status, _, body) = send(state.clone(), at_limit).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 64);

        let over_limit = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header("host", "abc.tun.example.com")
            .body(Body::from(vec![b'x'; 65]))
            .unwrap();
        let (status, _, _) = send(state, over_limit).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn silent_tunnel_times_out_with_504() {
        let state = Arc::new(AppState::new(test_settings()));
        let (out_tx, _out_rx) = mpsc::channel(16);
        state
            .registry
            .register("abc", Arc::new(Tunnel::new("abc", out_tx)));

        let request = Request::builder()
            .uri("/slow")
            .header("host", "abc.tun.example.com")
            .body(Body::empty())
            .unwrap();
        let started = std::time::Instant::now();
        let (status, _, _) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() >= Duration::from_secs(1));
        // The pending entry must not leak past the timeout.
        assert_eq!(state.registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn tunnel_loss_fails_in_flight_requests_with_503() {
        let mut settings = test_settings();
        settings.request_timeout = 5;
        let state = Arc::new(AppState::new(settings));
        let (out_tx, _out_rx) = mpsc::channel(16);
        state
            .registry
            .register("abc", Arc::new(Tunnel::new("abc", out_tx)));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let request = Request::builder()
                    .uri("/inflight")
                    .header("host", "abc.tun.example.com")
                    .body(Body::empty())
                    .unwrap();
                send(state, request).await.0
            }));
        }

        // Let the three requests reach their awaits, then drop the tunnel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.registry.unregister("abc");

        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert_eq!(state.registry.tunnel_count(), 0);
        assert_eq!(state.registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn upstream_error_maps_to_502() {
        let state = Arc::new(AppState::new(test_settings()));
        let (out_tx, mut out_rx) = mpsc::channel(16);
        state
            .registry
            .register("abc", Arc::new(Tunnel::new("abc", out_tx)));
        let registry_state = state.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let OutboundMessage::Envelope(envelope) = message {
                    registry_state.registry.complete_pending_exceptionally(
                        &envelope.correlation_id,
                        ReplyError::Upstream(relay_proto::ErrorPayload {
                            code: ErrorCode::UpstreamError as i32,
                            message: "connection refused".to_string(),
                        }),
                    );
                }
            }
        });

        let request = Request::builder()
            .uri("/down")
            .header("host", "abc.tun.example.com")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(String::from_utf8_lossy(&body).contains("connection refused"));
    }

    #[tokio::test]
    async fn inactive_tunnel_is_503() {
        let state = Arc::new(AppState::new(test_settings()));
        let (out_tx, _out_rx) = mpsc::channel(16);
        let tunnel = Arc::new(Tunnel::new("abc", out_tx));
        tunnel.deactivate();
        state.registry.register("abc", tunnel);

        let request = Request::builder()
            .uri("/ping")
            .header("host", "abc.tun.example.com")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(state, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn close_codes_match_protocol_table() {
        assert_eq!(close_code::GOING_AWAY, 1001);
        assert_eq!(close_code::PROTOCOL_ERROR, 1002);
        assert_eq!(close_code::POLICY_VIOLATION, 1008);
        assert_eq!(close_code::TRY_AGAIN_LATER, 1013);
    }
}
