//! Replays forwarded HTTP requests against the local origin and turns the
//! result into a RESPONSE (or ERROR) envelope.

use std::collections::HashMap;

use reqwest::header::{HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use relay_proto::{codec, Envelope, ErrorCode, RequestPayload, ResponsePayload};

/// HTTP client for origin calls. Redirects are passed through to the
/// external caller rather than followed.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
}

struct OriginError {
    code: ErrorCode,
    message: String,
}

pub async fn handle(
    client: reqwest::Client,
    local_url: String,
    correlation_id: String,
    request: RequestPayload,
    out: mpsc::Sender<Message>,
) {
    let envelope = match call_origin(&client, &local_url, &request).await {
        Ok(response) => Envelope::response(correlation_id.as_str(), response),
        Err(error) => {
            warn!(
                %correlation_id,
                method = %request.method,
                path = %request.path,
                "Origin call failed: {}",
                error.message
            );
            Envelope::error(correlation_id.as_str(), error.code, error.message)
        }
    };
    let bytes = codec::encode(&envelope);
    if out.send(Message::Binary(bytes.into())).await.is_err() {
        debug!(%correlation_id, "Upstream writer gone, dropping reply");
    }
}

async fn call_origin(
    client: &reqwest::Client,
    local_url: &str,
    request: &RequestPayload,
) -> Result<ResponsePayload, OriginError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| OriginError {
        code: ErrorCode::InvalidRequest,
        message: format!("unsupported method '{}'", request.method),
    })?;

    let url = request_url(local_url, request);
    let mut builder = client.request(method, &url);
    for (name, value) in &request.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(map_request_error)?;

    let status_code = i32::from(response.status().as_u16());
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let body = response.bytes().await.map_err(|_| OriginError {
        code: ErrorCode::UpstreamError,
        message: "failed reading origin response body".to_string(),
    })?;

    Ok(ResponsePayload {
        status_code,
        headers,
        body: if body.is_empty() { None } else { Some(body.to_vec()) },
    })
}

/// Origin URL: local base + forwarded path + re-serialized query.
pub(crate) fn request_url(local_url: &str, request: &RequestPayload) -> String {
    let mut url = format!("{local_url}{}", request.path);
    if !request.query.is_empty() {
        url.push('?');
        url.push_str(&serialize_query(&request.query));
    }
    url
}

pub(crate) fn serialize_query(query: &HashMap<String, String>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    // Sort for a stable URL; the origin sees the same set either way.
    let mut pairs: Vec<_> = query.iter().collect();
    pairs.sort();
    for (name, value) in pairs {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

fn map_request_error(error: reqwest::Error) -> OriginError {
    if error.is_connect() {
        OriginError {
            code: ErrorCode::UpstreamError,
            message: "connection refused / host unreachable".to_string(),
        }
    } else if error.is_timeout() {
        OriginError {
            code: ErrorCode::UpstreamError,
            message: "origin request timed out".to_string(),
        }
    } else if error.is_body() || error.is_decode() {
        OriginError {
            code: ErrorCode::UpstreamError,
            message: "failed reading origin response body".to_string(),
        }
    } else {
        OriginError {
            code: ErrorCode::ServerError,
            message: format!("unexpected error calling origin: {error}"),
        }
    }
}
