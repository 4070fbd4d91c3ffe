//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers and any
//! client-supplied Authorization, and forwards to the upstream URL through
//! `RequestGateway`, which attaches the session credential. A 401 from
//! upstream triggers one refresh and one retry; any other upstream status
//! is returned verbatim.

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use gateway::{CallError, RequestGateway};
use reqwest::header::{AUTHORIZATION, HOST, HeaderMap};
use tracing::{error, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest inbound body the proxy buffers
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub gateway: RequestGateway,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// HTTP status for a gateway failure.
///
/// Credential problems are the caller's to fix (log in again), so they
/// surface as 401; upstream transport failures are 502.
pub fn status_for(err: &gateway::Error) -> StatusCode {
    match err {
        gateway::Error::AuthorizationRejected(_)
        | gateway::Error::RefreshDenied(_)
        | gateway::Error::NoCredential => StatusCode::UNAUTHORIZED,
        gateway::Error::TransportFailure(_) => StatusCode::BAD_GATEWAY,
    }
}

struct Upstream {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Proxy an inbound request to upstream with the session credential attached.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    // Build the upstream URL by appending the request path and query
    let upstream_url = if let Some(pq) = uri.path_and_query() {
        format!("{}{}", state.upstream_url.trim_end_matches('/'), pq)
    } else {
        state.upstream_url.clone()
    };

    // Collect request headers, stripping hop-by-hop, Host (reqwest derives it
    // from the upstream URL) and the client's own Authorization; the gateway
    // sets the session's
    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && *name != AUTHORIZATION && *name != HOST {
            headers.insert(name.clone(), value.clone());
        }
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let result = state
        .gateway
        .execute(|credential| {
            let request = state
                .client
                .request(method.clone(), &upstream_url)
                .headers(headers.clone())
                .timeout(state.timeout)
                .body(body_bytes.clone());
            async move {
                let response = gateway::send(request, &credential).await?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| CallError::Transport(format!("upstream response read error: {e}")))?;
                Ok::<_, CallError>(Upstream {
                    status,
                    headers,
                    body,
                })
            }
        })
        .await;

    let response = match result {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "proxy_error",
                        &format!("response build error: {e}"),
                        &request_id,
                    )
                })
        }
        Err(e) => {
            match &e {
                gateway::Error::TransportFailure(_) => {
                    error!(error = %e, "upstream request failed");
                    metrics::record_upstream_error("transport");
                }
                _ => warn!(error = %e, "request not authorized"),
            }
            error_response(status_for(&e), e.label(), &e.to_string(), &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
