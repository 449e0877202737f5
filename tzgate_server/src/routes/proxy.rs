//! Reverse proxy to the protected upstream application

use crate::client_ip::client_ip;
use crate::routes::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, Response, StatusCode},
    response::IntoResponse,
};

/// Largest request body forwarded upstream
const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward a request to the upstream application
pub async fn handle_upstream(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Response<Body> {
    let forwarded_for = client_ip(&request, state.config.trust_forwarded);
    let (parts, body) = request.into_parts();

    // Collect body
    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("Failed to read request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Failed to read body").into_response();
        }
    };

    let upstream_url = format!(
        "{}{}",
        state.config.upstream_url,
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string())
    );

    let mut upstream_request = state
        .http_client
        .request(parts.method.clone(), &upstream_url);

    // Copy headers
    for (key, value) in parts.headers.iter() {
        if is_hop_by_hop(key) || key == "host" {
            continue;
        }
        upstream_request = upstream_request.header(key, value);
    }

    if let Some(host) = parts.headers.get("host") {
        upstream_request = upstream_request.header("x-forwarded-host", host);
    }
    if let Some(ip) = forwarded_for {
        upstream_request = upstream_request.header("x-forwarded-for", ip.to_string());
    }

    match upstream_request.body(body_bytes).send().await {
        Ok(resp) => {
            let status = resp.status();
            let headers = strip_hop_by_hop(resp.headers());
            let body = match resp.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("Failed to read upstream body: {}", e);
                    return (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response();
                }
            };

            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            tracing::error!("Upstream request to {} failed: {}", upstream_url, e);
            (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers.iter() {
        if !is_hop_by_hop(key) {
            out.append(key.clone(), value.clone());
        }
    }
    out
}
