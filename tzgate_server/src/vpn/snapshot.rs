//! Capture and replay of parked responses

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use hyper::ext::ReasonPhrase;
use tzgate_common::PendingResponse;

/// Buffer a response into a `PendingResponse`.
///
/// Fails when the body errors or exceeds `limit` bytes.
pub async fn capture(response: Response, limit: usize) -> Result<PendingResponse, axum::Error> {
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(body, limit).await?;

    let reason = match parts.extensions.get::<ReasonPhrase>() {
        Some(reason) => Some(String::from_utf8_lossy(reason.as_bytes()).into_owned()),
        None => parts.status.canonical_reason().map(str::to_string),
    };

    let charset = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(charset_of);

    let headers = parts
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v.as_bytes())))
        .collect();

    Ok(PendingResponse {
        status: parts.status.as_u16(),
        reason,
        charset,
        headers,
        body,
    })
}

/// Rebuild the response exactly as it was captured
pub fn replay(pending: PendingResponse) -> Response {
    let status = StatusCode::from_u16(pending.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(pending.body));
    *response.status_mut() = status;

    for (key, value) in pending.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_maybe_shared(value),
        ) else {
            tracing::warn!("Dropping unreplayable header {}", key);
            continue;
        };
        response.headers_mut().append(name, value);
    }

    // Only a non-standard phrase needs carrying; hyper writes the canonical one
    if let Some(reason) = pending.reason {
        if Some(reason.as_str()) != status.canonical_reason() {
            if let Ok(phrase) = ReasonPhrase::try_from(reason.into_bytes()) {
                response.extensions_mut().insert(phrase);
            }
        }
    }

    response
}

/// Extract the charset parameter of a Content-Type value
fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_ascii_lowercase())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn upstream_response() -> Response {
        Response::builder()
            .status(StatusCode::CREATED)
            .header(header::CONTENT_TYPE, "text/html; charset=ISO-8859-1")
            .header(header::SET_COOKIE, "a=1")
            .header(header::SET_COOKIE, "b=2")
            .header("x-custom", "kept")
            .body(Body::from(vec![0x3c, 0x70, 0x3e, 0xe9, 0x3c, 0x2f, 0x70, 0x3e]))
            .unwrap()
    }

    #[tokio::test]
    async fn test_capture_and_replay_is_exact() {
        let pending = capture(upstream_response(), 1024).await.unwrap();
        assert_eq!(pending.status, 201);
        assert_eq!(pending.reason.as_deref(), Some("Created"));
        assert_eq!(pending.charset.as_deref(), Some("iso-8859-1"));
        assert_eq!(pending.headers.len(), 4);

        let replayed = replay(pending);
        let original = upstream_response();

        assert_eq!(replayed.status(), original.status());
        assert_eq!(replayed.headers(), original.headers());
        assert!(replayed.extensions().get::<ReasonPhrase>().is_none());

        let replayed_body = replayed.into_body().collect().await.unwrap().to_bytes();
        let original_body = original.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(replayed_body, original_body);
    }

    #[tokio::test]
    async fn test_header_order_is_preserved() {
        let pending = capture(upstream_response(), 1024).await.unwrap();
        let names: Vec<&str> = pending.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["content-type", "set-cookie", "set-cookie", "x-custom"]);
    }

    #[tokio::test]
    async fn test_custom_reason_phrase_survives() {
        let mut response = Response::new(Body::from("teapot"));
        *response.status_mut() = StatusCode::IM_A_TEAPOT;
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Short And Stout"));

        let pending = capture(response, 1024).await.unwrap();
        assert_eq!(pending.reason.as_deref(), Some("Short And Stout"));
        assert_eq!(pending.charset, None);

        let replayed = replay(pending);
        let phrase = replayed.extensions().get::<ReasonPhrase>().unwrap();
        assert_eq!(phrase.as_bytes(), b"Short And Stout");
    }

    #[tokio::test]
    async fn test_capture_over_limit_fails() {
        let response = Response::new(Body::from(vec![b'x'; 64]));
        assert!(capture(response, 16).await.is_err());
    }

    #[test]
    fn test_charset_of() {
        assert_eq!(charset_of("text/html; charset=utf-8").as_deref(), Some("utf-8"));
        assert_eq!(charset_of("text/html;Charset=\"UTF-8\"").as_deref(), Some("utf-8"));
        assert_eq!(charset_of("text/html"), None);
        assert_eq!(charset_of("text/html; boundary=x"), None);
    }
}
