//! Decides whether a request is subject to the timezone challenge

use crate::config::VpnOptions;
use axum::http::{header, Request};

/// Check if the VPN challenge applies to a request.
///
/// Only clients that can render an interactive HTML page can answer the
/// probe, so AJAX and API clients pass straight through.
pub fn is_eligible<B>(options: &VpnOptions, request: &Request<B>) -> bool {
    if !options.enabled {
        return false;
    }

    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok());

    accepts_html(accept)
}

/// Check if an Accept header lists an HTML-family media type.
///
/// Wildcards do not count: `*/*` is what fetch and XHR send by default.
pub fn accepts_html(accept: Option<&str>) -> bool {
    let Some(accept) = accept else {
        return false;
    };

    accept.split(',').any(|range| {
        let mut params = range.split(';');
        let media_type = params.next().unwrap_or("").trim();

        let refused = params.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        if refused {
            return false;
        }

        let Some((kind, subtype)) = media_type.split_once('/') else {
            return false;
        };

        let kind_ok = !kind.is_empty()
            && kind
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        let subtype = subtype.to_ascii_lowercase();

        kind_ok && matches!(subtype.as_str(), "html" | "xhtml+xml" | "xml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(accept: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(accept) = accept {
            builder = builder.header(header::ACCEPT, accept);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn enabled() -> VpnOptions {
        VpnOptions {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_browser_accept_headers() {
        assert!(accepts_html(Some("text/html")));
        assert!(accepts_html(Some(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
        )));
        assert!(accepts_html(Some("application/xhtml+xml")));
        assert!(accepts_html(Some("TEXT/HTML")));
    }

    #[test]
    fn test_non_browser_accept_headers() {
        assert!(!accepts_html(None));
        assert!(!accepts_html(Some("")));
        assert!(!accepts_html(Some("*/*")));
        assert!(!accepts_html(Some("application/json")));
        assert!(!accepts_html(Some("application/json, text/plain, */*")));
        assert!(!accepts_html(Some("*/html")));
        assert!(!accepts_html(Some("text/html;q=0, application/json")));
    }

    #[test]
    fn test_feature_flag_off() {
        let options = VpnOptions::default();
        assert!(!is_eligible(&options, &request(Some("text/html"))));
    }

    #[test]
    fn test_feature_flag_on() {
        let options = enabled();
        assert!(is_eligible(&options, &request(Some("text/html"))));
        assert!(!is_eligible(&options, &request(Some("*/*"))));
        assert!(!is_eligible(&options, &request(None)));
    }
}
