//! Timezone probe page sent on the challenge leg

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use tzgate_common::constants;

/// The page reads the browser timezone and posts it back to the requested
/// URL. The hidden input only gets its field name once a timezone is known,
/// so a form sent without JavaScript (or when `Intl` fails) carries no answer
/// and the server falls back to the last verified timezone.
const PROBE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta name="robots" content="noindex">
    <title>Just a moment...</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #fafafa;
            color: #333;
            display: flex;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
            margin: 0;
        }
        button { font-size: 1rem; padding: 0.5rem 1rem; }
    </style>
</head>
<body>
    <form id="probe" method="post" action="{{ACTION}}">
        <input type="hidden" id="client-tz" value="">
        <noscript>
            <p>Please enable JavaScript or press continue.</p>
            <button type="submit">Continue</button>
        </noscript>
    </form>
    <script>
        (function () {
            var tz = "";
            try {
                tz = Intl.DateTimeFormat().resolvedOptions().timeZone || "";
            } catch (e) {}
            if (tz) {
                var input = document.getElementById("client-tz");
                input.name = "{{FIELD}}";
                input.value = tz;
            }
            document.getElementById("probe").submit();
        })();
    </script>
</body>
</html>
"#;

/// Render the probe page for a request target (path and query)
pub fn render(action: &str) -> Response {
    let html = PROBE_HTML
        .replace("{{ACTION}}", &escape_attr(action))
        .replace("{{FIELD}}", constants::CLIENT_TZ_FIELD);

    Response::builder()
        .status(StatusCode::from_u16(constants::PROBE_STATUS).unwrap_or(StatusCode::FOUND))
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(html))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
