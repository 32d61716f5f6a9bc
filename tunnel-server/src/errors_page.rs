//! Styled HTML error pages: 404 unknown subdomain, 502
//! dead origin ("Connection Refused"), 504 local timeout, 503 tunnel
//! disconnected, 400 wrong protocol. Every reflected value is
//! HTML-escaped; every page carries `X-Content-Type-Options: nosniff`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// Minimal, dependency-free HTML escaping for the handful of untrusted
/// strings (host, local_url, path) these pages ever reflect.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn page(status: StatusCode, title: &str, body_html: &str) -> Response {
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
  body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif;
  background: #0f1115; color: #e6e6e6; display: flex; align-items: center;
  justify-content: center; height: 100vh; margin: 0; }}
  .card {{ max-width: 560px; padding: 2.5rem; border-radius: 12px; background: #181b21;
  box-shadow: 0 10px 30px rgba(0,0,0,0.4); }}
  h1 {{ font-size: 1.4rem; margin-top: 0; color: #ff6b6b; }}
  code {{ background: #23272f; padding: 0.15rem 0.4rem; border-radius: 4px; }}
</style>
</head>
<body>
<div class="card">
<h1>{title}</h1>
{body_html}
</div>
</body>
</html>"#,
        title = escape_html(title),
    );

    let mut response = (status, html).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "text/html; charset=utf-8".parse().unwrap());
    response
        .headers_mut()
        .insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    response
}

/// 404 — subdomain unknown (`not_found`).
pub fn not_found_page(host: &str) -> Response {
    page(
        StatusCode::NOT_FOUND,
        "Tunnel Not Found",
        &format!("<p>No active tunnel is bound to <code>{}</code>.</p>", escape_html(host)),
    )
}

/// 400 — tunnel exists but isn't an HTTP tunnel.
pub fn wrong_protocol_page(host: &str) -> Response {
    page(
        StatusCode::BAD_REQUEST,
        "Wrong Protocol",
        &format!(
            "<p><code>{}</code> is not registered as an HTTP tunnel.</p>",
            escape_html(host)
        ),
    )
}

/// 502 — client signalled `connection_refused`.
pub fn connection_refused_page(host: &str, local_url: &str) -> Response {
    page(
        StatusCode::BAD_GATEWAY,
        "Connection Refused",
        &format!(
            "<p>The tunnel at <code>{}</code> is up, but its local origin \
            <code>{}</code> refused the connection.</p>",
            escape_html(host),
            escape_html(local_url)
        ),
    )
}

/// 504 — client didn't complete within `T_req` (`local_timeout`).
pub fn local_timeout_page(host: &str) -> Response {
    page(
        StatusCode::GATEWAY_TIMEOUT,
        "Origin Timed Out",
        &format!("<p>The local origin behind <code>{}</code> did not respond in time.</p>", escape_html(host)),
    )
}

/// 502 — origin error or malformed response (`local_error`/`bad_response`).
pub fn local_error_page(host: &str, detail: &str) -> Response {
    page(
        StatusCode::BAD_GATEWAY,
        "Origin Error",
        &format!(
            "<p>The local origin behind <code>{}</code> returned an error: {}</p>",
            escape_html(host),
            escape_html(detail)
        ),
    )
}

/// 503 — tunnel known but no active session (`tunnel_disconnected`).
pub fn tunnel_disconnected_page(host: &str) -> Response {
    page(
        StatusCode::SERVICE_UNAVAILABLE,
        "Tunnel Disconnected",
        &format!(
            "<p><code>{}</code> is registered, but its client is not currently connected.</p>",
            escape_html(host)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_angle_brackets_and_amp() {
        assert_eq!(escape_html("<script>&\"'"), "&lt;script&gt;&amp;&quot;&#39;");
    }

    #[test]
    fn connection_refused_reflects_escaped_values() {
        let resp = connection_refused_page("abc.example.test", "<local>");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get("X-Content-Type-Options").unwrap(), "nosniff");
    }
}
