//! HTTP responders for the federation routes
//!
//! Every responder works on framework-agnostic `http::Request<Bytes>` /
//! `http::Response<Bytes>` values; adapters for concrete web frameworks are
//! application glue. Content negotiation is shared: JSON-LD compatible
//! `Accept` values are served, requests preferring HTML are bounced to the
//! application with 406 so it can render its own pages.

pub mod actor;
pub mod collection;
pub mod inbox;
pub mod nodeinfo;
pub mod object;
pub mod webfinger;

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// Hook producing the response for a negative outcome (404/406/401), so the
/// application can brand those responses.
pub type ResponseHook = Arc<dyn Fn(&Request<Bytes>) -> Response<Bytes> + Send + Sync>;

fn media_type_quality(entry: &str) -> Option<(String, f32)> {
    let mut parts = entry.split(';');
    let media_type = parts.next()?.trim().to_ascii_lowercase();
    if media_type.is_empty() {
        return None;
    }
    let mut quality = 1.0f32;
    for param in parts {
        let mut kv = param.splitn(2, '=');
        if kv.next().map(str::trim) == Some("q") {
            quality = kv.next().and_then(|q| q.trim().parse().ok()).unwrap_or(0.0);
        }
    }
    Some((media_type, quality))
}

/// Whether the request accepts a JSON-LD compatible response and does not
/// prefer an HTML one with strictly higher quality.
pub(crate) fn accepts_json_ld(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(http::header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    let mut json_quality = 0.0f32;
    let mut html_quality = 0.0f32;
    for entry in accept.split(',') {
        let Some((media_type, quality)) = media_type_quality(entry) else {
            continue;
        };
        match media_type.as_str() {
            "application/activity+json"
            | "application/ld+json"
            | "application/json"
            | "application/*"
            | "*/*" => json_quality = json_quality.max(quality),
            "text/html" | "application/xhtml+xml" => html_quality = html_quality.max(quality),
            _ => {}
        }
    }
    json_quality > 0.0 && html_quality <= json_quality
}

pub(crate) fn json_response(status: StatusCode, content_type: &str, body: &Value) -> Response<Bytes> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type)
        .body(Bytes::from(body))
        .unwrap_or_default()
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from(message.to_string()))
        .unwrap_or_default()
}

/// Stamp the `Vary` header required on negotiation and authorization
/// failures, whatever hook produced the response.
pub(crate) fn with_vary(mut response: Response<Bytes>) -> Response<Bytes> {
    response.headers_mut().insert(
        http::header::VARY,
        http::HeaderValue::from_static("Accept, Signature"),
    );
    response
}

pub(crate) fn run_hook(
    hook: &Option<ResponseHook>,
    request: &Request<Bytes>,
    status: StatusCode,
    message: &str,
) -> Response<Bytes> {
    match hook {
        Some(hook) => hook(request),
        None => text_response(status, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(accept: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(http::header::ACCEPT, HeaderValue::from_str(accept).unwrap());
        map
    }

    #[test]
    fn test_accepts_json_ld() {
        assert!(accepts_json_ld(&headers("application/activity+json")));
        assert!(accepts_json_ld(&headers(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        )));
        assert!(accepts_json_ld(&headers("application/json, text/html;q=0.5")));
        assert!(accepts_json_ld(&headers("*/*")));
        assert!(accepts_json_ld(&HeaderMap::new()));
    }

    #[test]
    fn test_html_preference_rejected() {
        assert!(!accepts_json_ld(&headers("text/html")));
        assert!(!accepts_json_ld(&headers(
            "text/html, application/activity+json;q=0.8"
        )));
        // equal quality goes to JSON
        assert!(accepts_json_ld(&headers(
            "text/html;q=0.9, application/activity+json;q=0.9"
        )));
    }
}
