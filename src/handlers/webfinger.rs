//! WebFinger responder
//!
//! Serves `GET /.well-known/webfinger?resource=…`. Accepted resources are
//! `acct:handle@host` where the host matches the request host, and actor
//! URLs on this origin. The response is a JRD (RFC 7033) pointing at the
//! ActivityPub actor document.

use crate::{
    context::Context,
    handlers::{json_response, run_hook},
};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::OnceLock};
use tracing::warn;
use url::Url;

/// The content-type for WebFinger responses.
pub static WEBFINGER_CONTENT_TYPE: &str = "application/jrd+json";

/// A WebFinger response describing an actor.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Webfinger {
    /// The resource this response describes, e.g. `acct:alice@example.com`
    pub subject: String,
    /// Other URLs identifying the same actor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
    /// Links where further data about the subject can be retrieved
    pub links: Vec<WebfingerLink>,
    /// Additional data about the subject
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

/// A single link in a [Webfinger] response.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct WebfingerLink {
    /// Relationship of the link, such as `self`
    pub rel: String,
    /// Media type of the target resource
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Url pointing to the target resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<Url>,
}

fn acct_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // supports different alphabets using \p{L}
    RE.get_or_init(|| Regex::new(r"^acct:([\p{L}0-9_\.\-]+)@(.*)$").expect("compile regex"))
}

/// Resolve a `resource` query parameter to a local actor handle.
fn resolve_handle<T: Clone>(ctx: &Context<T>, resource: &str) -> Option<String> {
    if let Some(captures) = acct_regex().captures(resource) {
        let handle = captures.get(1)?.as_str();
        let host = captures.get(2)?.as_str();
        if host != ctx.host() {
            return None;
        }
        return Some(handle.to_string());
    }
    let url = Url::parse(resource).ok()?;
    ctx.parse_actor_uri(&url)
}

fn profile_links(document: &Value) -> Vec<WebfingerLink> {
    let urls = match document.get("url") {
        Some(Value::String(url)) => vec![url.as_str()],
        Some(Value::Array(urls)) => urls.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    urls.into_iter()
        .filter_map(|url| Url::parse(url).ok())
        .map(|url| WebfingerLink {
            rel: "http://webfinger.net/rel/profile-page".to_string(),
            kind: Some("text/html".to_string()),
            href: Some(url),
        })
        .collect()
}

pub(crate) async fn handle_webfinger<T: Clone + Send + Sync>(
    ctx: &Context<T>,
    request: &Request<Bytes>,
) -> Response<Bytes> {
    let registry = &ctx.federation.registry;
    let resource = ctx
        .request_url()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "resource")
                .map(|(_, value)| value.into_owned())
        });
    let Some(resource) = resource else {
        return super::text_response(StatusCode::BAD_REQUEST, "Missing resource parameter");
    };

    let not_found = || {
        run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        )
    };

    let Some(handle) = resolve_handle(ctx, &resource) else {
        return not_found();
    };
    let Some(dispatcher) = &registry.actor else {
        return not_found();
    };
    let document = match dispatcher.dispatch(ctx, &handle).await {
        Ok(Some(document)) => document,
        Ok(None) => return not_found(),
        Err(error) => {
            warn!(handle, %error, "Actor dispatcher failed");
            return super::text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            );
        }
    };
    let Some(actor_url) = ctx.actor_uri(&handle) else {
        return not_found();
    };

    let mut links = vec![WebfingerLink {
        rel: "self".to_string(),
        kind: Some(crate::FEDERATION_CONTENT_TYPE.to_string()),
        href: Some(actor_url.clone()),
    }];
    links.extend(profile_links(&document));

    let jrd = Webfinger {
        subject: resource,
        aliases: vec![actor_url],
        links,
        properties: HashMap::new(),
    };
    let body = match serde_json::to_value(&jrd) {
        Ok(body) => body,
        Err(error) => {
            warn!(%error, "Could not serialize JRD");
            return super::text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            );
        }
    };
    let mut response = json_response(StatusCode::OK, WEBFINGER_CONTENT_TYPE, &body);
    response.headers_mut().insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    response
}
