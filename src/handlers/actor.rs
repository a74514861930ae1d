//! Actor responder
//!
//! Serves `GET <actorPath{handle}>` with content negotiation. The engine
//! emits warnings (never failures) when the dispatched actor document lacks
//! URIs other registered dispatchers imply, since remote servers will trip
//! over the inconsistency much later.

use crate::{
    context::Context,
    handlers::{accepts_json_ld, json_response, run_hook, with_vary},
};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use serde_json::{json, Value};
use tracing::warn;

pub(crate) fn ensure_context(document: &mut Value) {
    if let Value::Object(map) = document {
        if !map.contains_key("@context") {
            let context = json!([
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ]);
            // serde_json preserves insertion order; re-build so @context leads
            let mut with_context = serde_json::Map::new();
            with_context.insert("@context".to_string(), context);
            with_context.append(map);
            *map = with_context;
        }
    }
}

fn integrity_warnings<T: Clone>(ctx: &Context<T>, handle: &str, document: &Value) {
    let registry = &ctx.federation.registry;
    if !registry.listeners.is_empty() && document.get("inbox").is_none() {
        warn!(handle, "Actor document has no inbox, but inbox listeners are registered");
    }
    if registry.followers.is_some() {
        let expected = ctx.followers_uri(handle).map(String::from);
        let advertised = document
            .get("followers")
            .and_then(Value::as_str)
            .map(str::to_string);
        if advertised != expected {
            warn!(
                handle,
                ?advertised,
                ?expected,
                "Actor document followers URI does not match the registered dispatcher"
            );
        }
    }
}

pub(crate) async fn handle_actor<T: Clone + Send + Sync>(
    ctx: &Context<T>,
    request: &Request<Bytes>,
    handle: &str,
) -> Response<Bytes> {
    let registry = &ctx.federation.registry;
    if !accepts_json_ld(request.headers()) {
        return with_vary(run_hook(
            &registry.on_not_acceptable,
            request,
            StatusCode::NOT_ACCEPTABLE,
            "Not acceptable",
        ));
    }
    let Some(dispatcher) = &registry.actor else {
        return run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        );
    };
    match dispatcher.dispatch(ctx, handle).await {
        Ok(Some(mut document)) => {
            integrity_warnings(ctx, handle, &document);
            ensure_context(&mut document);
            json_response(StatusCode::OK, crate::FEDERATION_CONTENT_TYPE, &document)
        }
        Ok(None) => run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        ),
        Err(error) => {
            warn!(handle, %error, "Actor dispatcher failed");
            super::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
