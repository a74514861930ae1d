//! Inbox pipeline
//!
//! `POST` on an actor inbox or the shared inbox: parse, authenticate,
//! deduplicate, dispatch. Authentication accepts either a valid HTTP
//! signature or a valid object proof, and in both cases the verified key
//! must belong to the activity's actor. The idempotence record is written
//! *before* the listener runs, so a redelivered activity is dispatched at
//! most once. The response is 202 even when the listener fails: remote
//! servers retrying cannot fix our bugs, they can only amplify them.

use crate::{
    context::{Context, InboxContext},
    document::{activity_actor, object_id, object_types},
    handlers::{text_response, with_vary},
    signatures::{http::verify_request, proof::verify_object},
    vocab::{expand_type, type_and_ancestors},
};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

fn idempotence_key<T: Clone>(ctx: &Context<T>, activity_id: &url::Url) -> Vec<String> {
    let mut key = ctx
        .federation
        .config
        .kv_prefixes
        .activity_idempotence
        .clone();
    key.push(activity_id.to_string());
    key
}

/// Find the most specific registered listener for the activity's types.
fn resolve_listener<'r, T: Clone>(
    ctx: &'r Context<T>,
    activity: &Value,
) -> Option<&'r dyn crate::traits::InboxListener<T>> {
    for tag in object_types(activity) {
        for ancestor in type_and_ancestors(&expand_type(&tag)) {
            if let Some(listener) = ctx.federation.registry.listeners.get(&ancestor) {
                return Some(listener.as_ref());
            }
        }
    }
    None
}

pub(crate) async fn handle_inbox<T: Clone + Send + Sync + 'static>(
    ctx: &Context<T>,
    request: &Request<Bytes>,
    shared: bool,
) -> Response<Bytes> {
    let body = request.body();
    let activity: Value = match serde_json::from_slice(body) {
        Ok(activity @ Value::Object(_)) => activity,
        _ => return text_response(StatusCode::BAD_REQUEST, "Invalid activity"),
    };
    let config = &ctx.federation.config;

    if !config.skip_signature_verification {
        // shared inbox deliveries may need an authenticated loader; the
        // application chooses the identity
        let loader = if shared {
            let identity = match &ctx.federation.registry.shared_inbox_key {
                Some(dispatcher) => dispatcher.dispatch(ctx).await.unwrap_or_default(),
                None => None,
            };
            match identity {
                Some(identity) => ctx.authenticated_document_loader(&identity),
                None => ctx.document_loader(),
            }
        } else {
            ctx.document_loader()
        };
        let resolver = ctx.key_resolver(loader.as_ref());

        let target = ctx
            .request_url()
            .map(crate::signatures::http::request_target)
            .unwrap_or_else(|| request.uri().path().to_string());
        let http_key = verify_request(
            &Method::POST,
            &target,
            request.headers(),
            Some(body),
            config.signature_time_window,
            &resolver,
        )
        .await;

        let authenticated = match &http_key {
            // the signing key must belong to the activity's actor
            Some(key) => activity_actor(&activity).as_ref() == Some(&key.owner),
            None => false,
        };
        // a shared inbox may rely on an object proof instead of the
        // request signature
        let authenticated = authenticated
            || verify_object(&activity, &resolver, Some(ctx.context_loader().as_ref())).await;
        if !authenticated {
            debug!("Rejecting unauthenticated inbox delivery");
            return with_vary(text_response(StatusCode::UNAUTHORIZED, "Unauthorized"));
        }
        if let Some(key) = http_key {
            ctx.signed_key.set(Some(key)).ok();
        }
    }

    let activity_id = object_id(&activity);
    if let Some(id) = &activity_id {
        let key = idempotence_key(ctx, id);
        match config.kv.get(&key).await {
            Ok(Some(_)) => {
                debug!(activity = %id, "Activity was already processed");
                return text_response(StatusCode::ACCEPTED, "Accepted");
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "Idempotence lookup failed");
            }
        }
    }

    let Some(listener) = resolve_listener(ctx, &activity) else {
        debug!("No listener registered for this activity");
        return text_response(StatusCode::ACCEPTED, "Accepted");
    };

    // mark before dispatch: at-most-once beats at-least-once here
    if let Some(id) = &activity_id {
        let key = idempotence_key(ctx, id);
        if let Err(error) = config
            .kv
            .set(&key, Value::Bool(true), Some(config.idempotence_ttl))
            .await
        {
            warn!(%error, "Could not write idempotence record");
        }
    }

    let inbox_ctx = InboxContext {
        context: ctx.clone(),
        activity: activity.clone(),
    };
    if let Err(error) = listener.handle(&inbox_ctx, &activity).await {
        warn!(%error, "Inbox listener failed");
        if let Some(handler) = &ctx.federation.registry.inbox_error_handler {
            handler.handle(&inbox_ctx, &error).await;
        }
    }
    text_response(StatusCode::ACCEPTED, "Accepted")
}

pub(crate) fn method_not_allowed() -> Response<Bytes> {
    text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}
