//! Collection responder
//!
//! Serves the outbox, inbox (GET), following and followers routes as
//! `OrderedCollection` / `OrderedCollectionPage` documents. Without a cursor
//! the response is either an index (when a counter and both cursor providers
//! are registered) or a single page of everything the dispatcher returns.
//! Followers requests carrying `base-url` are filtered to that origin for
//! FEP-8fcf follower synchronization.

use crate::{
    context::Context,
    handlers::{accepts_json_ld, json_response, run_hook, with_vary},
    signatures::http::{request_target, verify_request},
};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use serde_json::{json, Map, Value};
use tracing::warn;
use url::Url;

fn query_param(request_url: Option<&Url>, name: &str) -> Option<String> {
    request_url?
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn url_with_cursor(collection_url: &Url, base_url: Option<&str>, cursor: &str) -> String {
    let mut url = collection_url.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        if let Some(base_url) = base_url {
            pairs.append_pair("base-url", base_url);
        }
        pairs.append_pair("cursor", cursor);
    }
    url.into()
}

/// Keep only items belonging to `origin` (FEP-8fcf partial collections).
fn filter_items(items: Vec<Value>, origin: &Url) -> Vec<Value> {
    let prefix = origin.origin().ascii_serialization();
    items
        .into_iter()
        .filter(|item| {
            let id = match item {
                Value::String(id) => Some(id.as_str()),
                Value::Object(map) => map.get("id").and_then(Value::as_str),
                _ => None,
            };
            id.map(|id| id.starts_with(&prefix)).unwrap_or(false)
        })
        .collect()
}

pub(crate) async fn handle_collection<T: Clone + Send + Sync>(
    ctx: &Context<T>,
    request: &Request<Bytes>,
    name: &str,
    handle: &str,
) -> Response<Bytes> {
    let registry = &ctx.federation.registry;
    let Some(callbacks) = registry.collection(name) else {
        return run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        );
    };
    if !accepts_json_ld(request.headers()) {
        return with_vary(run_hook(
            &registry.on_not_acceptable,
            request,
            StatusCode::NOT_ACCEPTABLE,
            "Not acceptable",
        ));
    }

    if let Some(predicate) = &callbacks.authorize {
        let signer = ctx
            .signed_key
            .get_or_init(|| async {
                let loader = ctx.document_loader();
                let resolver = ctx.key_resolver(loader.as_ref());
                let target = ctx
                    .request_url()
                    .map(request_target)
                    .unwrap_or_else(|| request.uri().path().to_string());
                verify_request(
                    &Method::GET,
                    &target,
                    request.headers(),
                    None,
                    ctx.federation.config.signature_time_window,
                    &resolver,
                )
                .await
            })
            .await;
        match predicate.authorize(ctx, handle, signer.as_ref()).await {
            Ok(true) => {}
            Ok(false) => {
                return with_vary(run_hook(
                    &registry.on_unauthorized,
                    request,
                    StatusCode::UNAUTHORIZED,
                    "Unauthorized",
                ));
            }
            Err(error) => {
                warn!(name, handle, %error, "Collection authorizer failed");
                return super::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                );
            }
        }
    }

    let Some(collection_url) = ctx.build_url(
        name,
        &std::collections::HashMap::from([("handle".to_string(), handle.to_string())]),
    ) else {
        return run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        );
    };

    let cursor = query_param(ctx.request_url(), "cursor");
    let base_url_param = if name == "followers" {
        query_param(ctx.request_url(), "base-url")
    } else {
        None
    };
    let filter = base_url_param
        .as_deref()
        .and_then(|base| Url::parse(base).ok());

    let mut body = Map::new();
    body.insert(
        "@context".to_string(),
        json!("https://www.w3.org/ns/activitystreams"),
    );

    if let Some(cursor) = cursor {
        let page = match callbacks
            .dispatcher
            .dispatch(ctx, handle, Some(&cursor), filter.as_ref())
            .await
        {
            Ok(Some(page)) => page,
            Ok(None) => {
                return run_hook(
                    &registry.on_not_found,
                    request,
                    StatusCode::NOT_FOUND,
                    "Not found",
                )
            }
            Err(error) => {
                warn!(name, handle, %error, "Collection dispatcher failed");
                return super::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                );
            }
        };
        let items = match &filter {
            Some(origin) => filter_items(page.items, origin),
            None => page.items,
        };
        body.insert(
            "id".to_string(),
            json!(url_with_cursor(
                &collection_url,
                base_url_param.as_deref(),
                &cursor
            )),
        );
        body.insert("type".to_string(), json!("OrderedCollectionPage"));
        body.insert("partOf".to_string(), json!(collection_url.as_str()));
        if let Some(next) = &page.next_cursor {
            body.insert(
                "next".to_string(),
                json!(url_with_cursor(
                    &collection_url,
                    base_url_param.as_deref(),
                    next
                )),
            );
        }
        if let Some(prev) = &page.prev_cursor {
            body.insert(
                "prev".to_string(),
                json!(url_with_cursor(
                    &collection_url,
                    base_url_param.as_deref(),
                    prev
                )),
            );
        }
        body.insert("orderedItems".to_string(), Value::Array(items));
        return json_response(
            StatusCode::OK,
            crate::FEDERATION_CONTENT_TYPE,
            &Value::Object(body),
        );
    }

    body.insert("id".to_string(), json!(collection_url.as_str()));
    body.insert("type".to_string(), json!("OrderedCollection"));

    // an index collection needs all three of counter, first and last cursor
    if let (Some(counter), Some(first), Some(last)) = (
        &callbacks.counter,
        &callbacks.first_cursor,
        &callbacks.last_cursor,
    ) {
        let total = counter.count(ctx, handle).await.unwrap_or(None);
        let first = first.cursor(ctx, handle).await.unwrap_or(None);
        let last = last.cursor(ctx, handle).await.unwrap_or(None);
        if let Some(total) = total {
            body.insert("totalItems".to_string(), json!(total));
        }
        if let Some(first) = first {
            body.insert(
                "first".to_string(),
                json!(url_with_cursor(
                    &collection_url,
                    base_url_param.as_deref(),
                    &first
                )),
            );
        }
        if let Some(last) = last {
            body.insert(
                "last".to_string(),
                json!(url_with_cursor(
                    &collection_url,
                    base_url_param.as_deref(),
                    &last
                )),
            );
        }
        return json_response(
            StatusCode::OK,
            crate::FEDERATION_CONTENT_TYPE,
            &Value::Object(body),
        );
    }

    match callbacks
        .dispatcher
        .dispatch(ctx, handle, None, filter.as_ref())
        .await
    {
        Ok(Some(page)) => {
            let items = match &filter {
                Some(origin) => filter_items(page.items, origin),
                None => page.items,
            };
            body.insert("totalItems".to_string(), json!(items.len()));
            body.insert("orderedItems".to_string(), Value::Array(items));
            json_response(
                StatusCode::OK,
                crate::FEDERATION_CONTENT_TYPE,
                &Value::Object(body),
            )
        }
        Ok(None) => run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        ),
        Err(error) => {
            warn!(name, handle, %error, "Collection dispatcher failed");
            super::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
