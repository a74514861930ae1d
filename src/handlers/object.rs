//! Object responder

use crate::{
    context::Context,
    handlers::{accepts_json_ld, actor::ensure_context, json_response, run_hook, with_vary},
};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::collections::HashMap;
use tracing::warn;

/// Serve `GET` on an object route. `type_iri` selects the registered
/// dispatcher, `values` are the route variables.
pub(crate) async fn handle_object<T: Clone + Send + Sync>(
    ctx: &Context<T>,
    request: &Request<Bytes>,
    type_iri: &str,
    values: &HashMap<String, String>,
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
    let Some(dispatcher) = registry.objects.get(type_iri) else {
        return run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        );
    };
    match dispatcher.dispatch(ctx, values).await {
        Ok(Some(mut document)) => {
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
            warn!(type_iri, %error, "Object dispatcher failed");
            super::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
