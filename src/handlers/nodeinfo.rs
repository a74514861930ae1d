//! NodeInfo responders
//!
//! `GET /.well-known/nodeinfo` serves the discovery JRD; the linked document
//! is the NodeInfo 2.1 subset the engine emits.

use crate::{context::Context, handlers::json_response};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;
use url::Url;

/// NodeInfo 2.1 schema IRI.
pub static NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

/// Content type of NodeInfo documents, with the schema profile.
pub static NODEINFO_CONTENT_TYPE: &str =
    "application/json; profile=\"http://nodeinfo.diaspora.software/ns/schema/2.1#\"";

/// Software metadata of a [NodeInfo] document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoSoftware {
    /// Canonical software name
    pub name: String,
    /// Software version
    pub version: String,
    /// Source repository, if public
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Url>,
    /// Project homepage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<Url>,
}

/// User statistics of a [NodeInfo] document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsers {
    /// Total registered users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Users active in the last month
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_month: Option<u64>,
    /// Users active in the last half year
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_halfyear: Option<u64>,
}

/// Usage statistics of a [NodeInfo] document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsage {
    /// User statistics
    pub users: NodeInfoUsers,
    /// Number of local posts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_posts: Option<u64>,
    /// Number of local comments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_comments: Option<u64>,
}

/// The NodeInfo 2.1 subset the engine serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Software metadata
    pub software: NodeInfoSoftware,
    /// Supported protocols; `activitypub` for instances built on this crate
    pub protocols: Vec<String>,
    /// Whether registrations are open
    pub open_registrations: bool,
    /// Usage statistics
    pub usage: NodeInfoUsage,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl NodeInfo {
    fn into_document(self) -> Result<Value, serde_json::Error> {
        let mut document = serde_json::to_value(&self)?;
        if let Value::Object(map) = &mut document {
            map.insert("version".to_string(), json!("2.1"));
            map.insert(
                "services".to_string(),
                json!({ "inbound": [], "outbound": [] }),
            );
        }
        Ok(document)
    }
}

/// `GET /.well-known/nodeinfo`: the JRD pointing at the NodeInfo document.
pub(crate) fn handle_node_info_jrd<T: Clone>(ctx: &Context<T>) -> Response<Bytes> {
    let Some(node_info_url) = ctx.node_info_uri() else {
        return super::text_response(StatusCode::NOT_FOUND, "Not found");
    };
    let body = json!({
        "links": [{
            "rel": NODEINFO_SCHEMA,
            "href": node_info_url.as_str(),
            "type": NODEINFO_CONTENT_TYPE,
        }]
    });
    json_response(StatusCode::OK, "application/jrd+json", &body)
}

pub(crate) async fn handle_node_info<T: Clone + Send + Sync>(
    ctx: &Context<T>,
    request: &Request<Bytes>,
) -> Response<Bytes> {
    let registry = &ctx.federation.registry;
    let Some(dispatcher) = &registry.node_info else {
        return super::run_hook(
            &registry.on_not_found,
            request,
            StatusCode::NOT_FOUND,
            "Not found",
        );
    };
    match dispatcher.dispatch(ctx).await {
        Ok(node_info) => match node_info.into_document() {
            Ok(document) => json_response(StatusCode::OK, NODEINFO_CONTENT_TYPE, &document),
            Err(error) => {
                warn!(%error, "Could not serialize NodeInfo");
                super::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        },
        Err(error) => {
            warn!(%error, "NodeInfo dispatcher failed");
            super::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodeinfo_document_shape() {
        let node_info = NodeInfo {
            software: NodeInfoSoftware {
                name: "testapp".to_string(),
                version: "0.1.0".to_string(),
                repository: None,
                homepage: None,
            },
            protocols: vec!["activitypub".to_string()],
            open_registrations: false,
            usage: NodeInfoUsage {
                users: NodeInfoUsers {
                    total: Some(1),
                    ..Default::default()
                },
                local_posts: Some(3),
                local_comments: None,
            },
            metadata: Map::new(),
        };
        let document = node_info.into_document().unwrap();
        assert_eq!(document["version"], "2.1");
        assert_eq!(document["software"]["name"], "testapp");
        assert_eq!(document["protocols"][0], "activitypub");
        assert_eq!(document["usage"]["users"]["total"], 1);
        assert_eq!(document["usage"]["localPosts"], 3);
        assert!(document["services"]["inbound"].as_array().unwrap().is_empty());
    }
}
