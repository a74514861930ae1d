//! Document loading
//!
//! Remote JSON-LD documents (actors, keys, linked objects) are fetched
//! through the [DocumentLoader] interface. The default [HttpDocumentLoader]
//! caches responses in the configured key/value store and refuses non-HTTP
//! schemes and private addresses, since remote servers control the URLs we
//! dereference. Loads are cancelled by dropping the future; the configured
//! request timeout bounds each attempt.

use crate::{
    error::Error,
    kv::KvStore,
    signatures::{http::sign_get_request, keys::SenderKeyPair},
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::info;
use url::{Host, Url};

/// Accept header sent when dereferencing remote documents.
pub static DOCUMENT_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// 1MB. Remote documents larger than this are rejected.
const MAX_BODY_SIZE: usize = 1_048_576;

/// A loaded remote document.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    /// The parsed JSON document
    pub document: Value,
    /// Final URL after redirects
    pub document_url: Url,
    /// Context URL advertised out of band, if any
    pub context_url: Option<Url>,
}

/// Loads JSON(-LD) documents by URL.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Fetch and parse the document at `url`.
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error>;
}

/// KV-cached HTTP document loader. An instance carrying a signing identity
/// authenticates its requests with an HTTP signature (some servers require
/// signed fetches) and bypasses the shared cache.
#[derive(Clone)]
pub struct HttpDocumentLoader {
    client: ClientWithMiddleware,
    kv: Arc<dyn KvStore>,
    kv_prefix: Vec<String>,
    cache_ttl: Duration,
    request_timeout: Duration,
    allow_private_addresses: bool,
    signer: Option<SenderKeyPair>,
}

impl HttpDocumentLoader {
    /// Create a loader caching under `kv_prefix` in `kv`.
    pub fn new(
        client: ClientWithMiddleware,
        kv: Arc<dyn KvStore>,
        kv_prefix: Vec<String>,
        cache_ttl: Duration,
        request_timeout: Duration,
        allow_private_addresses: bool,
    ) -> HttpDocumentLoader {
        HttpDocumentLoader {
            client,
            kv,
            kv_prefix,
            cache_ttl,
            request_timeout,
            allow_private_addresses,
            signer: None,
        }
    }

    /// A copy of this loader that signs its requests as `identity`.
    pub fn with_signer(&self, identity: SenderKeyPair) -> HttpDocumentLoader {
        HttpDocumentLoader {
            signer: Some(identity),
            ..self.clone()
        }
    }

    fn cache_key(&self, url: &Url) -> Vec<String> {
        let mut key = self.kv_prefix.clone();
        key.push(url.to_string());
        key
    }
}

/// Whether `url` points at a private or otherwise undereferenceable address.
pub(crate) fn is_private_address(url: &Url) -> bool {
    match url.host() {
        None => true,
        Some(Host::Domain(domain)) => {
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Some(Host::Ipv6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::fetch(url, "only http(s) URLs can be dereferenced"));
        }
        if !self.allow_private_addresses && is_private_address(url) {
            return Err(Error::fetch(url, "private addresses are not allowed"));
        }

        let cache_key = self.cache_key(url);
        if self.signer.is_none() {
            if let Some(cached) = self.kv.get(&cache_key).await? {
                return Ok(RemoteDocument {
                    document: cached,
                    document_url: url.clone(),
                    context_url: None,
                });
            }
        }
        info!("Fetching remote document {}", url);

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static(DOCUMENT_ACCEPT),
        );
        if let Some(signer) = &self.signer {
            sign_get_request(&mut headers, url, signer)?;
        }

        let response = self
            .client
            .get(url.as_str())
            .headers(headers)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::fetch(url, e))?;

        if !response.status().is_success() {
            return Err(Error::fetch(
                url,
                format!("unexpected status {}", response.status()),
            ));
        }
        let document_url = response.url().clone();
        let body: Bytes = response.bytes().await.map_err(|e| Error::fetch(url, e))?;
        if body.len() > MAX_BODY_SIZE {
            return Err(Error::fetch(url, "response body too large"));
        }
        let document: Value =
            serde_json::from_slice(&body).map_err(|e| Error::fetch(url, e))?;

        if self.signer.is_none() {
            self.kv
                .set(&cache_key, document.clone(), Some(self.cache_ttl))
                .await?;
        }
        Ok(RemoteDocument {
            document,
            document_url,
            context_url: None,
        })
    }
}

/// Loader serving documents from a fixed in-memory map. Useful for tests and
/// air-gapped deployments.
#[derive(Default)]
pub struct StaticDocumentLoader {
    documents: RwLock<HashMap<Url, Value>>,
}

impl StaticDocumentLoader {
    /// Create an empty loader.
    pub fn new() -> StaticDocumentLoader {
        StaticDocumentLoader::default()
    }

    /// Add or replace the document served for `url`.
    pub fn insert(&self, url: Url, document: Value) {
        self.documents
            .write()
            .expect("document map lock poisoned")
            .insert(url, document);
    }
}

#[async_trait]
impl DocumentLoader for StaticDocumentLoader {
    async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
        let documents = self.documents.read().expect("document map lock poisoned");
        match documents.get(url) {
            Some(document) => Ok(RemoteDocument {
                document: document.clone(),
                document_url: url.clone(),
                context_url: None,
            }),
            None => Err(Error::fetch(url, "document not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_private_address_detection() {
        assert!(is_private_address(&url("http://localhost/actor")));
        assert!(is_private_address(&url("http://foo.localhost/actor")));
        assert!(is_private_address(&url("http://127.0.0.1/actor")));
        assert!(is_private_address(&url("http://10.0.0.8/actor")));
        assert!(is_private_address(&url("http://192.168.1.1/actor")));
        assert!(is_private_address(&url("http://169.254.0.1/actor")));
        assert!(is_private_address(&url("http://[::1]/actor")));
        assert!(is_private_address(&url("http://[fd00::1]/actor")));
        assert!(!is_private_address(&url("https://example.com/actor")));
        assert!(!is_private_address(&url("https://93.184.216.34/actor")));
    }

    #[tokio::test]
    async fn test_static_loader() {
        let loader = StaticDocumentLoader::new();
        loader.insert(url("https://example.com/a"), serde_json::json!({"id": "a"}));
        assert!(loader.load(&url("https://example.com/a")).await.is_ok());
        let missing = loader.load(&url("https://example.com/b")).await;
        assert!(matches!(missing, Err(Error::Fetch { .. })));
    }
}
