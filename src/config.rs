//! Configuration for a federation instance
//!
//! Use [FederationConfig::builder] to initialize it. The key/value backend is
//! required; everything else has defaults. Without a message queue the
//! outbox delivers immediately.
//!
//! ```
//! # use fedikit::config::FederationConfig;
//! # use fedikit::kv::MemoryKvStore;
//! # use std::sync::Arc;
//! let config = FederationConfig::builder()
//!     .origin("https://example.com".parse()?)
//!     .app_data(())
//!     .kv(Arc::new(MemoryKvStore::new()))
//!     .build()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::{
    error::Error,
    fetch::{DocumentLoader, HttpDocumentLoader},
    kv::KvStore,
    queue::MessageQueue,
    signatures::keys::SenderKeyPair,
};
use derive_builder::Builder;
use futures::future::BoxFuture;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use std::{ops::Deref, sync::Arc, time::Duration};
use url::Url;

/// Callback invoked when an outbox delivery attempt fails. Receives the
/// error and the activity that could not be delivered.
pub type OutboxErrorHandler =
    Arc<dyn Fn(Error, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builds a document loader that authenticates its requests as the given
/// identity.
pub type AuthenticatedLoaderFactory =
    Arc<dyn Fn(SenderKeyPair) -> Arc<dyn DocumentLoader> + Send + Sync>;

/// Key prefixes used to namespace engine data inside the [KvStore].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPrefixes {
    /// Prefix for inbox idempotence records
    pub activity_idempotence: Vec<String>,
    /// Prefix for cached remote documents
    pub remote_document: Vec<String>,
}

impl Default for KvPrefixes {
    fn default() -> Self {
        KvPrefixes {
            activity_idempotence: vec![
                "_fedikit".to_string(),
                "activityIdempotence".to_string(),
            ],
            remote_document: vec!["_fedikit".to_string(), "remoteDocument".to_string()],
        }
    }
}

fn default_backoff_schedule() -> Vec<Duration> {
    vec![
        Duration::from_secs(3),
        Duration::from_secs(15),
        Duration::from_secs(60),
        Duration::from_secs(15 * 60),
        Duration::from_secs(60 * 60),
    ]
}

const MAX_BACKOFF: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration for a federation instance, with various federation related
/// settings.
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct FederationConfig<T: Clone> {
    /// Canonical origin of this instance (`https://example.com`). Requests
    /// carrying `X-Forwarded-Proto`/`X-Forwarded-Host` override it per
    /// request.
    pub(crate) origin: Url,
    /// Data which the application requires in callbacks, such as a database
    /// connection or configuration.
    pub(crate) app_data: T,
    /// Key/value backend for idempotence records and document caching.
    pub(crate) kv: Arc<dyn KvStore>,
    /// Namespacing of engine data inside the key/value store.
    #[builder(default)]
    pub(crate) kv_prefixes: KvPrefixes,
    /// Message queue for outgoing activities. Without one, sends deliver
    /// immediately and surface their errors to the caller.
    #[builder(default, setter(strip_option))]
    pub(crate) queue: Option<Arc<dyn MessageQueue>>,
    /// HTTP client used for all outgoing requests.
    #[builder(default = "reqwest::Client::default().into()")]
    pub(crate) client: ClientWithMiddleware,
    /// Timeout for outgoing requests.
    #[builder(default = "Duration::from_secs(10)")]
    pub(crate) request_timeout: Duration,
    /// Tolerated clock skew when checking the `Date` header of signed
    /// requests. `None` disables the check.
    #[builder(default = "Some(Duration::from_secs(60))")]
    pub(crate) signature_time_window: Option<Duration>,
    /// Delays between outbox delivery retries. At most 30 days each.
    #[builder(default = "default_backoff_schedule()")]
    pub(crate) backoff_schedule: Vec<Duration>,
    /// How long inbox idempotence records are kept.
    #[builder(default = "Duration::from_secs(7 * 24 * 60 * 60)")]
    pub(crate) idempotence_ttl: Duration,
    /// How long fetched remote documents are cached.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    pub(crate) remote_document_ttl: Duration,
    /// How long fetched public keys are memoized.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    pub(crate) key_cache_ttl: Duration,
    /// Allow document loads from private addresses. For local testing only.
    #[builder(default = "false")]
    pub(crate) allow_private_addresses: bool,
    /// Skip inbox signature verification. For local testing only.
    #[builder(default = "false")]
    pub(crate) skip_signature_verification: bool,
    /// Override the default KV-cached HTTP document loader.
    #[builder(default, setter(strip_option))]
    pub(crate) document_loader: Option<Arc<dyn DocumentLoader>>,
    /// Override the loader used for JSON-LD `@context` documents. Defaults
    /// to the document loader.
    #[builder(default, setter(strip_option))]
    pub(crate) context_loader: Option<Arc<dyn DocumentLoader>>,
    /// Override how per-identity authenticated loaders are built.
    #[builder(default, setter(strip_option))]
    pub(crate) authenticated_document_loader_factory: Option<AuthenticatedLoaderFactory>,
    /// Invoked whenever an outbox delivery attempt fails.
    #[builder(default, setter(strip_option))]
    pub(crate) on_outbox_error: Option<OutboxErrorHandler>,
}

impl<T: Clone> FederationConfig<T> {
    /// Returns a new config builder with default values.
    pub fn builder() -> FederationConfigBuilder<T> {
        FederationConfigBuilder::default()
    }

    /// The configured canonical origin.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn http_document_loader(&self) -> HttpDocumentLoader {
        HttpDocumentLoader::new(
            self.client.clone(),
            self.kv.clone(),
            self.kv_prefixes.remote_document.clone(),
            self.remote_document_ttl,
            self.request_timeout,
            self.allow_private_addresses,
        )
    }

    /// The document loader used to dereference remote objects and keys.
    pub fn document_loader(&self) -> Arc<dyn DocumentLoader> {
        match &self.document_loader {
            Some(loader) => loader.clone(),
            None => Arc::new(self.http_document_loader()),
        }
    }

    /// The loader used for JSON-LD `@context` documents.
    pub fn context_loader(&self) -> Arc<dyn DocumentLoader> {
        match &self.context_loader {
            Some(loader) => loader.clone(),
            None => self.document_loader(),
        }
    }

    /// A document loader that signs its requests as `identity`.
    pub fn authenticated_document_loader(
        &self,
        identity: &SenderKeyPair,
    ) -> Arc<dyn DocumentLoader> {
        match &self.authenticated_document_loader_factory {
            Some(factory) => factory(identity.clone()),
            None => Arc::new(self.http_document_loader().with_signer(identity.clone())),
        }
    }
}

impl<T: Clone> FederationConfigBuilder<T> {
    /// Constructs a new config instance with the values supplied to the
    /// builder. Values which are not explicitly specified use the defaults.
    pub fn build(&mut self) -> Result<FederationConfig<T>, Error> {
        let config = self
            .partial_build()
            .map_err(|e| Error::Application(e.to_string()))?;
        if config.backoff_schedule.iter().any(|d| *d > MAX_BACKOFF) {
            return Err(Error::BackoffTooLong);
        }
        Ok(config)
    }
}

impl<T: Clone> Deref for FederationConfig<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn test_defaults() {
        let config = FederationConfig::builder()
            .origin("https://example.com".parse().unwrap())
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .build()
            .unwrap();
        assert_eq!(config.backoff_schedule.len(), 5);
        assert_eq!(config.signature_time_window, Some(Duration::from_secs(60)));
        assert_eq!(
            config.kv_prefixes.activity_idempotence,
            vec!["_fedikit".to_string(), "activityIdempotence".to_string()]
        );
        assert!(config.queue.is_none());
    }

    #[test]
    fn test_backoff_limit_enforced() {
        let result = FederationConfig::builder()
            .origin("https://example.com".parse().unwrap())
            .app_data(())
            .kv(Arc::new(MemoryKvStore::new()))
            .backoff_schedule(vec![Duration::from_secs(31 * 24 * 60 * 60)])
            .build();
        assert!(matches!(result, Err(Error::BackoffTooLong)));
    }

    #[test]
    fn test_missing_kv_fails() {
        let result = FederationConfig::<()>::builder()
            .origin("https://example.com".parse().unwrap())
            .app_data(())
            .build();
        assert!(result.is_err());
    }
}
