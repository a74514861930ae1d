//! Per-request and per-send context
//!
//! A fresh [Context] is built for every handled request and every
//! application-initiated send. It gives callbacks access to the application
//! data, URI construction through the router, document loaders and
//! [Context::send_activity]. The context holds a cheap clone of the
//! `Arc`-backed federation state and is never shared across requests.

use crate::{
    error::Error,
    fetch::DocumentLoader,
    federation::FederationInner,
    sender::{Recipient, SendOptions},
    signatures::{key_cache::KeyResolver, keys::RemoteKey, keys::SenderKeyPair},
};
use serde_json::Value;
use std::{collections::HashMap, ops::Deref, sync::Arc};
use tokio::sync::OnceCell;
use url::Url;

/// Handle to the federation state, scoped to one request or send.
pub struct Context<T: Clone> {
    pub(crate) federation: Arc<FederationInner<T>>,
    /// Origin the current request was addressed to
    pub(crate) base: Url,
    /// Full URL of the current request, when handling one
    pub(crate) request_url: Option<Url>,
    /// Verified signing key of the current request, memoized
    pub(crate) signed_key: Arc<OnceCell<Option<RemoteKey>>>,
}

impl<T: Clone> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context {
            federation: self.federation.clone(),
            base: self.base.clone(),
            request_url: self.request_url.clone(),
            signed_key: self.signed_key.clone(),
        }
    }
}

impl<T: Clone> Context<T> {
    /// The application data passed to the config builder.
    pub fn app_data(&self) -> &T {
        &self.federation.config.app_data
    }

    /// Origin serving the current request.
    pub fn origin(&self) -> &Url {
        &self.base
    }

    /// Full URL of the request being handled, if any.
    pub fn request_url(&self) -> Option<&Url> {
        self.request_url.as_ref()
    }

    /// Host (with port, if non-default) of the current origin.
    pub fn host(&self) -> String {
        let mut host = self.base.host_str().unwrap_or_default().to_string();
        if let Some(port) = self.base.port() {
            host = format!("{host}:{port}");
        }
        host
    }

    pub(crate) fn build_url(&self, name: &str, values: &HashMap<String, String>) -> Option<Url> {
        let path = self.federation.router.build(name, values)?;
        self.base.join(&path).ok()
    }

    fn handle_values(handle: &str) -> HashMap<String, String> {
        HashMap::from([("handle".to_string(), handle.to_string())])
    }

    /// URI of the actor with `handle`.
    pub fn actor_uri(&self, handle: &str) -> Option<Url> {
        self.build_url("actor", &Self::handle_values(handle))
    }

    /// URI of an object route registered for `type_iri`.
    pub fn object_uri(&self, type_iri: &str, values: &HashMap<String, String>) -> Option<Url> {
        self.build_url(&format!("object:{type_iri}"), values)
    }

    /// URI of the actor's inbox.
    pub fn inbox_uri(&self, handle: &str) -> Option<Url> {
        self.build_url("inbox", &Self::handle_values(handle))
    }

    /// URI of the shared inbox.
    pub fn shared_inbox_uri(&self) -> Option<Url> {
        self.build_url("sharedInbox", &HashMap::new())
    }

    /// URI of the actor's outbox.
    pub fn outbox_uri(&self, handle: &str) -> Option<Url> {
        self.build_url("outbox", &Self::handle_values(handle))
    }

    /// URI of the actor's following collection.
    pub fn following_uri(&self, handle: &str) -> Option<Url> {
        self.build_url("following", &Self::handle_values(handle))
    }

    /// URI of the actor's followers collection.
    pub fn followers_uri(&self, handle: &str) -> Option<Url> {
        self.build_url("followers", &Self::handle_values(handle))
    }

    /// URI of the NodeInfo document.
    pub fn node_info_uri(&self) -> Option<Url> {
        self.build_url("nodeInfo", &HashMap::new())
    }

    /// Extract the handle from an actor URI on this origin.
    pub fn parse_actor_uri(&self, url: &Url) -> Option<String> {
        if url.origin() != self.base.origin() {
            return None;
        }
        let matched = self.federation.router.route(url.path())?;
        if matched.name != "actor" {
            return None;
        }
        matched.values.get("handle").cloned()
    }

    /// The configured document loader.
    pub fn document_loader(&self) -> Arc<dyn DocumentLoader> {
        self.federation.config.document_loader()
    }

    /// The configured JSON-LD context loader.
    pub fn context_loader(&self) -> Arc<dyn DocumentLoader> {
        self.federation.config.context_loader()
    }

    /// A document loader signing its requests as `identity`.
    pub fn authenticated_document_loader(
        &self,
        identity: &SenderKeyPair,
    ) -> Arc<dyn DocumentLoader> {
        self.federation.config.authenticated_document_loader(identity)
    }

    /// A key resolver over the federation's key cache and `loader`.
    pub fn key_resolver<'a>(&'a self, loader: &'a dyn DocumentLoader) -> KeyResolver<'a> {
        KeyResolver::new(&self.federation.key_cache, loader)
    }
}

impl<T: Clone + Send + Sync + 'static> Context<T> {
    /// Deliver `activity` from the sender owning `keys` to `recipients`.
    /// See [Federation::send_activity](crate::federation::Federation::send_activity).
    pub async fn send_activity(
        &self,
        keys: &[SenderKeyPair],
        recipients: &[Recipient],
        activity: Value,
        options: SendOptions,
    ) -> Result<(), Error> {
        crate::federation::send_activity(&self.federation, keys, recipients, activity, options)
            .await
    }
}

impl<T: Clone> Deref for Context<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.federation.config.app_data
    }
}

/// Context passed to inbox listeners: the request context plus the received
/// activity.
pub struct InboxContext<T: Clone> {
    pub(crate) context: Context<T>,
    pub(crate) activity: Value,
}

impl<T: Clone> InboxContext<T> {
    /// The activity being dispatched.
    pub fn activity(&self) -> &Value {
        &self.activity
    }
}

impl<T: Clone> Deref for InboxContext<T> {
    type Target = Context<T>;

    fn deref(&self) -> &Context<T> {
        &self.context
    }
}
