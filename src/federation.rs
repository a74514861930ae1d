//! Federation facade and callback registry
//!
//! A [Federation] instance owns the router, the key cache and references to
//! the pluggable backends. The application registers its callbacks once on a
//! [FederationBuilder] (setters are single-assignment and fail loudly on a
//! double set), then hands incoming requests to [Federation::handle] and
//! sends activities through [Federation::send_activity] or a context.

use crate::{
    config::FederationConfig,
    context::Context,
    document::{activity_actor, object_id, with_id},
    error::Error,
    handlers::{self, ResponseHook},
    outbox::OutboxMessage,
    queue::MessageHandler,
    router::Router,
    sender::{collection_synchronization_header, extract_inboxes, send_to_inbox, Recipient,
        SendOptions},
    signatures::{key_cache::KeyCache, keys::SenderKeyPair},
    traits::{
        ActorDispatcher, CollectionCallbacks, InboxErrorHandler, InboxListener,
        NodeInfoDispatcher, ObjectDispatcher, SharedInboxKeyDispatcher,
    },
    vocab::expand_type,
};
use bytes::Bytes;
use http::{Method, Request, Response};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::OnceCell;
use tracing::warn;
use url::Url;
use uuid::Uuid;

/// The callbacks an application registered, immutable after
/// [FederationBuilder::build].
pub(crate) struct Registry<T: Clone> {
    pub(crate) actor: Option<Box<dyn ActorDispatcher<T>>>,
    pub(crate) objects: HashMap<String, Box<dyn ObjectDispatcher<T>>>,
    pub(crate) outbox: Option<CollectionCallbacks<T>>,
    pub(crate) inbox_collection: Option<CollectionCallbacks<T>>,
    pub(crate) following: Option<CollectionCallbacks<T>>,
    pub(crate) followers: Option<CollectionCallbacks<T>>,
    pub(crate) listeners: HashMap<String, Box<dyn InboxListener<T>>>,
    pub(crate) inbox_error_handler: Option<Box<dyn InboxErrorHandler<T>>>,
    pub(crate) node_info: Option<Box<dyn NodeInfoDispatcher<T>>>,
    pub(crate) shared_inbox_key: Option<Box<dyn SharedInboxKeyDispatcher<T>>>,
    pub(crate) on_not_found: Option<ResponseHook>,
    pub(crate) on_not_acceptable: Option<ResponseHook>,
    pub(crate) on_unauthorized: Option<ResponseHook>,
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            actor: None,
            objects: HashMap::new(),
            outbox: None,
            inbox_collection: None,
            following: None,
            followers: None,
            listeners: HashMap::new(),
            inbox_error_handler: None,
            node_info: None,
            shared_inbox_key: None,
            on_not_found: None,
            on_not_acceptable: None,
            on_unauthorized: None,
        }
    }
}

impl<T: Clone> Registry<T> {
    pub(crate) fn collection(&self, name: &str) -> Option<&CollectionCallbacks<T>> {
        match name {
            "outbox" => self.outbox.as_ref(),
            "inbox" => self.inbox_collection.as_ref(),
            "following" => self.following.as_ref(),
            "followers" => self.followers.as_ref(),
            _ => None,
        }
    }
}

pub(crate) struct FederationInner<T: Clone> {
    pub(crate) config: FederationConfig<T>,
    pub(crate) router: Router,
    pub(crate) registry: Registry<T>,
    pub(crate) key_cache: KeyCache,
    pub(crate) queue_listener: OnceCell<()>,
}

/// The federation engine. Cheap to clone; all clones share state.
pub struct Federation<T: Clone> {
    inner: Arc<FederationInner<T>>,
}

impl<T: Clone> Clone for Federation<T> {
    fn clone(&self) -> Self {
        Federation {
            inner: self.inner.clone(),
        }
    }
}

/// Registers routes and callbacks, then closes into an immutable
/// [Federation].
pub struct FederationBuilder<T: Clone> {
    config: FederationConfig<T>,
    router: Router,
    registry: Registry<T>,
}

impl<T: Clone + Send + Sync + 'static> FederationBuilder<T> {
    fn set<V>(slot: &mut Option<V>, value: V, what: &'static str) -> Result<(), Error> {
        if slot.is_some() {
            return Err(Error::DoubleRegistration(what));
        }
        *slot = Some(value);
        Ok(())
    }

    /// Register the actor route and its dispatcher. Also enables WebFinger.
    pub fn actor_dispatcher(
        mut self,
        template: &str,
        dispatcher: impl ActorDispatcher<T> + 'static,
    ) -> Result<Self, Error> {
        self.router.add(template, "actor")?;
        self.router.add("/.well-known/webfinger", "webfinger")?;
        Self::set(
            &mut self.registry.actor,
            Box::new(dispatcher),
            "Actor dispatcher",
        )?;
        Ok(self)
    }

    /// Register an object route for `type_iri` and its dispatcher.
    pub fn object_dispatcher(
        mut self,
        type_iri: &str,
        template: &str,
        dispatcher: impl ObjectDispatcher<T> + 'static,
    ) -> Result<Self, Error> {
        let type_iri = expand_type(type_iri);
        self.router.add(template, &format!("object:{type_iri}"))?;
        self.registry.objects.insert(type_iri, Box::new(dispatcher));
        Ok(self)
    }

    /// Register the inbox route, and optionally the shared inbox route.
    pub fn inbox(mut self, template: &str, shared_template: Option<&str>) -> Result<Self, Error> {
        self.router.add(template, "inbox")?;
        if let Some(shared_template) = shared_template {
            self.router.add(shared_template, "sharedInbox")?;
        }
        Ok(self)
    }

    /// Serve `GET` on the inbox route as a collection.
    pub fn inbox_collection(mut self, callbacks: CollectionCallbacks<T>) -> Result<Self, Error> {
        Self::set(
            &mut self.registry.inbox_collection,
            callbacks,
            "Inbox collection",
        )?;
        Ok(self)
    }

    /// Register the outbox route and its collection callbacks.
    pub fn outbox(
        mut self,
        template: &str,
        callbacks: CollectionCallbacks<T>,
    ) -> Result<Self, Error> {
        self.router.add(template, "outbox")?;
        Self::set(&mut self.registry.outbox, callbacks, "Outbox dispatcher")?;
        Ok(self)
    }

    /// Register the following collection.
    pub fn following(
        mut self,
        template: &str,
        callbacks: CollectionCallbacks<T>,
    ) -> Result<Self, Error> {
        self.router.add(template, "following")?;
        Self::set(
            &mut self.registry.following,
            callbacks,
            "Following dispatcher",
        )?;
        Ok(self)
    }

    /// Register the followers collection.
    pub fn followers(
        mut self,
        template: &str,
        callbacks: CollectionCallbacks<T>,
    ) -> Result<Self, Error> {
        self.router.add(template, "followers")?;
        Self::set(
            &mut self.registry.followers,
            callbacks,
            "Followers dispatcher",
        )?;
        Ok(self)
    }

    /// Register an inbox listener for an activity type. The type may be a
    /// compacted tag (`Create`) or a full IRI; dispatch walks the type
    /// hierarchy to the most specific registered listener.
    pub fn on(
        mut self,
        activity_type: &str,
        listener: impl InboxListener<T> + 'static,
    ) -> Result<Self, Error> {
        let type_iri = expand_type(activity_type);
        if self.registry.listeners.contains_key(&type_iri) {
            return Err(Error::DoubleRegistration("Inbox listener for this type"));
        }
        self.registry.listeners.insert(type_iri, Box::new(listener));
        Ok(self)
    }

    /// Register the handler invoked when an inbox listener fails.
    pub fn inbox_error_handler(
        mut self,
        handler: impl InboxErrorHandler<T> + 'static,
    ) -> Result<Self, Error> {
        Self::set(
            &mut self.registry.inbox_error_handler,
            Box::new(handler),
            "Inbox error handler",
        )?;
        Ok(self)
    }

    /// Register the NodeInfo route and dispatcher; also serves the
    /// `/.well-known/nodeinfo` JRD.
    pub fn node_info(
        mut self,
        template: &str,
        dispatcher: impl NodeInfoDispatcher<T> + 'static,
    ) -> Result<Self, Error> {
        self.router.add(template, "nodeInfo")?;
        self.router.add("/.well-known/nodeinfo", "nodeInfoJrd")?;
        Self::set(
            &mut self.registry.node_info,
            Box::new(dispatcher),
            "NodeInfo dispatcher",
        )?;
        Ok(self)
    }

    /// Register the shared-inbox key dispatcher.
    pub fn shared_inbox_key_dispatcher(
        mut self,
        dispatcher: impl SharedInboxKeyDispatcher<T> + 'static,
    ) -> Result<Self, Error> {
        Self::set(
            &mut self.registry.shared_inbox_key,
            Box::new(dispatcher),
            "Shared inbox key dispatcher",
        )?;
        Ok(self)
    }

    /// Override the 404 response.
    pub fn on_not_found(mut self, hook: ResponseHook) -> Result<Self, Error> {
        Self::set(&mut self.registry.on_not_found, hook, "Not-found hook")?;
        Ok(self)
    }

    /// Override the 406 response.
    pub fn on_not_acceptable(mut self, hook: ResponseHook) -> Result<Self, Error> {
        Self::set(
            &mut self.registry.on_not_acceptable,
            hook,
            "Not-acceptable hook",
        )?;
        Ok(self)
    }

    /// Override the 401 response.
    pub fn on_unauthorized(mut self, hook: ResponseHook) -> Result<Self, Error> {
        Self::set(
            &mut self.registry.on_unauthorized,
            hook,
            "Unauthorized hook",
        )?;
        Ok(self)
    }

    /// Close the builder into an immutable [Federation].
    pub fn build(self) -> Result<Federation<T>, Error> {
        let key_cache = KeyCache::new(self.config.key_cache_ttl);
        Ok(Federation {
            inner: Arc::new(FederationInner {
                config: self.config,
                router: self.router,
                registry: self.registry,
                key_cache,
                queue_listener: OnceCell::new(),
            }),
        })
    }
}

fn request_origin<T: Clone>(request: &Request<Bytes>, config: &FederationConfig<T>) -> Url {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let host = header("x-forwarded-host")
        .or_else(|| header("host"))
        .or_else(|| request.uri().authority().map(|a| a.to_string()));
    let Some(host) = host else {
        return config.origin().clone();
    };
    let scheme = header("x-forwarded-proto")
        .or_else(|| request.uri().scheme_str().map(str::to_string))
        .unwrap_or_else(|| config.origin().scheme().to_string());
    Url::parse(&format!("{scheme}://{host}")).unwrap_or_else(|_| config.origin().clone())
}

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// Start registering callbacks on top of `config`.
    pub fn builder(config: FederationConfig<T>) -> FederationBuilder<T> {
        FederationBuilder {
            config,
            router: Router::new(),
            registry: Registry::default(),
        }
    }

    /// A context outside any request, addressed at the configured origin.
    pub fn context(&self) -> Context<T> {
        Context {
            federation: self.inner.clone(),
            base: self.inner.config.origin().clone(),
            request_url: None,
            signed_key: Arc::new(OnceCell::new()),
        }
    }

    fn request_context(&self, request: &Request<Bytes>) -> Context<T> {
        let base = request_origin(request, &self.inner.config);
        let path_and_query = match request.uri().query() {
            Some(query) => format!("{}?{}", request.uri().path(), query),
            None => request.uri().path().to_string(),
        };
        let request_url = base.join(&path_and_query).ok();
        Context {
            federation: self.inner.clone(),
            base,
            request_url,
            signed_key: Arc::new(OnceCell::new()),
        }
    }

    /// Handle a federation request. Returns `None` when no federation route
    /// matches, so the application can serve the path itself.
    pub async fn handle(&self, request: &Request<Bytes>) -> Option<Response<Bytes>> {
        let matched = self.inner.router.route(request.uri().path())?;
        let ctx = self.request_context(request);
        let handle = matched.values.get("handle").cloned().unwrap_or_default();
        let method = request.method();

        let get = *method == Method::GET;
        let post = *method == Method::POST;
        let response = match matched.name.as_str() {
            "webfinger" if get => handlers::webfinger::handle_webfinger(&ctx, request).await,
            "nodeInfoJrd" if get => handlers::nodeinfo::handle_node_info_jrd(&ctx),
            "nodeInfo" if get => handlers::nodeinfo::handle_node_info(&ctx, request).await,
            "actor" if get => handlers::actor::handle_actor(&ctx, request, &handle).await,
            "inbox" if post => handlers::inbox::handle_inbox(&ctx, request, false).await,
            "sharedInbox" if post => handlers::inbox::handle_inbox(&ctx, request, true).await,
            "inbox" | "outbox" | "following" | "followers" if get => {
                handlers::collection::handle_collection(&ctx, request, &matched.name, &handle)
                    .await
            }
            name if get && name.starts_with("object:") => {
                let type_iri = name.trim_start_matches("object:");
                handlers::object::handle_object(&ctx, request, type_iri, &matched.values).await
            }
            _ => handlers::inbox::method_not_allowed(),
        };
        Some(response)
    }

    /// Deliver `activity` from the sender owning `keys` to `recipients`.
    ///
    /// With a queue configured (and `immediate` unset), one message per
    /// target inbox is enqueued and the queue listener, started lazily on
    /// first use, delivers with retries. Otherwise deliveries run in
    /// parallel and the first error is surfaced.
    pub async fn send_activity(
        &self,
        keys: &[SenderKeyPair],
        recipients: &[Recipient],
        activity: Value,
        options: SendOptions,
    ) -> Result<(), Error> {
        send_activity(&self.inner, keys, recipients, activity, options).await
    }
}

async fn start_queue_listener<T: Clone + Send + Sync + 'static>(
    inner: &Arc<FederationInner<T>>,
) {
    let federation = inner.clone();
    inner
        .queue_listener
        .get_or_init(|| async move {
            let Some(queue) = federation.config.queue.clone() else {
                return;
            };
            let handler_federation = federation.clone();
            let handler: MessageHandler = Arc::new(move |message| {
                let federation = handler_federation.clone();
                Box::pin(async move {
                    crate::outbox::process_message(&federation, message).await;
                })
            });
            tokio::spawn(async move {
                if let Err(error) = queue.listen(handler).await {
                    warn!(%error, "Queue listener stopped");
                }
            });
        })
        .await;
}

pub(crate) async fn send_activity<T: Clone + Send + Sync + 'static>(
    inner: &Arc<FederationInner<T>>,
    keys: &[SenderKeyPair],
    recipients: &[Recipient],
    activity: Value,
    options: SendOptions,
) -> Result<(), Error> {
    if keys.is_empty() {
        return Err(Error::InvalidKey("at least one sender key is required"));
    }
    if activity_actor(&activity).is_none() {
        return Err(Error::MissingActor);
    }
    let activity = match object_id(&activity) {
        Some(_) => activity,
        None => {
            let id = Url::parse(&format!("urn:uuid:{}", Uuid::new_v4()))?;
            with_id(&activity, &id)
        }
    };

    let inboxes = extract_inboxes(
        recipients,
        options.prefer_shared_inbox,
        &options.exclude_base_uris,
    );
    let config = &inner.config;

    let mut deliveries: Vec<(Url, HashMap<String, String>)> = Vec::new();
    for (inbox, recipient_ids) in &inboxes {
        let mut headers = HashMap::new();
        if let Some(followers) = &options.followers_collection {
            let on_origin: std::collections::HashSet<Url> = recipient_ids
                .iter()
                .filter(|id| id.origin() == inbox.origin())
                .cloned()
                .collect();
            if let Some(value) =
                collection_synchronization_header(followers, inbox, &on_origin)
            {
                if let Ok(value) = value.to_str() {
                    headers.insert(
                        "collection-synchronization".to_string(),
                        value.to_string(),
                    );
                }
            }
        }
        deliveries.push((inbox.clone(), headers));
    }

    if options.immediate || config.queue.is_none() {
        let sends = deliveries.iter().map(|(inbox, headers)| {
            send_to_inbox(
                &config.client,
                config.request_timeout,
                keys,
                &activity,
                inbox,
                headers,
            )
        });
        let results = futures::future::join_all(sends).await;
        for result in results {
            result?;
        }
        return Ok(());
    }

    start_queue_listener(inner).await;
    let queue = config
        .queue
        .as_ref()
        .ok_or_else(|| Error::Queue("queue disappeared".to_string()))?;
    for (inbox, headers) in deliveries {
        let message = OutboxMessage::new(keys, activity.clone(), inbox, headers);
        queue
            .enqueue(serde_json::to_value(&message)?, None)
            .await?;
    }
    Ok(())
}
