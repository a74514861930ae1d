//! Traits which the embedding application implements
//!
//! The engine owns no application state: actors, objects, collections and
//! inbox behavior are all supplied through these callbacks, registered once
//! on the [FederationBuilder](crate::federation::FederationBuilder) at
//! startup. All callbacks are async and receive a [Context] scoped to the
//! current request or send.

use crate::{
    context::{Context, InboxContext},
    error::Error,
    handlers::nodeinfo::NodeInfo,
    signatures::keys::{RemoteKey, SenderKeyPair},
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Produces the actor document for a handle, or `None` when the actor does
/// not exist.
///
/// ```
/// # use async_trait::async_trait;
/// # use fedikit::context::Context;
/// # use fedikit::error::Error;
/// # use fedikit::traits::ActorDispatcher;
/// # use serde_json::{json, Value};
/// struct Users;
///
/// #[async_trait]
/// impl ActorDispatcher<()> for Users {
///     async fn dispatch(&self, ctx: &Context<()>, handle: &str) -> Result<Option<Value>, Error> {
///         if handle != "alice" {
///             return Ok(None);
///         }
///         Ok(Some(json!({
///             "type": "Person",
///             "id": ctx.actor_uri(handle).map(String::from),
///             "preferredUsername": handle,
///         })))
///     }
/// }
/// ```
#[async_trait]
pub trait ActorDispatcher<T: Clone>: Send + Sync {
    /// Resolve `handle` to an actor document.
    async fn dispatch(&self, ctx: &Context<T>, handle: &str) -> Result<Option<Value>, Error>;
}

/// Produces an object document from the route variables of an object route.
#[async_trait]
pub trait ObjectDispatcher<T: Clone>: Send + Sync {
    /// Resolve the route variables to an object document.
    async fn dispatch(
        &self,
        ctx: &Context<T>,
        values: &HashMap<String, String>,
    ) -> Result<Option<Value>, Error>;
}

/// One page of collection items, as returned by a [CollectionDispatcher].
#[derive(Debug, Clone, Default)]
pub struct CollectionPage {
    /// Items of this page
    pub items: Vec<Value>,
    /// Cursor of the next page, if any
    pub next_cursor: Option<String>,
    /// Cursor of the previous page, if any
    pub prev_cursor: Option<String>,
}

/// Produces collection items, optionally paginated by an opaque cursor.
#[async_trait]
pub trait CollectionDispatcher<T: Clone>: Send + Sync {
    /// Return the items for `handle`. `cursor` is `None` for the first
    /// request; `filter` carries the origin filter of FEP-8fcf follower
    /// synchronization requests.
    async fn dispatch(
        &self,
        ctx: &Context<T>,
        handle: &str,
        cursor: Option<&str>,
        filter: Option<&url::Url>,
    ) -> Result<Option<CollectionPage>, Error>;
}

/// Counts the total items of a collection.
#[async_trait]
pub trait CollectionCounter<T: Clone>: Send + Sync {
    /// Total item count for `handle`, or `None` when unknown.
    async fn count(&self, ctx: &Context<T>, handle: &str) -> Result<Option<u64>, Error>;
}

/// Produces the first or last cursor of a collection.
#[async_trait]
pub trait CursorProvider<T: Clone>: Send + Sync {
    /// The cursor, or `None` when the collection is empty.
    async fn cursor(&self, ctx: &Context<T>, handle: &str) -> Result<Option<String>, Error>;
}

/// Decides whether the signer of a request may read a collection.
#[async_trait]
pub trait AuthorizePredicate<T: Clone>: Send + Sync {
    /// `signer` is the verified signing key of the request, if any.
    async fn authorize(
        &self,
        ctx: &Context<T>,
        handle: &str,
        signer: Option<&RemoteKey>,
    ) -> Result<bool, Error>;
}

/// The callback set served for one collection route. Only the dispatcher is
/// required; registering a counter plus both cursor providers switches the
/// cursorless response from a single page to an index with `first`/`last`.
pub struct CollectionCallbacks<T: Clone> {
    pub(crate) dispatcher: Box<dyn CollectionDispatcher<T>>,
    pub(crate) counter: Option<Box<dyn CollectionCounter<T>>>,
    pub(crate) first_cursor: Option<Box<dyn CursorProvider<T>>>,
    pub(crate) last_cursor: Option<Box<dyn CursorProvider<T>>>,
    pub(crate) authorize: Option<Box<dyn AuthorizePredicate<T>>>,
}

impl<T: Clone> CollectionCallbacks<T> {
    /// Callbacks with just a dispatcher.
    pub fn new(dispatcher: impl CollectionDispatcher<T> + 'static) -> CollectionCallbacks<T> {
        CollectionCallbacks {
            dispatcher: Box::new(dispatcher),
            counter: None,
            first_cursor: None,
            last_cursor: None,
            authorize: None,
        }
    }

    /// Add a total-items counter.
    pub fn with_counter(mut self, counter: impl CollectionCounter<T> + 'static) -> Self {
        self.counter = Some(Box::new(counter));
        self
    }

    /// Add a first-page cursor provider.
    pub fn with_first_cursor(mut self, provider: impl CursorProvider<T> + 'static) -> Self {
        self.first_cursor = Some(Box::new(provider));
        self
    }

    /// Add a last-page cursor provider.
    pub fn with_last_cursor(mut self, provider: impl CursorProvider<T> + 'static) -> Self {
        self.last_cursor = Some(Box::new(provider));
        self
    }

    /// Add an authorization predicate.
    pub fn with_authorizer(mut self, predicate: impl AuthorizePredicate<T> + 'static) -> Self {
        self.authorize = Some(Box::new(predicate));
        self
    }
}

/// Handles an inbound activity. Registered per activity type IRI; the engine
/// dispatches to the most specific registered ancestor of the received type.
#[async_trait]
pub trait InboxListener<T: Clone>: Send + Sync {
    /// Called at most once per activity id.
    async fn handle(&self, ctx: &InboxContext<T>, activity: &Value) -> Result<(), Error>;
}

/// Invoked when an [InboxListener] returns an error. The inbox response is
/// 202 regardless.
#[async_trait]
pub trait InboxErrorHandler<T: Clone>: Send + Sync {
    /// Observe the listener error.
    async fn handle(&self, ctx: &InboxContext<T>, error: &Error);
}

/// Produces the NodeInfo document of this instance.
#[async_trait]
pub trait NodeInfoDispatcher<T: Clone>: Send + Sync {
    /// Build the NodeInfo 2.1 document.
    async fn dispatch(&self, ctx: &Context<T>) -> Result<NodeInfo, Error>;
}

/// Chooses the identity used for authenticated fetches while handling shared
/// inbox deliveries, where no single actor is addressed.
#[async_trait]
pub trait SharedInboxKeyDispatcher<T: Clone>: Send + Sync {
    /// The identity, or `None` to fetch unauthenticated.
    async fn dispatch(&self, ctx: &Context<T>) -> Result<Option<SenderKeyPair>, Error>;
}
