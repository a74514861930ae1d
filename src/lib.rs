//! Server-side ActivityPub federation engine.
//!
//! The engine routes and serves the HTTP endpoints mandated by ActivityPub,
//! WebFinger and NodeInfo, authenticates incoming activities via HTTP
//! signatures and Data Integrity proofs, reliably delivers outgoing
//! activities with retries, and deduplicates inbound activities against a
//! persistent idempotence store. Actors, objects, collections and inbox
//! behavior are supplied by the embedding application through the callback
//! traits in [traits]; the key/value store and message queue backends are
//! pluggable through [kv] and [queue].

/// Configuration for a federation instance
pub mod config;
/// Per-request and per-send context
pub mod context;
/// Accessors for opaque JSON-LD documents
pub mod document;
/// Error types returned by this library
pub mod error;
/// Federation facade and callback registry
pub mod federation;
/// Remote document loading
pub mod fetch;
/// HTTP responders
pub mod handlers;
/// Pluggable key/value storage
pub mod kv;
/// Pluggable message queue
pub mod queue;
/// URI-template routing
pub mod router;
/// Recipient expansion and signed delivery
pub mod sender;
/// Request and object signing
pub mod signatures;
/// Traits which the embedding application implements
pub mod traits;
/// Activity type hierarchy
pub mod vocab;

pub(crate) mod outbox;

/// Mime type for ActivityPub, used for `Accept` and `Content-Type` HTTP
/// headers.
pub static FEDERATION_CONTENT_TYPE: &str = "application/activity+json";
