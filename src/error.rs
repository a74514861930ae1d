//! Error types returned by this library

use url::Url;

/// Errors produced by the federation engine.
///
/// Verification failures are deliberately *not* errors: the signature
/// verifiers return `None` and log at debug level. These variants cover
/// setup-time misuse, semantic failures in the send path, and transport
/// problems which the outbox retries.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A route name was registered twice
    #[error("Route {0:?} is already registered")]
    RouteAlreadyExists(String),
    /// A URI template could not be parsed
    #[error("Invalid URI template: {0}")]
    InvalidTemplate(String),
    /// A registry callback slot was assigned twice
    #[error("{0} is already registered")]
    DoubleRegistration(&'static str),
    /// A cryptographic key was invalid or not supported for the operation
    #[error("Invalid or unsupported key: {0}")]
    InvalidKey(&'static str),
    /// Activity passed to the send path has no `actor` property
    #[error("Activity has no actor")]
    MissingActor,
    /// Backoff schedule entry exceeds the 30 day maximum
    #[error("Backoff delays must not exceed 30 days")]
    BackoffTooLong,
    /// Document loader failure, with the URL that failed to load
    #[error("Failed to fetch {url}: {reason}")]
    Fetch {
        /// The URL that could not be loaded
        url: Url,
        /// Human-readable failure description
        reason: String,
    },
    /// Remote inbox rejected a delivery
    #[error("Delivery failed with status {status}: {excerpt}")]
    Delivery {
        /// HTTP status code returned by the inbox
        status: u16,
        /// Excerpt of the response body
        excerpt: String,
    },
    /// Transport-level failure on an outgoing request
    #[error("Request failed: {0}")]
    Request(String),
    /// Key/value backend failure
    #[error("Key-value store error: {0}")]
    KvStore(String),
    /// Message queue backend failure
    #[error("Message queue error: {0}")]
    Queue(String),
    /// Url parse error
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    /// Json (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error constructing an HTTP response
    #[error(transparent)]
    Http(#[from] http::Error),
    /// Error returned by an application callback
    #[error("{0}")]
    Application(String),
}

impl Error {
    pub(crate) fn fetch<E: std::fmt::Display>(url: &Url, error: E) -> Self {
        Error::Fetch {
            url: url.clone(),
            reason: error.to_string(),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
