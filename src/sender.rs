//! Signed delivery of activities to remote inboxes
//!
//! The sender expands recipients into a deduplicated inbox map, signs each
//! POST with the sender's RSA key, and classifies results: 2xx is success,
//! anything else carries the status and a body excerpt into the error the
//! outbox retry loop acts on.

use crate::{
    document::activity_actor,
    error::Error,
    signatures::{
        http::{body_digest, sign_request},
        keys::{pick_rsa, SenderKeyPair},
    },
};
use http::{header::HeaderName, HeaderMap, HeaderValue, Method};
use httpdate::fmt_http_date;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, SystemTime},
};
use tracing::debug;
use url::Url;

/// Longest response-body excerpt captured into delivery errors.
const EXCERPT_LIMIT: usize = 4096;

/// A delivery target: an actor id with its inbox URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Actor id
    pub id: Url,
    /// Individual inbox
    pub inbox: Url,
    /// Shared inbox of the actor's server, if advertised
    pub shared_inbox: Option<Url>,
}

/// Options for [Context::send_activity](crate::context::Context::send_activity).
#[derive(Default, Clone, Debug)]
pub struct SendOptions {
    /// Deliver inline even when a queue is configured
    pub immediate: bool,
    /// Collapse recipients onto shared inboxes where available
    pub prefer_shared_inbox: bool,
    /// Skip recipients whose chosen inbox lives under one of these origins
    pub exclude_base_uris: Vec<Url>,
    /// Followers collection for FEP-8fcf synchronization headers
    pub followers_collection: Option<Url>,
}

/// Expand recipients into a map from inbox URL to the recipient ids served
/// by it. With `prefer_shared_inbox`, a recipient's shared inbox replaces
/// its individual one; recipients whose chosen inbox origin is listed in
/// `exclude_base_uris` are skipped, which prevents delivering to ourselves
/// through a shared inbox we also own.
pub fn extract_inboxes(
    recipients: &[Recipient],
    prefer_shared_inbox: bool,
    exclude_base_uris: &[Url],
) -> HashMap<Url, HashSet<Url>> {
    let excluded: Vec<_> = exclude_base_uris.iter().map(Url::origin).collect();
    let mut inboxes: HashMap<Url, HashSet<Url>> = HashMap::new();
    for recipient in recipients {
        let inbox = match (&recipient.shared_inbox, prefer_shared_inbox) {
            (Some(shared), true) => shared,
            _ => &recipient.inbox,
        };
        if excluded.contains(&inbox.origin()) {
            debug!(inbox = %inbox, "Skipping excluded inbox");
            continue;
        }
        inboxes
            .entry(inbox.clone())
            .or_default()
            .insert(recipient.id.clone());
    }
    inboxes
}

pub(crate) fn generate_request_headers(inbox_url: &Url) -> HeaderMap {
    let mut host = inbox_url.host_str().unwrap_or_default().to_string();
    if let Some(port) = inbox_url.port() {
        host = format!("{host}:{port}");
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(crate::FEDERATION_CONTENT_TYPE),
    );
    if let Ok(host) = HeaderValue::from_str(&host) {
        headers.insert(http::header::HOST, host);
    }
    if let Ok(date) = HeaderValue::from_str(&fmt_http_date(SystemTime::now())) {
        headers.insert(http::header::DATE, date);
    }
    headers
}

/// FEP-8fcf `Collection-Synchronization` header for one receiving server:
/// the partial-collection URL filtered to `base_url`'s origin, and the XOR
/// digest of the follower ids hosted there.
pub(crate) fn collection_synchronization_header(
    followers_collection: &Url,
    base_url: &Url,
    recipient_ids: &HashSet<Url>,
) -> Option<HeaderValue> {
    let origin = base_url.origin().ascii_serialization();
    let mut digest = [0u8; 32];
    for id in recipient_ids {
        let hash = Sha256::digest(id.as_str().as_bytes());
        for (acc, byte) in digest.iter_mut().zip(hash.iter()) {
            *acc ^= byte;
        }
    }
    let mut partial = followers_collection.clone();
    partial
        .query_pairs_mut()
        .append_pair("base-url", &origin);
    HeaderValue::from_str(&format!(
        "collectionId=\"{followers_collection}\", url=\"{partial}\", digest=\"{}\"",
        hex::encode(digest)
    ))
    .ok()
}

/// Sign and POST one activity to one inbox. 2xx counts as delivered; other
/// statuses fail with the status and a body excerpt.
pub(crate) async fn send_to_inbox(
    client: &ClientWithMiddleware,
    timeout: Duration,
    keys: &[SenderKeyPair],
    activity: &Value,
    inbox: &Url,
    extra_headers: &HashMap<String, String>,
) -> Result<(), Error> {
    if activity_actor(activity).is_none() {
        return Err(Error::MissingActor);
    }
    let body = serde_json::to_vec(activity)?;

    let mut headers = generate_request_headers(inbox);
    for (name, value) in extra_headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.insert(name, value);
    }
    let rsa_key =
        pick_rsa(keys).ok_or(Error::InvalidKey("sending requires an RSA key pair"))?;
    sign_request(&mut headers, &Method::POST, inbox, Some(&body), rsa_key)?;

    let response = client
        .post(inbox.as_str())
        .headers(headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Request(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        debug!(inbox = %inbox, "Activity delivered successfully");
        return Ok(());
    }
    let mut excerpt = response.text().await.unwrap_or_default();
    excerpt.truncate(EXCERPT_LIMIT);
    Err(Error::Delivery {
        status: status.as_u16(),
        excerpt,
    })
}

/// `Digest` header for an activity body, exposed for applications that build
/// their own requests.
pub fn activity_digest(activity: &Value) -> Result<String, Error> {
    Ok(body_digest(&serde_json::to_vec(activity)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn recipients() -> Vec<Recipient> {
        vec![
            Recipient {
                id: url("https://a.example/users/1"),
                inbox: url("https://a.example/users/1/inbox"),
                shared_inbox: Some(url("https://a.example/inbox")),
            },
            Recipient {
                id: url("https://a.example/users/2"),
                inbox: url("https://a.example/users/2/inbox"),
                shared_inbox: Some(url("https://a.example/inbox")),
            },
            Recipient {
                id: url("https://b.example/users/3"),
                inbox: url("https://b.example/users/3/inbox"),
                shared_inbox: None,
            },
        ]
    }

    #[test]
    fn test_shared_inbox_collapses_recipients() {
        let shared = extract_inboxes(&recipients(), true, &[]);
        let individual = extract_inboxes(&recipients(), false, &[]);
        assert_eq!(shared.len(), 2);
        assert_eq!(individual.len(), 3);
        assert!(shared.len() <= individual.len());
        assert_eq!(
            shared[&url("https://a.example/inbox")].len(),
            2,
            "both a.example recipients share one inbox"
        );
    }

    #[test]
    fn test_every_recipient_lands_under_exactly_one_inbox() {
        for prefer in [true, false] {
            let map = extract_inboxes(&recipients(), prefer, &[]);
            for recipient in recipients() {
                let holding: Vec<_> = map
                    .values()
                    .filter(|ids| ids.contains(&recipient.id))
                    .collect();
                assert_eq!(holding.len(), 1);
            }
        }
    }

    #[test]
    fn test_exclude_base_uris() {
        let map = extract_inboxes(&recipients(), true, &[url("https://a.example/")]);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&url("https://b.example/users/3/inbox")));
    }

    #[test]
    fn test_collection_synchronization_header() {
        let followers = url("https://example.com/users/alice/followers");
        let ids = HashSet::from([url("https://b.example/users/3")]);
        let header =
            collection_synchronization_header(&followers, &url("https://b.example/"), &ids)
                .unwrap();
        let value = header.to_str().unwrap();
        assert!(value.contains("collectionId=\"https://example.com/users/alice/followers\""));
        assert!(value.contains("base-url=https%3A%2F%2Fb.example"));
        let expected = hex::encode(Sha256::digest("https://b.example/users/3".as_bytes()));
        assert!(value.contains(&expected));
    }

    #[tokio::test]
    async fn test_missing_actor_rejected() {
        let client: ClientWithMiddleware = reqwest::Client::default().into();
        let keys = vec![SenderKeyPair::generate_rsa(
            url("https://example.com/users/alice#main-key"),
        )
        .unwrap()];
        let activity = serde_json::json!({ "type": "Create" });
        let result = send_to_inbox(
            &client,
            Duration::from_secs(1),
            &keys,
            &activity,
            &url("https://b.example/inbox"),
            &HashMap::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::MissingActor)));
    }
}
