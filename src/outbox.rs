//! Queue listener for outgoing activities
//!
//! Each queued message targets one inbox and carries everything needed to
//! retry it on a different worker or after a restart: sender keys in JWK
//! form, the serialized activity, the attempt counter and the headers to
//! send. A failed attempt notifies the application's outbox error handler
//! and re-enqueues with the next delay of the backoff schedule until the
//! schedule is exhausted.

use crate::{
    federation::FederationInner,
    sender::send_to_inbox,
    signatures::keys::{SenderKeyJwk, SenderKeyPair},
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};
use url::Url;

/// One queued delivery. Immutable once enqueued; a retry is a new message
/// with `attempt` incremented.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OutboxMessage {
    pub keys: Vec<SenderKeyJwk>,
    pub activity: Value,
    pub inbox: Url,
    pub attempt: usize,
    pub headers: HashMap<String, String>,
    pub started: String,
}

impl OutboxMessage {
    pub(crate) fn new(
        keys: &[SenderKeyPair],
        activity: Value,
        inbox: Url,
        headers: HashMap<String, String>,
    ) -> OutboxMessage {
        OutboxMessage {
            keys: keys.iter().map(SenderKeyPair::to_jwk).collect(),
            activity,
            inbox,
            attempt: 0,
            headers,
            started: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Handle one dequeued message: import keys, deliver, and on failure retry
/// per the backoff schedule.
pub(crate) async fn process_message<T: Clone + Send + Sync + 'static>(
    federation: &Arc<FederationInner<T>>,
    raw: Value,
) {
    let message: OutboxMessage = match serde_json::from_value(raw) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "Dropping undecodable outbox message");
            return;
        }
    };
    let keys: Vec<SenderKeyPair> = match message.keys.iter().map(SenderKeyJwk::import).collect() {
        Ok(keys) => keys,
        Err(error) => {
            warn!(%error, "Dropping outbox message with unusable keys");
            return;
        }
    };

    let config = &federation.config;
    let outcome = send_to_inbox(
        &config.client,
        config.request_timeout,
        &keys,
        &message.activity,
        &message.inbox,
        &message.headers,
    )
    .await;

    let error = match outcome {
        Ok(()) => {
            debug!(
                inbox = %message.inbox,
                attempt = message.attempt,
                "Activity delivered from queue"
            );
            return;
        }
        Err(error) => error,
    };
    warn!(
        inbox = %message.inbox,
        attempt = message.attempt,
        %error,
        "Outbox delivery failed"
    );
    if let Some(handler) = &config.on_outbox_error {
        handler(error, message.activity.clone()).await;
    }

    let schedule = &config.backoff_schedule;
    if message.attempt >= schedule.len() {
        warn!(
            inbox = %message.inbox,
            started = %message.started,
            "Giving up on delivery after {} attempts",
            message.attempt + 1
        );
        return;
    }
    let delay = schedule[message.attempt];
    let retry = OutboxMessage {
        attempt: message.attempt + 1,
        ..message
    };
    let Some(queue) = &config.queue else {
        // the listener only runs when a queue is configured
        return;
    };
    let serialized = match serde_json::to_value(&retry) {
        Ok(serialized) => serialized,
        Err(error) => {
            warn!(%error, "Could not serialize retry message");
            return;
        }
    };
    if let Err(error) = queue.enqueue(serialized, Some(delay)).await {
        warn!(%error, inbox = %retry.inbox, "Could not re-enqueue delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let keys = vec![SenderKeyPair::generate_ed25519(
            Url::parse("https://example.com/users/alice#key").unwrap(),
        )];
        let message = OutboxMessage::new(
            &keys,
            serde_json::json!({ "type": "Create", "actor": "https://example.com/users/alice" }),
            Url::parse("https://remote.example/inbox").unwrap(),
            HashMap::from([("collection-synchronization".to_string(), "x".to_string())]),
        );
        assert_eq!(message.attempt, 0);
        let serialized = serde_json::to_value(&message).unwrap();
        let decoded: OutboxMessage = serde_json::from_value(serialized).unwrap();
        assert_eq!(decoded.inbox, message.inbox);
        assert_eq!(decoded.keys.len(), 1);
        decoded.keys[0].import().unwrap();
    }
}
