//! End-to-end tests against the federation facade.

use async_trait::async_trait;
use bytes::Bytes;
use fedikit::{
    config::FederationConfig,
    context::{Context, InboxContext},
    error::Error,
    federation::Federation,
    fetch::StaticDocumentLoader,
    kv::{KvStore, MemoryKvStore},
    queue::InProcessQueue,
    sender::{Recipient, SendOptions},
    signatures::{
        http::sign_request,
        keys::{public_key_to_pem, SenderKeyPair},
        proof::{sign_object, verify_object, ProofOptions},
    },
    traits::{
        ActorDispatcher, CollectionCallbacks, CollectionCounter, CollectionDispatcher,
        CollectionPage, CursorProvider, InboxListener,
    },
};
use http::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use url::Url;

struct TestActors;

#[async_trait]
impl ActorDispatcher<()> for TestActors {
    async fn dispatch(&self, ctx: &Context<()>, handle: &str) -> Result<Option<Value>, Error> {
        if handle != "alice" {
            return Ok(None);
        }
        let id = ctx.actor_uri(handle).map(String::from);
        Ok(Some(json!({
            "type": "Person",
            "id": id,
            "preferredUsername": "alice",
            "inbox": ctx.inbox_uri(handle).map(String::from),
            "outbox": ctx.outbox_uri(handle).map(String::from),
            "url": id,
        })))
    }
}

struct TestOutbox;

#[async_trait]
impl CollectionDispatcher<()> for TestOutbox {
    async fn dispatch(
        &self,
        _ctx: &Context<()>,
        _handle: &str,
        cursor: Option<&str>,
        _filter: Option<&Url>,
    ) -> Result<Option<CollectionPage>, Error> {
        let items: Vec<Value> = (0..3)
            .map(|i| {
                json!({
                    "type": "Create",
                    "id": format!("https://example.com/activities/{i}"),
                    "actor": "https://example.com/users/alice",
                })
            })
            .collect();
        match cursor {
            None => Ok(Some(CollectionPage {
                items,
                next_cursor: None,
                prev_cursor: None,
            })),
            Some(cursor) => {
                let index: usize = match cursor.parse() {
                    Ok(index) => index,
                    Err(_) => return Ok(None),
                };
                if index >= items.len() {
                    return Ok(None);
                }
                Ok(Some(CollectionPage {
                    items: vec![items[index].clone()],
                    next_cursor: (index + 1 < 3).then(|| (index + 1).to_string()),
                    prev_cursor: (index > 0).then(|| (index - 1).to_string()),
                }))
            }
        }
    }
}

struct TestCounter;

#[async_trait]
impl CollectionCounter<()> for TestCounter {
    async fn count(&self, _ctx: &Context<()>, _handle: &str) -> Result<Option<u64>, Error> {
        Ok(Some(3))
    }
}

struct FirstCursor;

#[async_trait]
impl CursorProvider<()> for FirstCursor {
    async fn cursor(&self, _ctx: &Context<()>, _handle: &str) -> Result<Option<String>, Error> {
        Ok(Some("0".to_string()))
    }
}

struct LastCursor;

#[async_trait]
impl CursorProvider<()> for LastCursor {
    async fn cursor(&self, _ctx: &Context<()>, _handle: &str) -> Result<Option<String>, Error> {
        Ok(Some("2".to_string()))
    }
}

struct CountingListener(Arc<AtomicUsize>);

#[async_trait]
impl InboxListener<()> for CountingListener {
    async fn handle(&self, _ctx: &InboxContext<()>, _activity: &Value) -> Result<(), Error> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    federation: Federation<()>,
    kv: Arc<MemoryKvStore>,
    loader: Arc<StaticDocumentLoader>,
    listener_calls: Arc<AtomicUsize>,
    not_acceptable_called: Arc<AtomicBool>,
}

fn fixture() -> Fixture {
    let kv = Arc::new(MemoryKvStore::new());
    let loader = Arc::new(StaticDocumentLoader::new());
    let listener_calls = Arc::new(AtomicUsize::new(0));
    let not_acceptable_called = Arc::new(AtomicBool::new(false));

    let config = FederationConfig::builder()
        .origin("https://example.com".parse().unwrap())
        .app_data(())
        .kv(kv.clone())
        .document_loader(loader.clone())
        .build()
        .unwrap();

    let flag = not_acceptable_called.clone();
    let federation = Federation::builder(config)
        .actor_dispatcher("/users/{handle}", TestActors)
        .unwrap()
        .inbox("/users/{handle}/inbox", Some("/inbox"))
        .unwrap()
        .outbox(
            "/users/{handle}/outbox",
            CollectionCallbacks::new(TestOutbox)
                .with_counter(TestCounter)
                .with_first_cursor(FirstCursor)
                .with_last_cursor(LastCursor),
        )
        .unwrap()
        .on("Create", CountingListener(listener_calls.clone()))
        .unwrap()
        .on_not_acceptable(Arc::new(move |_request: &Request<Bytes>| {
            flag.store(true, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::NOT_ACCEPTABLE)
                .body(Bytes::from_static(b"try application/activity+json"))
                .unwrap()
        }))
        .unwrap()
        .build()
        .unwrap();

    Fixture {
        federation,
        kv,
        loader,
        listener_calls,
        not_acceptable_called,
    }
}

fn get(path: &str, accept: &str) -> Request<Bytes> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("host", "example.com")
        .header("accept", accept)
        .body(Bytes::new())
        .unwrap()
}

fn body_json(response: &Response<Bytes>) -> Value {
    serde_json::from_slice(response.body()).unwrap()
}

#[tokio::test]
async fn test_webfinger_lookup() {
    let fixture = fixture();
    let request = get(
        "/.well-known/webfinger?resource=acct:alice@example.com",
        "application/jrd+json",
    );
    let response = fixture.federation.handle(&request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/jrd+json"
    );
    let jrd = body_json(&response);
    assert_eq!(jrd["subject"], "acct:alice@example.com");
    let self_link = jrd["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"] == "self")
        .unwrap();
    assert_eq!(self_link["href"], "https://example.com/users/alice");
    assert_eq!(self_link["type"], "application/activity+json");

    let request = get(
        "/.well-known/webfinger?resource=acct:bob@example.com",
        "application/jrd+json",
    );
    let response = fixture.federation.handle(&request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_actor_content_negotiation() {
    let fixture = fixture();

    let response = fixture
        .federation
        .handle(&get("/users/alice", "text/html"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    assert!(fixture.not_acceptable_called.load(Ordering::SeqCst));
    assert_eq!(
        response.headers()["vary"].to_str().unwrap(),
        "Accept, Signature"
    );

    let response = fixture
        .federation
        .handle(&get("/users/alice", "application/activity+json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let actor = body_json(&response);
    assert_eq!(actor["type"], "Person");
    assert_eq!(actor["id"], "https://example.com/users/alice");
}

#[tokio::test]
async fn test_unknown_route_is_not_handled() {
    let fixture = fixture();
    let request = get("/about", "text/html");
    assert!(fixture.federation.handle(&request).await.is_none());
}

#[tokio::test]
async fn test_collection_paging() {
    let fixture = fixture();

    let response = fixture
        .federation
        .handle(&get("/users/alice/outbox", "application/activity+json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let collection = body_json(&response);
    assert_eq!(collection["type"], "OrderedCollection");
    assert_eq!(collection["totalItems"], 3);
    assert!(collection["first"].as_str().unwrap().ends_with("?cursor=0"));
    assert!(collection["last"].as_str().unwrap().ends_with("?cursor=2"));

    let response = fixture
        .federation
        .handle(&get(
            "/users/alice/outbox?cursor=0",
            "application/activity+json",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(&response);
    assert_eq!(page["type"], "OrderedCollectionPage");
    assert_eq!(page["orderedItems"].as_array().unwrap().len(), 1);
    assert!(page["next"].as_str().unwrap().ends_with("?cursor=1"));
    assert!(page.get("prev").is_none());
    assert_eq!(page["partOf"], "https://example.com/users/alice/outbox");
}

fn remote_actor_key() -> (SenderKeyPair, Value) {
    let key_id: Url = "https://remote.example/users/bob#main-key".parse().unwrap();
    let pair = SenderKeyPair::generate_rsa(key_id.clone()).unwrap();
    let document = json!({
        "id": "https://remote.example/users/bob",
        "type": "Person",
        "publicKey": {
            "id": key_id.as_str(),
            "owner": "https://remote.example/users/bob",
            "publicKeyPem": public_key_to_pem(&pair.public_key()).unwrap(),
        }
    });
    (pair, document)
}

fn create_activity() -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/activities/1",
        "type": "Create",
        "actor": "https://remote.example/users/bob",
        "object": {
            "type": "Note",
            "content": "hello alice"
        }
    })
}

fn idempotence_key() -> Vec<String> {
    vec![
        "_fedikit".to_string(),
        "activityIdempotence".to_string(),
        "https://remote.example/activities/1".to_string(),
    ]
}

#[tokio::test]
async fn test_inbox_requires_signature_and_deduplicates() {
    let fixture = fixture();
    let (pair, key_document) = remote_actor_key();
    fixture
        .loader
        .insert(pair.key_id.clone(), key_document);

    let body = serde_json::to_vec(&create_activity()).unwrap();

    // unsigned: rejected, listener not called, no idempotence record
    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/users/alice/inbox")
        .header("host", "example.com")
        .header("content-type", "application/activity+json")
        .body(Bytes::from(body.clone()))
        .unwrap();
    let response = fixture.federation.handle(&unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()["vary"].to_str().unwrap(),
        "Accept, Signature"
    );
    assert_eq!(fixture.listener_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.kv.get(&idempotence_key()).await.unwrap(), None);

    // signed: accepted, listener called exactly once, record written
    let inbox_url: Url = "https://example.com/users/alice/inbox".parse().unwrap();
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/activity+json"),
    );
    sign_request(&mut headers, &Method::POST, &inbox_url, Some(&body), &pair).unwrap();

    let mut builder = Request::builder().method(Method::POST).uri("/users/alice/inbox");
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let signed = builder.body(Bytes::from(body.clone())).unwrap();

    let response = fixture.federation.handle(&signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(fixture.listener_calls.load(Ordering::SeqCst), 1);
    assert!(fixture.kv.get(&idempotence_key()).await.unwrap().is_some());

    // replay: still 202, but the listener is not called a second time
    let mut builder = Request::builder().method(Method::POST).uri("/users/alice/inbox");
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let replay = builder.body(Bytes::from(body)).unwrap();
    let response = fixture.federation.handle(&replay).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(fixture.listener_calls.load(Ordering::SeqCst), 1);
}

async fn flaky_inbox_server(failures: usize) -> (Url, Arc<AtomicUsize>) {
    use axum::{extract::State, routing::post, Router};

    let hits = Arc::new(AtomicUsize::new(0));
    let state = hits.clone();
    let handler = move |State(hits): State<Arc<AtomicUsize>>| async move {
        if hits.fetch_add(1, Ordering::SeqCst) < failures {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::ACCEPTED
        }
    };
    let app = Router::new().route("/inbox", post(handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let url = format!("http://{addr}/inbox").parse().unwrap();
    (url, hits)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outbox_retries_until_delivered() {
    let (inbox, hits) = flaky_inbox_server(3).await;

    let kv = Arc::new(MemoryKvStore::new());
    let errors = Arc::new(AtomicUsize::new(0));
    let error_count = errors.clone();
    let config = FederationConfig::builder()
        .origin("https://example.com".parse().unwrap())
        .app_data(())
        .kv(kv)
        .queue(Arc::new(InProcessQueue::new()))
        .backoff_schedule(vec![
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ])
        .on_outbox_error(Arc::new(move |_error: Error, _activity: Value| {
            let errors = error_count.clone();
            Box::pin(async move {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .build()
        .unwrap();
    let federation = Federation::builder(config)
        .actor_dispatcher("/users/{handle}", TestActors)
        .unwrap()
        .build()
        .unwrap();

    let keys = vec![SenderKeyPair::generate_rsa(
        "https://example.com/users/alice#main-key".parse().unwrap(),
    )
    .unwrap()];
    let recipient = Recipient {
        id: "https://remote.example/users/bob".parse().unwrap(),
        inbox,
        shared_inbox: None,
    };
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "actor": "https://example.com/users/alice",
        "object": { "type": "Note", "content": "hi" }
    });
    federation
        .send_activity(&keys, &[recipient], activity, SendOptions::default())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(20), async {
        while hits.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("delivery eventually succeeds");

    assert_eq!(errors.load(Ordering::SeqCst), 3);
    // no further attempts after the success
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_immediate_send_without_queue() {
    let (inbox, hits) = flaky_inbox_server(0).await;
    let config = FederationConfig::builder()
        .origin("https://example.com".parse().unwrap())
        .app_data(())
        .kv(Arc::new(MemoryKvStore::new()))
        .build()
        .unwrap();
    let federation = Federation::builder(config)
        .actor_dispatcher("/users/{handle}", TestActors)
        .unwrap()
        .build()
        .unwrap();
    let keys = vec![SenderKeyPair::generate_rsa(
        "https://example.com/users/alice#main-key".parse().unwrap(),
    )
    .unwrap()];
    let recipient = Recipient {
        id: "https://remote.example/users/bob".parse().unwrap(),
        inbox,
        shared_inbox: None,
    };
    let activity = json!({
        "type": "Create",
        "actor": "https://example.com/users/alice",
        "object": { "type": "Note", "content": "hi" }
    });
    federation
        .send_activity(&keys, &[recipient], activity, SendOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_object_proof_roundtrip_through_context() {
    let fixture = fixture();
    let key_id: Url = "https://example.com/users/alice#ed25519-key".parse().unwrap();
    let pair = SenderKeyPair::generate_ed25519(key_id.clone());
    fixture.loader.insert(
        key_id.clone(),
        json!({
            "id": key_id.as_str(),
            "type": "Multikey",
            "controller": "https://example.com/users/alice",
            "publicKeyMultibase":
                fedikit::signatures::keys::multikey_encode(&pair.public_key()).unwrap(),
        }),
    );

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://example.com/activities/9",
        "type": "Create",
        "actor": "https://example.com/users/alice",
        "object": { "type": "Note", "content": "signed" }
    });
    let signed = sign_object(&activity, &pair, &ProofOptions::now()).unwrap();

    let ctx = fixture.federation.context();
    let loader = ctx.document_loader();
    let resolver = ctx.key_resolver(loader.as_ref());
    assert!(verify_object(&signed, &resolver, None).await);

    let mut tampered = signed.clone();
    tampered["object"]["content"] = json!("tampered");
    assert!(!verify_object(&tampered, &resolver, None).await);
}
