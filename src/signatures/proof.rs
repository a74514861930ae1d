//! Data Integrity proofs (`eddsa-jcs-2022`)
//!
//! Object-level signatures embedded as a `proof` property, per FEP-8b32.
//! Canonicalization is JCS (RFC 8785) over the compacted document, so proofs
//! survive any JSON re-serialization but not semantic edits. Verification of
//! the legacy `RsaSignature2017` scheme lives in the sibling module; this one
//! signs and verifies the current suite.

use crate::{
    document::{activity_actor, attribution_ids},
    error::Error,
    fetch::DocumentLoader,
    signatures::{
        key_cache::KeyResolver,
        keys::{PrivateKeyKind, PublicKeyKind, RemoteKey, SenderKeyPair},
        rsa2017,
    },
};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signer as _, Verifier as _};
use multibase::Base;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

/// Options for [create_proof] / [sign_object].
#[derive(Debug, Clone)]
pub struct ProofOptions {
    /// Proof creation timestamp
    pub created: DateTime<Utc>,
    /// `@context` recorded in the proof configuration, if any
    pub context: Option<Value>,
}

impl ProofOptions {
    /// Options with `created` set to now and no explicit context.
    pub fn now() -> ProofOptions {
        ProofOptions {
            created: Utc::now(),
            context: None,
        }
    }
}

fn without_key(document: &Value, key: &str) -> Value {
    match document {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(key);
            Value::Object(map)
        }
        other => other.clone(),
    }
}

fn jcs_sha256(document: &Value) -> Result<[u8; 32], Error> {
    let canonical = serde_jcs::to_vec(document)?;
    Ok(Sha256::digest(canonical).into())
}

/// Hash input of a proof: proof-configuration digest followed by document
/// digest.
fn hash_data(unsecured: &Value, config: &Value) -> Result<Vec<u8>, Error> {
    let document_digest = jcs_sha256(unsecured)?;
    let proof_digest = jcs_sha256(config)?;
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&proof_digest);
    data.extend_from_slice(&document_digest);
    Ok(data)
}

/// Create an `eddsa-jcs-2022` proof over `object`. Requires an Ed25519 key.
pub fn create_proof(
    object: &Value,
    key: &SenderKeyPair,
    options: &ProofOptions,
) -> Result<Value, Error> {
    let PrivateKeyKind::Ed25519(signing_key) = &key.private_key else {
        return Err(Error::InvalidKey("eddsa-jcs-2022 requires an Ed25519 key"));
    };
    let unsecured = without_key(object, "proof");

    let mut config = Map::new();
    let context = options
        .context
        .clone()
        .or_else(|| object.get("@context").cloned());
    if let Some(context) = context {
        config.insert("@context".to_string(), context);
    }
    config.insert("type".to_string(), json!("DataIntegrityProof"));
    config.insert("cryptosuite".to_string(), json!("eddsa-jcs-2022"));
    config.insert("verificationMethod".to_string(), json!(key.key_id.as_str()));
    config.insert("proofPurpose".to_string(), json!("assertionMethod"));
    config.insert(
        "created".to_string(),
        json!(options
            .created
            .to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    let signature = signing_key.sign(&hash_data(&unsecured, &Value::Object(config.clone()))?);
    let mut proof = config;
    proof.insert(
        "proofValue".to_string(),
        json!(multibase::encode(Base::Base58Btc, signature.to_bytes())),
    );
    Ok(Value::Object(proof))
}

/// Clone `object` with an `eddsa-jcs-2022` proof attached. Existing proofs
/// are preserved; the new one is appended.
pub fn sign_object(
    object: &Value,
    key: &SenderKeyPair,
    options: &ProofOptions,
) -> Result<Value, Error> {
    let proof = create_proof(object, key, options)?;
    let mut map = match object {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(Error::Application(
                "only JSON objects can be signed".to_string(),
            ))
        }
    };
    match map.get_mut("proof") {
        None => {
            map.insert("proof".to_string(), proof);
        }
        Some(Value::Array(proofs)) => proofs.push(proof),
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, proof]);
        }
    }
    Ok(Value::Object(map))
}

/// Verify a single proof against `document` (which may still carry its
/// `proof` property; it is stripped for hashing). Returns the verifying key.
pub async fn verify_proof(
    document: &Value,
    proof: &Value,
    resolver: &KeyResolver<'_>,
) -> Option<RemoteKey> {
    if proof.get("type").and_then(Value::as_str) != Some("DataIntegrityProof") {
        debug!("Proof type is not DataIntegrityProof");
        return None;
    }
    if proof.get("cryptosuite").and_then(Value::as_str) != Some("eddsa-jcs-2022") {
        debug!("Unsupported cryptosuite");
        return None;
    }
    if proof.get("proofPurpose").and_then(Value::as_str) != Some("assertionMethod") {
        debug!("Unsupported proof purpose");
        return None;
    }
    let method = proof
        .get("verificationMethod")
        .and_then(Value::as_str)
        .and_then(|m| Url::parse(m).ok())?;
    let proof_value = proof.get("proofValue").and_then(Value::as_str)?;
    let Ok((_base, signature_bytes)) = multibase::decode(proof_value) else {
        debug!("proofValue is not valid multibase");
        return None;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature_bytes) else {
        debug!("proofValue is not an Ed25519 signature");
        return None;
    };

    let unsecured = without_key(document, "proof");
    let config = without_key(proof, "proofValue");
    let Ok(data) = hash_data(&unsecured, &config) else {
        return None;
    };

    let key = resolver.resolve(&method).await?;
    let PublicKeyKind::Ed25519(verifying_key) = &key.key else {
        debug!(key_id = %method, "eddsa-jcs-2022 requires an Ed25519 key");
        return None;
    };
    if verifying_key.verify(&data, &signature).is_ok() {
        Some(key)
    } else {
        debug!(key_id = %method, "Object proof verification failed");
        None
    }
}

fn proofs_of(document: &Value, property: &str) -> Vec<Value> {
    match document.get(property) {
        Some(Value::Array(proofs)) => proofs.clone(),
        Some(single) => vec![single.clone()],
        None => Vec::new(),
    }
}

/// Verify every proof attached to `document`: Data Integrity proofs under
/// `proof` and legacy signatures under `signature`. All must verify, and
/// every attribution id (plus the actor id, for activities) must equal the
/// controller of at least one verifying key; partial authentication fails
/// the whole object.
pub async fn verify_object(
    document: &Value,
    resolver: &KeyResolver<'_>,
    context_loader: Option<&dyn DocumentLoader>,
) -> bool {
    let proofs = proofs_of(document, "proof");
    let legacy = proofs_of(document, "signature");
    if proofs.is_empty() && legacy.is_empty() {
        debug!("Object carries no proofs");
        return false;
    }

    let mut owners: Vec<Url> = Vec::new();
    for proof in &proofs {
        match verify_proof(document, proof, resolver).await {
            Some(key) => owners.push(key.owner),
            None => return false,
        }
    }
    for signature in &legacy {
        match rsa2017::verify_signature(document, signature, resolver, context_loader).await {
            Some(key) => owners.push(key.owner),
            None => return false,
        }
    }

    let mut required = attribution_ids(document);
    if let Some(actor) = activity_actor(document) {
        required.push(actor);
    }
    for id in required {
        if !owners.contains(&id) {
            debug!(%id, "No verifying key is controlled by this id");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetch::StaticDocumentLoader,
        signatures::{key_cache::KeyCache, keys::multikey_encode},
    };
    use chrono::TimeZone;

    fn key_id() -> Url {
        Url::parse("https://example.com/users/alice#ed25519-key").unwrap()
    }

    fn actor_id() -> &'static str {
        "https://example.com/users/alice"
    }

    fn options() -> ProofOptions {
        ProofOptions {
            created: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            context: None,
        }
    }

    fn key_loader(pair: &SenderKeyPair) -> StaticDocumentLoader {
        let loader = StaticDocumentLoader::new();
        loader.insert(
            key_id(),
            json!({
                "id": key_id().as_str(),
                "type": "Multikey",
                "controller": actor_id(),
                "publicKeyMultibase": multikey_encode(&pair.public_key()).unwrap(),
            }),
        );
        loader
    }

    fn create_activity() -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://example.com/activities/1",
            "type": "Create",
            "actor": actor_id(),
            "object": {
                "type": "Note",
                "content": "Hello, world!"
            }
        })
    }

    #[tokio::test]
    async fn test_sign_and_verify_object() {
        let pair = SenderKeyPair::generate_ed25519(key_id());
        let signed = sign_object(&create_activity(), &pair, &options()).unwrap();
        assert!(signed.get("proof").is_some());

        let loader = key_loader(&pair);
        let cache = KeyCache::default();
        let resolver = KeyResolver::new(&cache, &loader);
        assert!(verify_object(&signed, &resolver, None).await);
    }

    #[tokio::test]
    async fn test_single_character_mutation_fails() {
        let pair = SenderKeyPair::generate_ed25519(key_id());
        let mut signed = sign_object(&create_activity(), &pair, &options()).unwrap();
        signed["object"]["content"] = json!("Hello, world?");

        let loader = key_loader(&pair);
        let cache = KeyCache::default();
        let resolver = KeyResolver::new(&cache, &loader);
        assert!(!verify_object(&signed, &resolver, None).await);
    }

    #[tokio::test]
    async fn test_mutated_proof_fails() {
        let pair = SenderKeyPair::generate_ed25519(key_id());
        let mut signed = sign_object(&create_activity(), &pair, &options()).unwrap();
        signed["proof"]["created"] = json!("2024-05-01T12:00:01Z");

        let loader = key_loader(&pair);
        let cache = KeyCache::default();
        let resolver = KeyResolver::new(&cache, &loader);
        assert!(!verify_object(&signed, &resolver, None).await);
    }

    #[tokio::test]
    async fn test_foreign_actor_fails_ownership() {
        let pair = SenderKeyPair::generate_ed25519(key_id());
        let mut activity = create_activity();
        activity["actor"] = json!("https://elsewhere.example/users/mallory");
        let signed = sign_object(&activity, &pair, &options()).unwrap();

        let loader = key_loader(&pair);
        let cache = KeyCache::default();
        let resolver = KeyResolver::new(&cache, &loader);
        // the proof itself verifies, but the actor is not the key controller
        assert!(!verify_object(&signed, &resolver, None).await);
    }

    #[tokio::test]
    async fn test_unsigned_object_fails() {
        let loader = StaticDocumentLoader::new();
        let cache = KeyCache::default();
        let resolver = KeyResolver::new(&cache, &loader);
        assert!(!verify_object(&create_activity(), &resolver, None).await);
    }

    #[test]
    fn test_existing_proof_preserved() {
        let pair = SenderKeyPair::generate_ed25519(key_id());
        let once = sign_object(&create_activity(), &pair, &options()).unwrap();
        let twice = sign_object(&once, &pair, &options()).unwrap();
        assert_eq!(twice["proof"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_rsa_key_rejected() {
        let pair = SenderKeyPair::generate_rsa(key_id()).unwrap();
        let result = create_proof(&create_activity(), &pair, &options());
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }
}
