//! Legacy `RsaSignature2017` verification
//!
//! Mastodon attaches these Linked Data signatures under a `signature`
//! property. The scheme double-canonicalizes with URDNA2015: once for the
//! signature options (minus `type`/`id`/`signatureValue`, under the identity
//! context), once for the document minus `signature`; the SHA-256 hex digests
//! are concatenated and verified as RSASSA-PKCS1-v1_5 + SHA-256. Signing is
//! deliberately not offered; new objects carry Data Integrity proofs.

use crate::{
    error::Error,
    fetch::DocumentLoader,
    signatures::{
        key_cache::KeyResolver,
        keys::{PublicKeyKind, RemoteKey},
        rdf::json_to_quads,
        urdna::canonicalize,
    },
};
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use rsa::{
    pkcs1v15::{Signature as RsaSignature, VerifyingKey},
    sha2::Sha256 as RsaSha256,
    signature::Verifier,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

const IDENTITY_CONTEXT: &str = "https://w3id.org/identity/v1";

fn builtin_context(url: &str) -> bool {
    matches!(
        url,
        "https://www.w3.org/ns/activitystreams"
            | "https://w3id.org/security/v1"
            | "https://w3id.org/identity/v1"
    )
}

fn collect_context_urls(value: &Value, urls: &mut Vec<String>) {
    match value.get("@context") {
        Some(Value::String(url)) => urls.push(url.clone()),
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Value::String(url) = entry {
                    urls.push(url.clone());
                }
            }
        }
        _ => {}
    }
    // embedded nodes may carry their own contexts
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if key != "@context" {
                    collect_context_urls(nested, urls);
                }
            }
        }
        Value::Array(entries) => {
            for nested in entries {
                collect_context_urls(nested, urls);
            }
        }
        _ => {}
    }
}

/// Fetch the remote contexts a document references beyond the built-in ones.
async fn prefetch_contexts(
    document: &Value,
    context_loader: Option<&dyn DocumentLoader>,
) -> HashMap<String, Value> {
    let mut urls = Vec::new();
    collect_context_urls(document, &mut urls);
    let mut contexts = HashMap::new();
    let Some(loader) = context_loader else {
        return contexts;
    };
    for url in urls {
        if builtin_context(&url) || contexts.contains_key(&url) {
            continue;
        }
        let Ok(parsed) = Url::parse(&url) else {
            continue;
        };
        match loader.load(&parsed).await {
            Ok(remote) => {
                contexts.insert(url, remote.document);
            }
            Err(error) => debug!(%url, %error, "Context fetch failed, terms will be dropped"),
        }
    }
    contexts
}

fn canonical_digest(
    document: &Value,
    contexts: &HashMap<String, Value>,
) -> Result<String, Error> {
    let quads = json_to_quads(document, contexts)?;
    Ok(hex::encode(Sha256::digest(canonicalize(&quads))))
}

/// The message an `RsaSignature2017` signature covers: canonical options
/// digest followed by canonical document digest, both hex.
pub(crate) async fn signing_message(
    document: &Value,
    signature: &Value,
    context_loader: Option<&dyn DocumentLoader>,
) -> Result<String, Error> {
    let mut options = match signature {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(Error::Application(
                "signature must be an object".to_string(),
            ))
        }
    };
    options.remove("type");
    options.remove("id");
    options.remove("signatureValue");
    options.insert(
        "@context".to_string(),
        Value::String(IDENTITY_CONTEXT.to_string()),
    );
    let options = Value::Object(options);

    let mut unsigned = match document {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(Error::Application(
                "document must be an object".to_string(),
            ))
        }
    };
    unsigned.remove("signature");
    let unsigned = Value::Object(unsigned);

    let contexts = prefetch_contexts(&unsigned, context_loader).await;
    let options_digest = canonical_digest(&options, &contexts)?;
    let document_digest = canonical_digest(&unsigned, &contexts)?;
    Ok(format!("{options_digest}{document_digest}"))
}

/// Verify one `RsaSignature2017` signature. Returns the creator's key on
/// success, `None` otherwise.
pub(crate) async fn verify_signature(
    document: &Value,
    signature: &Value,
    resolver: &KeyResolver<'_>,
    context_loader: Option<&dyn DocumentLoader>,
) -> Option<RemoteKey> {
    if signature.get("type").and_then(Value::as_str) != Some("RsaSignature2017") {
        debug!("Unsupported legacy signature type");
        return None;
    }
    let creator = signature
        .get("creator")
        .and_then(Value::as_str)
        .and_then(|c| Url::parse(c).ok())?;
    let signature_value = signature
        .get("signatureValue")
        .and_then(Value::as_str)
        .and_then(|v| Base64.decode(v).ok())?;

    let message = match signing_message(document, signature, context_loader).await {
        Ok(message) => message,
        Err(error) => {
            debug!(%error, "Could not canonicalize signed document");
            return None;
        }
    };

    let key = resolver.resolve(&creator).await?;
    let PublicKeyKind::Rsa(public_key) = &key.key else {
        debug!(key_id = %creator, "RsaSignature2017 requires an RSA key");
        return None;
    };
    let Ok(rsa_signature) = RsaSignature::try_from(signature_value.as_slice()) else {
        return None;
    };
    if VerifyingKey::<RsaSha256>::new(public_key.clone())
        .verify(message.as_bytes(), &rsa_signature)
        .is_ok()
    {
        Some(key)
    } else {
        debug!(key_id = %creator, "RsaSignature2017 verification failed");
        None
    }
}
