//! HTTP signatures (draft-cavage) over requests
//!
//! Signing always uses RSASSA-PKCS1-v1_5 with SHA-256, the only scheme the
//! wider fediverse accepts. Verification additionally accepts Ed25519 keys.
//! Verification never fails with an error: every "does not verify" path
//! returns `None` and leaves a debug-level log entry.

use crate::{
    error::Error,
    signatures::{
        key_cache::KeyResolver,
        keys::{PrivateKeyKind, PublicKeyKind, RemoteKey, SenderKeyPair},
    },
};
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use http::{header::HeaderName, HeaderMap, HeaderValue, Method};
use httpdate::{fmt_http_date, parse_http_date};
use rsa::{
    pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey},
    sha2::Sha256 as RsaSha256,
    signature::{SignatureEncoding, Signer, Verifier},
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};
use subtle::ConstantTimeEq;
use tracing::debug;
use url::Url;

/// Path plus query of a URL, as it appears in `(request-target)`.
pub(crate) fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> Option<HeaderValue> {
    let mut host = url.host_str()?.to_string();
    if let Some(port) = url.port() {
        host = format!("{host}:{port}");
    }
    HeaderValue::from_str(&host).ok()
}

/// `Digest` header value for a request body.
pub(crate) fn body_digest(body: &[u8]) -> String {
    format!("SHA-256={}", Base64.encode(Sha256::digest(body)))
}

fn signing_string(
    signed_headers: &[String],
    method: &Method,
    target: &str,
    headers: &HeaderMap,
) -> Option<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            lines.push(format!(
                "(request-target): {} {}",
                method.as_str().to_lowercase(),
                target
            ));
        } else {
            let value = headers.get(name.as_str())?.to_str().ok()?;
            lines.push(format!("{name}: {value}"));
        }
    }
    Some(lines.join("\n"))
}

/// Sign a request in place: ensures `Host`, `Date` and (for bodies) `Digest`
/// headers, then adds the `Signature` header. Requires an RSA key.
pub fn sign_request(
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    key: &SenderKeyPair,
) -> Result<(), Error> {
    let PrivateKeyKind::Rsa(private_key) = &key.private_key else {
        return Err(Error::InvalidKey("HTTP signatures require an RSA key"));
    };

    if !headers.contains_key(http::header::HOST) {
        let host = host_header(url).ok_or(Error::Request("URL has no host".to_string()))?;
        headers.insert(http::header::HOST, host);
    }
    if let Some(body) = body {
        if !headers.contains_key("digest") {
            headers.insert(
                HeaderName::from_static("digest"),
                HeaderValue::from_str(&body_digest(body))
                    .map_err(|e| Error::Request(e.to_string()))?,
            );
        }
    }
    if !headers.contains_key(http::header::DATE) {
        headers.insert(
            http::header::DATE,
            HeaderValue::from_str(&fmt_http_date(SystemTime::now()))
                .map_err(|e| Error::Request(e.to_string()))?,
        );
    }

    let mut signed_headers = vec![
        "(request-target)".to_string(),
        "host".to_string(),
        "date".to_string(),
    ];
    if body.is_some() {
        signed_headers.push("digest".to_string());
    }
    let message = signing_string(&signed_headers, method, &request_target(url), headers)
        .ok_or(Error::Request("signed header missing".to_string()))?;

    let signing_key = SigningKey::<RsaSha256>::new(private_key.clone());
    let signature = signing_key.sign(message.as_bytes());
    let header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key.key_id,
        signed_headers.join(" "),
        Base64.encode(signature.to_bytes()),
    );
    headers.insert(
        HeaderName::from_static("signature"),
        HeaderValue::from_str(&header).map_err(|e| Error::Request(e.to_string()))?,
    );
    Ok(())
}

/// Sign a body-less GET, used by the authenticated document loader.
pub(crate) fn sign_get_request(
    headers: &mut HeaderMap,
    url: &Url,
    key: &SenderKeyPair,
) -> Result<(), Error> {
    sign_request(headers, &Method::GET, url, None, key)
}

/// Parsed fields of a `Signature` header.
#[derive(Debug)]
struct SignatureParams {
    key_id: Url,
    headers: Vec<String>,
    signature: Vec<u8>,
}

/// Parse `key="value"` pairs, as in `Signature` header values.
fn parse_signature_header(header: &str) -> Option<SignatureParams> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut remaining = header.trim();
    while !remaining.is_empty() {
        remaining = remaining.trim_start_matches(',').trim();
        if remaining.is_empty() {
            break;
        }
        let eq = remaining.find('=')?;
        let name = remaining[..eq].trim().to_string();
        remaining = remaining[eq + 1..].strip_prefix('"')?;
        let end = remaining.find('"')?;
        fields.insert(name, remaining[..end].to_string());
        remaining = &remaining[end + 1..];
    }

    let key_id = Url::parse(fields.get("keyId")?).ok()?;
    let headers = fields
        .get("headers")?
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    let signature = Base64.decode(fields.get("signature")?).ok()?;
    Some(SignatureParams {
        key_id,
        headers,
        signature,
    })
}

/// Check the `Digest` header against the body. Every supported algorithm
/// entry must match and at least one must be present.
fn verify_digest(header: &HeaderValue, body: &[u8]) -> bool {
    let Ok(header) = header.to_str() else {
        return false;
    };
    let mut supported = 0usize;
    for entry in header.split(',') {
        let mut parts = entry.trim().splitn(2, '=');
        let (Some(algorithm), Some(expected)) = (parts.next(), parts.next()) else {
            continue;
        };
        let computed = match algorithm.to_lowercase().as_str() {
            "sha" => Base64.encode(Sha1::digest(body)),
            "sha-256" => Base64.encode(Sha256::digest(body)),
            "sha-512" => Base64.encode(Sha512::digest(body)),
            _ => continue,
        };
        supported += 1;
        if !bool::from(computed.as_bytes().ct_eq(expected.as_bytes())) {
            debug!("Digest mismatch for algorithm {algorithm}");
            return false;
        }
    }
    supported > 0
}

fn within_window(date: SystemTime, window: Duration) -> bool {
    let now = SystemTime::now();
    match now.duration_since(date) {
        Ok(age) => age <= window,
        Err(ahead) => ahead.duration() <= window,
    }
}

fn verify_with_key(key: &RemoteKey, message: &[u8], signature: &[u8]) -> bool {
    match &key.key {
        PublicKeyKind::Rsa(pk) => {
            let Ok(signature) = RsaSignature::try_from(signature) else {
                return false;
            };
            VerifyingKey::<RsaSha256>::new(pk.clone())
                .verify(message, &signature)
                .is_ok()
        }
        PublicKeyKind::Ed25519(vk) => {
            let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
                return false;
            };
            vk.verify(message, &signature).is_ok()
        }
    }
}

/// Verify the HTTP signature on an incoming request. Returns the signing key
/// on success, `None` otherwise. `time_window` is the tolerated clock skew
/// (`None` disables the check). A failure against a cached key evicts the
/// entry and retries once with a fresh fetch, to pick up rotated keys.
pub async fn verify_request(
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    time_window: Option<Duration>,
    resolver: &KeyResolver<'_>,
) -> Option<RemoteKey> {
    let Some(date_header) = headers.get(http::header::DATE) else {
        debug!("Request has no Date header");
        return None;
    };
    let Some(signature_header) = headers.get("signature") else {
        debug!("Request has no Signature header");
        return None;
    };
    if let Some(body) = body {
        let Some(digest_header) = headers.get("digest") else {
            debug!("Request with body has no Digest header");
            return None;
        };
        if !verify_digest(digest_header, body) {
            return None;
        }
    }

    if let Some(window) = time_window {
        let date = date_header
            .to_str()
            .ok()
            .and_then(|d| parse_http_date(d).ok())?;
        if !within_window(date, window) {
            debug!("Date header outside the accepted time window");
            return None;
        }
    }

    let params = signature_header
        .to_str()
        .ok()
        .and_then(parse_signature_header)?;
    if !params.headers.iter().any(|h| h == "(request-target)")
        || !params.headers.iter().any(|h| h == "date")
    {
        debug!("Signature does not cover (request-target) and date");
        return None;
    }
    if body.is_some() && !params.headers.iter().any(|h| h == "digest") {
        debug!("Signature on a request with body does not cover digest");
        return None;
    }

    let message = signing_string(&params.headers, method, target, headers)?;

    let was_cached = resolver.is_cached(&params.key_id).await;
    let key = resolver.resolve(&params.key_id).await?;
    if verify_with_key(&key, message.as_bytes(), &params.signature) {
        return Some(key);
    }
    if was_cached {
        // the cached key may be stale after a key rotation
        resolver.evict(&params.key_id).await;
        let key = resolver.resolve(&params.key_id).await?;
        if verify_with_key(&key, message.as_bytes(), &params.signature) {
            return Some(key);
        }
    }
    debug!(key_id = %params.key_id, "HTTP signature verification failed");
    None
}
