//! Cryptographic key material
//!
//! Two key shapes circulate in the fediverse: `CryptographicKey` documents
//! with a PEM-encoded RSA key and an `owner`, and FEP-521a `Multikey`
//! documents with a Multibase-encoded key and a `controller`. Both are
//! parsed into [RemoteKey]. Sending identities hold a [SenderKeyPair],
//! commonly one RSA pair for HTTP signatures and one Ed25519 pair for
//! object proofs.

use crate::error::Error;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as Base64Url, Engine};
use ed25519_dalek::{SigningKey as Ed25519SigningKey, VerifyingKey as Ed25519VerifyingKey};
use multibase::Base;
use rand::rngs::OsRng;
use rsa::{
    pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

/// Multicodec prefix for an Ed25519 public key.
const MULTICODEC_ED25519_PUB: [u8; 2] = [0xed, 0x01];
/// Multicodec prefix for an RSA public key (PKCS#1 DER follows).
const MULTICODEC_RSA_PUB: [u8; 2] = [0x85, 0x24];

/// Signature algorithms the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RsaSha256,
    /// Ed25519
    Ed25519,
}

/// Public half of a remote actor's key.
#[derive(Debug, Clone)]
pub enum PublicKeyKind {
    /// RSA public key
    Rsa(RsaPublicKey),
    /// Ed25519 public key
    Ed25519(Ed25519VerifyingKey),
}

/// A fetched and parsed remote public key.
#[derive(Debug, Clone)]
pub struct RemoteKey {
    /// The key's own id (usually `<actor>#main-key` or a fragment URL)
    pub id: Url,
    /// Actor that owns (or controls) the key
    pub owner: Url,
    /// The key material
    pub key: PublicKeyKind,
}

impl RemoteKey {
    /// Algorithm this key verifies.
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self.key {
            PublicKeyKind::Rsa(_) => KeyAlgorithm::RsaSha256,
            PublicKeyKind::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }
}

/// Private half of a sending identity's key.
#[derive(Clone)]
pub enum PrivateKeyKind {
    /// RSA private key
    Rsa(RsaPrivateKey),
    /// Ed25519 private key
    Ed25519(Ed25519SigningKey),
}

impl std::fmt::Debug for PrivateKeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivateKeyKind::Rsa(_) => f.write_str("PrivateKeyKind::Rsa(..)"),
            PrivateKeyKind::Ed25519(_) => f.write_str("PrivateKeyKind::Ed25519(..)"),
        }
    }
}

/// A key id plus the matching private key, used for signing requests and
/// object proofs.
#[derive(Debug, Clone)]
pub struct SenderKeyPair {
    /// Key id advertised in signatures (`keyId` / `verificationMethod`)
    pub key_id: Url,
    /// The private key
    pub private_key: PrivateKeyKind,
}

impl SenderKeyPair {
    /// Generate a fresh RSA-2048 pair under `key_id`.
    pub fn generate_rsa(key_id: Url) -> Result<SenderKeyPair, Error> {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|_| Error::InvalidKey("RSA key generation failed"))?;
        Ok(SenderKeyPair {
            key_id,
            private_key: PrivateKeyKind::Rsa(private_key),
        })
    }

    /// Generate a fresh Ed25519 pair under `key_id`.
    pub fn generate_ed25519(key_id: Url) -> SenderKeyPair {
        SenderKeyPair {
            key_id,
            private_key: PrivateKeyKind::Ed25519(Ed25519SigningKey::generate(&mut OsRng)),
        }
    }

    /// Algorithm this pair signs with.
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self.private_key {
            PrivateKeyKind::Rsa(_) => KeyAlgorithm::RsaSha256,
            PrivateKeyKind::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }

    /// Public half of this pair.
    pub fn public_key(&self) -> PublicKeyKind {
        match &self.private_key {
            PrivateKeyKind::Rsa(sk) => PublicKeyKind::Rsa(sk.to_public_key()),
            PrivateKeyKind::Ed25519(sk) => PublicKeyKind::Ed25519(sk.verifying_key()),
        }
    }

    /// Serialize into the queued-message form: key id plus private key as JWK.
    pub fn to_jwk(&self) -> SenderKeyJwk {
        SenderKeyJwk {
            key_id: self.key_id.clone(),
            private_key_jwk: private_key_to_jwk(&self.private_key),
        }
    }
}

/// Wire form of a [SenderKeyPair] inside a queued outbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyJwk {
    /// Key id
    pub key_id: Url,
    /// Private key in JWK form
    pub private_key_jwk: Value,
}

impl SenderKeyJwk {
    /// Import back into a usable key pair.
    pub fn import(&self) -> Result<SenderKeyPair, Error> {
        Ok(SenderKeyPair {
            key_id: self.key_id.clone(),
            private_key: private_key_from_jwk(&self.private_key_jwk)?,
        })
    }
}

/// First RSA pair among `keys`, required wherever HTTP signatures are made.
pub fn pick_rsa(keys: &[SenderKeyPair]) -> Option<&SenderKeyPair> {
    keys.iter().find(|k| k.algorithm() == KeyAlgorithm::RsaSha256)
}

/// First Ed25519 pair among `keys`, used for object proofs.
pub fn pick_ed25519(keys: &[SenderKeyPair]) -> Option<&SenderKeyPair> {
    keys.iter().find(|k| k.algorithm() == KeyAlgorithm::Ed25519)
}

fn b64url_biguint(n: &BigUint) -> String {
    Base64Url.encode(n.to_bytes_be())
}

fn biguint_from_jwk(jwk: &Value, field: &str) -> Result<BigUint, Error> {
    let raw = jwk
        .get(field)
        .and_then(Value::as_str)
        .ok_or(Error::InvalidKey("JWK field missing"))?;
    let bytes = Base64Url
        .decode(raw)
        .map_err(|_| Error::InvalidKey("JWK field is not base64url"))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn private_key_to_jwk(key: &PrivateKeyKind) -> Value {
    match key {
        PrivateKeyKind::Rsa(sk) => {
            let primes = sk.primes();
            json!({
                "kty": "RSA",
                "n": b64url_biguint(sk.n()),
                "e": b64url_biguint(sk.e()),
                "d": b64url_biguint(sk.d()),
                "p": b64url_biguint(&primes[0]),
                "q": b64url_biguint(&primes[1]),
            })
        }
        PrivateKeyKind::Ed25519(sk) => json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "x": Base64Url.encode(sk.verifying_key().to_bytes()),
            "d": Base64Url.encode(sk.to_bytes()),
        }),
    }
}

fn private_key_from_jwk(jwk: &Value) -> Result<PrivateKeyKind, Error> {
    match jwk.get("kty").and_then(Value::as_str) {
        Some("RSA") => {
            let n = biguint_from_jwk(jwk, "n")?;
            let e = biguint_from_jwk(jwk, "e")?;
            let d = biguint_from_jwk(jwk, "d")?;
            let p = biguint_from_jwk(jwk, "p")?;
            let q = biguint_from_jwk(jwk, "q")?;
            let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
                .map_err(|_| Error::InvalidKey("inconsistent RSA JWK"))?;
            Ok(PrivateKeyKind::Rsa(key))
        }
        Some("OKP") => {
            if jwk.get("crv").and_then(Value::as_str) != Some("Ed25519") {
                return Err(Error::InvalidKey("unsupported OKP curve"));
            }
            let d = jwk
                .get("d")
                .and_then(Value::as_str)
                .ok_or(Error::InvalidKey("JWK field missing"))?;
            let bytes = Base64Url
                .decode(d)
                .map_err(|_| Error::InvalidKey("JWK field is not base64url"))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::InvalidKey("Ed25519 seed must be 32 bytes"))?;
            Ok(PrivateKeyKind::Ed25519(Ed25519SigningKey::from_bytes(&seed)))
        }
        _ => Err(Error::InvalidKey("unsupported JWK key type")),
    }
}

/// Encode a public key in Multibase/Multikey form (FEP-521a).
pub fn multikey_encode(key: &PublicKeyKind) -> Result<String, Error> {
    let mut bytes = Vec::new();
    match key {
        PublicKeyKind::Ed25519(vk) => {
            bytes.extend_from_slice(&MULTICODEC_ED25519_PUB);
            bytes.extend_from_slice(&vk.to_bytes());
        }
        PublicKeyKind::Rsa(pk) => {
            bytes.extend_from_slice(&MULTICODEC_RSA_PUB);
            let der = pk
                .to_pkcs1_der()
                .map_err(|_| Error::InvalidKey("RSA key not encodable"))?;
            bytes.extend_from_slice(der.as_bytes());
        }
    }
    Ok(multibase::encode(Base::Base58Btc, bytes))
}

/// Decode a Multibase/Multikey value.
pub fn multikey_decode(value: &str) -> Result<PublicKeyKind, Error> {
    let (_base, bytes) =
        multibase::decode(value).map_err(|_| Error::InvalidKey("invalid multibase value"))?;
    if let Some(raw) = bytes.strip_prefix(&MULTICODEC_ED25519_PUB) {
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::InvalidKey("Ed25519 key must be 32 bytes"))?;
        let vk = Ed25519VerifyingKey::from_bytes(&raw)
            .map_err(|_| Error::InvalidKey("invalid Ed25519 key"))?;
        Ok(PublicKeyKind::Ed25519(vk))
    } else if let Some(der) = bytes.strip_prefix(&MULTICODEC_RSA_PUB) {
        let pk = RsaPublicKey::from_pkcs1_der(der)
            .map_err(|_| Error::InvalidKey("invalid RSA key"))?;
        Ok(PublicKeyKind::Rsa(pk))
    } else {
        Err(Error::InvalidKey("unsupported multicodec prefix"))
    }
}

/// Parse a PEM public key; accepts SPKI and PKCS#1 encodings.
pub fn public_key_from_pem(pem: &str) -> Result<PublicKeyKind, Error> {
    if let Ok(pk) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(PublicKeyKind::Rsa(pk));
    }
    if let Ok(pk) = RsaPublicKey::from_pkcs1_pem(pem) {
        return Ok(PublicKeyKind::Rsa(pk));
    }
    if let Ok(vk) = Ed25519VerifyingKey::from_public_key_pem(pem) {
        return Ok(PublicKeyKind::Ed25519(vk));
    }
    Err(Error::InvalidKey("unparseable PEM public key"))
}

/// PEM-encode the public half of a pair, SPKI form, for embedding in actor
/// documents.
pub fn public_key_to_pem(key: &PublicKeyKind) -> Result<String, Error> {
    match key {
        PublicKeyKind::Rsa(pk) => pk
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| Error::InvalidKey("RSA key not encodable")),
        PublicKeyKind::Ed25519(vk) => vk
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| Error::InvalidKey("Ed25519 key not encodable")),
    }
}

/// PEM-encode a private key (PKCS#8), for application storage.
pub fn private_key_to_pem(key: &PrivateKeyKind) -> Result<String, Error> {
    match key {
        PrivateKeyKind::Rsa(sk) => sk
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|_| Error::InvalidKey("RSA key not encodable")),
        PrivateKeyKind::Ed25519(sk) => sk
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|_| Error::InvalidKey("Ed25519 key not encodable")),
    }
}

/// Parse a PKCS#8 PEM private key.
pub fn private_key_from_pem(pem: &str) -> Result<PrivateKeyKind, Error> {
    if let Ok(sk) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(PrivateKeyKind::Rsa(sk));
    }
    if let Ok(sk) = Ed25519SigningKey::from_pkcs8_pem(pem) {
        return Ok(PrivateKeyKind::Ed25519(sk));
    }
    Err(Error::InvalidKey("unparseable PEM private key"))
}

fn key_object_to_remote_key(obj: &Value, key_id: &Url) -> Option<RemoteKey> {
    let id = obj.get("id").and_then(Value::as_str)?;
    if Url::parse(id).ok()? != *key_id {
        return None;
    }
    let owner = obj
        .get("owner")
        .or_else(|| obj.get("controller"))
        .and_then(Value::as_str)
        .and_then(|o| Url::parse(o).ok())?;
    let key = if let Some(pem) = obj.get("publicKeyPem").and_then(Value::as_str) {
        public_key_from_pem(pem).ok()?
    } else if let Some(mb) = obj.get("publicKeyMultibase").and_then(Value::as_str) {
        multikey_decode(mb).ok()?
    } else {
        return None;
    };
    Some(RemoteKey {
        id: key_id.clone(),
        owner,
        key,
    })
}

/// Find and parse the key `key_id` inside a fetched document. The document
/// may be the key itself, or an actor carrying it under `publicKey` or
/// `assertionMethod`.
pub fn parse_remote_key(document: &Value, key_id: &Url) -> Option<RemoteKey> {
    if let Some(key) = key_object_to_remote_key(document, key_id) {
        return Some(key);
    }
    for property in ["publicKey", "assertionMethod"] {
        match document.get(property) {
            Some(Value::Array(entries)) => {
                if let Some(key) = entries
                    .iter()
                    .find_map(|e| key_object_to_remote_key(e, key_id))
                {
                    return Some(key);
                }
            }
            Some(entry) => {
                if let Some(key) = key_object_to_remote_key(entry, key_id) {
                    return Some(key);
                }
            }
            None => {}
        }
    }
    None
}
