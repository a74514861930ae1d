//! JSON-LD to RDF conversion for legacy signature canonicalization
//!
//! `RsaSignature2017` signs URDNA2015-canonicalized RDF, so verifying it
//! requires turning the signed JSON into quads first. This module implements
//! the conversion for the compacted document shapes that actually carry such
//! signatures: term definitions for the activitystreams, security/v1 and
//! identity/v1 contexts are built in, inline `@context` objects are parsed,
//! and further remote contexts can be supplied by the caller (fetched through
//! the configured context loader). Terms with no definition are dropped, as
//! JSON-LD expansion does.

use crate::error::Error;
use serde_json::Value;
use std::collections::HashMap;

pub(crate) const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
const RDF_FIRST: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#first";
const RDF_REST: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#rest";
const RDF_NIL: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#nil";
const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
const XSD_DATETIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";

const AS: &str = "https://www.w3.org/ns/activitystreams#";
const SEC: &str = "https://w3id.org/security#";
const DC: &str = "http://purl.org/dc/terms/";
const LDP: &str = "http://www.w3.org/ns/ldp#";

/// An RDF term. Ordering is derived for deterministic sorting of quads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum Term {
    /// An IRI reference
    Iri(String),
    /// A blank node label, without the `_:` prefix
    Blank(String),
    /// A literal with datatype and optional language tag
    Literal {
        value: String,
        datatype: String,
        language: Option<String>,
    },
}

/// A quad in the default graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Quad {
    pub subject: Term,
    pub predicate: String,
    pub object: Term,
}

/// How a term maps onto RDF.
#[derive(Debug, Clone, Default)]
struct TermDef {
    iri: String,
    /// `@type: @id`: string values become IRIs
    is_id: bool,
    /// `@container: @list`
    is_list: bool,
    datatype: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ActiveContext {
    terms: HashMap<String, TermDef>,
    /// terms aliased to `@id` / `@type`
    id_aliases: Vec<String>,
    type_aliases: Vec<String>,
}

fn def(iri: &str) -> TermDef {
    TermDef {
        iri: iri.to_string(),
        ..Default::default()
    }
}

fn id_def(iri: &str) -> TermDef {
    TermDef {
        iri: iri.to_string(),
        is_id: true,
        ..Default::default()
    }
}

fn dt_def(iri: &str, datatype: &str) -> TermDef {
    TermDef {
        iri: iri.to_string(),
        datatype: Some(datatype.to_string()),
        ..Default::default()
    }
}

impl ActiveContext {
    fn add_builtin(&mut self, url: &str) -> bool {
        match url {
            "https://www.w3.org/ns/activitystreams" => {
                self.id_aliases.push("id".to_string());
                self.type_aliases.push("type".to_string());
                for name in [
                    "Accept", "Activity", "Add", "Announce", "Application", "Arrive", "Article",
                    "Audio", "Block", "Collection", "CollectionPage", "Create", "Delete",
                    "Dislike", "Document", "Event", "Flag", "Follow", "Group", "Ignore", "Image",
                    "IntransitiveActivity", "Invite", "Join", "Leave", "Like", "Link", "Listen",
                    "Move", "Note", "Object", "Offer", "OrderedCollection",
                    "OrderedCollectionPage", "Organization", "Page", "Person", "Place",
                    "Profile", "Question", "Read", "Reject", "Remove", "Service",
                    "TentativeAccept", "TentativeReject", "Tombstone", "Travel", "Undo",
                    "Update", "Video", "View",
                ] {
                    self.terms.insert(name.to_string(), def(&format!("{AS}{name}")));
                }
                for name in [
                    "actor", "attachment", "attributedTo", "audience", "bcc", "bto", "cc",
                    "context", "current", "describes", "first", "following", "followers",
                    "generator", "icon", "image", "inReplyTo", "instrument", "last", "location",
                    "next", "object", "origin", "prev", "preview", "replies", "result", "tag",
                    "target", "to", "url", "partOf", "subject", "relationship",
                ] {
                    self.terms
                        .insert(name.to_string(), id_def(&format!("{AS}{name}")));
                }
                for name in [
                    "content", "name", "summary", "mediaType", "duration", "href", "hreflang",
                    "preferredUsername", "source", "units",
                ] {
                    self.terms.insert(name.to_string(), def(&format!("{AS}{name}")));
                }
                for name in ["published", "updated", "startTime", "endTime", "deleted"] {
                    self.terms.insert(
                        name.to_string(),
                        dt_def(&format!("{AS}{name}"), XSD_DATETIME),
                    );
                }
                for (name, iri) in [("totalItems", format!("{AS}totalItems"))] {
                    self.terms.insert(name.to_string(), dt_def(&iri, XSD_INTEGER));
                }
                let mut items = id_def(&format!("{AS}items"));
                items.is_list = true;
                self.terms.insert("items".to_string(), items.clone());
                self.terms.insert("orderedItems".to_string(), items);
                self.terms
                    .insert("inbox".to_string(), id_def(&format!("{LDP}inbox")));
                self.terms
                    .insert("outbox".to_string(), id_def(&format!("{AS}outbox")));
                self.terms
                    .insert("sharedInbox".to_string(), id_def(&format!("{AS}sharedInbox")));
                self.terms
                    .insert("endpoints".to_string(), id_def(&format!("{AS}endpoints")));
                true
            }
            "https://w3id.org/security/v1" | "https://w3id.org/identity/v1" => {
                self.id_aliases.push("id".to_string());
                self.type_aliases.push("type".to_string());
                for (name, iri) in [
                    ("CryptographicKey", format!("{SEC}Key")),
                    ("RsaSignature2017", format!("{SEC}RsaSignature2017")),
                    ("Ed25519Signature2018", format!("{SEC}Ed25519Signature2018")),
                    ("domain", format!("{SEC}domain")),
                    ("nonce", format!("{SEC}nonce")),
                    ("canonicalizationAlgorithm", format!("{SEC}canonicalizationAlgorithm")),
                    ("digestAlgorithm", format!("{SEC}digestAlgorithm")),
                    ("digestValue", format!("{SEC}digestValue")),
                    ("privateKeyPem", format!("{SEC}privateKeyPem")),
                    ("publicKeyPem", format!("{SEC}publicKeyPem")),
                    ("publicKeyBase58", format!("{SEC}publicKeyBase58")),
                    ("signatureAlgorithm", format!("{SEC}signingAlgorithm")),
                    ("signatureValue", format!("{SEC}signatureValue")),
                ] {
                    self.terms.insert(name.to_string(), def(&iri));
                }
                for (name, iri) in [
                    ("creator", format!("{DC}creator")),
                    ("owner", format!("{SEC}owner")),
                    ("publicKey", format!("{SEC}publicKey")),
                    ("privateKey", format!("{SEC}privateKey")),
                    ("signature", format!("{SEC}signature")),
                    ("authenticationTag", format!("{SEC}authenticationTag")),
                ] {
                    self.terms.insert(name.to_string(), id_def(&iri));
                }
                for (name, iri) in [
                    ("created", format!("{DC}created")),
                    ("expires", format!("{SEC}expiration")),
                    ("revoked", format!("{SEC}revoked")),
                ] {
                    self.terms
                        .insert(name.to_string(), dt_def(&iri, XSD_DATETIME));
                }
                true
            }
            _ => false,
        }
    }

    fn add_inline(&mut self, context: &serde_json::Map<String, Value>) {
        // first pass: prefixes and keyword aliases
        let mut prefixes: HashMap<String, String> = HashMap::new();
        for (term, definition) in context {
            if let Value::String(s) = definition {
                match s.as_str() {
                    "@id" => self.id_aliases.push(term.clone()),
                    "@type" => self.type_aliases.push(term.clone()),
                    iri if iri.ends_with('#') || iri.ends_with('/') => {
                        prefixes.insert(term.clone(), iri.to_string());
                    }
                    _ => {}
                }
            }
        }
        let expand = |value: &str| -> Option<String> {
            if value.starts_with('@') {
                return None;
            }
            if let Some((prefix, suffix)) = value.split_once(':') {
                if let Some(base) = prefixes.get(prefix) {
                    return Some(format!("{base}{suffix}"));
                }
            }
            if value.contains(':') {
                Some(value.to_string())
            } else {
                None
            }
        };
        for (term, definition) in context {
            match definition {
                Value::String(s) => {
                    if let Some(iri) = expand(s) {
                        self.terms.insert(term.clone(), def(&iri));
                    }
                }
                Value::Object(map) => {
                    let Some(iri) = map
                        .get("@id")
                        .and_then(Value::as_str)
                        .and_then(|v| expand(v))
                    else {
                        continue;
                    };
                    let mut d = def(&iri);
                    match map.get("@type").and_then(Value::as_str) {
                        Some("@id") => d.is_id = true,
                        Some(dt) => d.datatype = expand(dt),
                        None => {}
                    }
                    if map.get("@container").and_then(Value::as_str) == Some("@list") {
                        d.is_list = true;
                    }
                    self.terms.insert(term.clone(), d);
                }
                _ => {}
            }
        }
    }

    fn apply(&mut self, context: &Value, extra: &HashMap<String, Value>) {
        match context {
            Value::String(url) => {
                if !self.add_builtin(url) {
                    if let Some(Value::Object(map)) = extra
                        .get(url.as_str())
                        .map(|doc| doc.get("@context").unwrap_or(doc))
                    {
                        self.add_inline(map);
                    }
                }
            }
            Value::Object(map) => self.add_inline(map),
            Value::Array(entries) => {
                for entry in entries {
                    self.apply(entry, extra);
                }
            }
            _ => {}
        }
    }

    fn is_id_key(&self, key: &str) -> bool {
        key == "@id" || self.id_aliases.iter().any(|a| a == key)
    }

    fn is_type_key(&self, key: &str) -> bool {
        key == "@type" || self.type_aliases.iter().any(|a| a == key)
    }

    fn expand_type_value(&self, value: &str) -> Option<String> {
        if let Some(d) = self.terms.get(value) {
            return Some(d.iri.clone());
        }
        if value.contains(':') && !value.starts_with('@') {
            return Some(value.to_string());
        }
        None
    }
}

struct Converter<'a> {
    context: ActiveContext,
    extra: &'a HashMap<String, Value>,
    quads: Vec<Quad>,
    blank_counter: usize,
}

/// Convert a compacted JSON-LD document into quads. `extra_contexts` maps
/// remote context URLs (beyond the built-in ones) to their fetched documents.
pub(crate) fn json_to_quads(
    document: &Value,
    extra_contexts: &HashMap<String, Value>,
) -> Result<Vec<Quad>, Error> {
    let Value::Object(_) = document else {
        return Err(Error::Application(
            "only JSON objects can be canonicalized".to_string(),
        ));
    };
    let mut converter = Converter {
        context: ActiveContext::default(),
        extra: extra_contexts,
        quads: Vec::new(),
        blank_counter: 0,
    };
    if let Some(context) = document.get("@context") {
        let extra = converter.extra;
        converter.context.apply(context, extra);
    }
    converter.node(document)?;
    Ok(converter.quads)
}

impl Converter<'_> {
    fn fresh_blank(&mut self) -> Term {
        let term = Term::Blank(format!("b{}", self.blank_counter));
        self.blank_counter += 1;
        term
    }

    fn subject_term(&mut self, id: Option<&str>) -> Term {
        match id {
            Some(id) => {
                if let Some(label) = id.strip_prefix("_:") {
                    Term::Blank(label.to_string())
                } else {
                    Term::Iri(id.to_string())
                }
            }
            None => self.fresh_blank(),
        }
    }

    /// Emit the quads for a node object and return its subject term.
    fn node(&mut self, node: &Value) -> Result<Term, Error> {
        let Value::Object(map) = node else {
            return Err(Error::Application("expected a node object".to_string()));
        };
        // a nested @context refines term definitions for the subtree; the
        // shapes we handle never retract, so applying on top is enough
        let saved = if map.contains_key("@context") {
            let saved = self.context.clone();
            if let Some(context) = map.get("@context") {
                let extra = self.extra;
                self.context.apply(context, extra);
            }
            Some(saved)
        } else {
            None
        };

        let id = map
            .iter()
            .find(|(k, _)| self.context.is_id_key(k))
            .and_then(|(_, v)| v.as_str());
        let subject = self.subject_term(id);

        for (key, value) in map {
            if key == "@context" || self.context.is_id_key(key) {
                continue;
            }
            if self.context.is_type_key(key) {
                let tags = match value {
                    Value::Array(tags) => tags.iter().filter_map(Value::as_str).collect(),
                    Value::String(tag) => vec![tag.as_str()],
                    _ => Vec::new(),
                };
                for tag in tags {
                    if let Some(iri) = self.context.expand_type_value(tag) {
                        self.quads.push(Quad {
                            subject: subject.clone(),
                            predicate: RDF_TYPE.to_string(),
                            object: Term::Iri(iri),
                        });
                    }
                }
                continue;
            }
            let Some(def) = self.term_def(key) else {
                continue;
            };
            if def.is_list {
                let items = match value {
                    Value::Array(items) => items.as_slice(),
                    single => std::slice::from_ref(single),
                };
                let head = self.list(items, &def)?;
                self.quads.push(Quad {
                    subject: subject.clone(),
                    predicate: def.iri.clone(),
                    object: head,
                });
                continue;
            }
            let values = match value {
                Value::Array(values) => values.as_slice(),
                single => std::slice::from_ref(single),
            };
            for value in values {
                if let Some(object) = self.value(value, &def)? {
                    self.quads.push(Quad {
                        subject: subject.clone(),
                        predicate: def.iri.clone(),
                        object,
                    });
                }
            }
        }

        if let Some(saved) = saved {
            self.context = saved;
        }
        Ok(subject)
    }

    fn term_def(&self, key: &str) -> Option<TermDef> {
        if let Some(def) = self.context.terms.get(key) {
            return Some(def.clone());
        }
        // absolute IRIs and defined CURIEs act as their own predicate
        if key.starts_with('@') {
            return None;
        }
        if let Some((prefix, _suffix)) = key.split_once(':') {
            if let Some(base) = self.context.terms.get(prefix) {
                let suffix = &key[prefix.len() + 1..];
                return Some(def(&format!("{}{suffix}", base.iri)));
            }
            return Some(def(key));
        }
        None
    }

    fn list(&mut self, items: &[Value], def: &TermDef) -> Result<Term, Error> {
        let mut head = Term::Iri(RDF_NIL.to_string());
        let mut element = TermDef::clone(def);
        element.is_list = false;
        for item in items.iter().rev() {
            let node = self.fresh_blank();
            if let Some(object) = self.value(item, &element)? {
                self.quads.push(Quad {
                    subject: node.clone(),
                    predicate: RDF_FIRST.to_string(),
                    object,
                });
            }
            self.quads.push(Quad {
                subject: node.clone(),
                predicate: RDF_REST.to_string(),
                object: head,
            });
            head = node;
        }
        Ok(head)
    }

    fn value(&mut self, value: &Value, def: &TermDef) -> Result<Option<Term>, Error> {
        let term = match value {
            Value::Null => None,
            Value::String(s) => {
                if def.is_id {
                    Some(self.subject_term(Some(s)))
                } else {
                    Some(Term::Literal {
                        value: s.clone(),
                        datatype: def
                            .datatype
                            .clone()
                            .unwrap_or_else(|| XSD_STRING.to_string()),
                        language: None,
                    })
                }
            }
            Value::Bool(b) => Some(Term::Literal {
                value: b.to_string(),
                datatype: XSD_BOOLEAN.to_string(),
                language: None,
            }),
            Value::Number(n) => Some(number_literal(n)),
            Value::Object(map) => {
                if let Some(inner) = map.get("@value") {
                    let datatype = map
                        .get("@type")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let language = map
                        .get("@language")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    match inner {
                        Value::String(s) => Some(Term::Literal {
                            value: s.clone(),
                            datatype: datatype.unwrap_or_else(|| {
                                if language.is_some() {
                                    "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString"
                                        .to_string()
                                } else {
                                    XSD_STRING.to_string()
                                }
                            }),
                            language,
                        }),
                        Value::Bool(b) => Some(Term::Literal {
                            value: b.to_string(),
                            datatype: datatype.unwrap_or_else(|| XSD_BOOLEAN.to_string()),
                            language: None,
                        }),
                        Value::Number(n) => Some(number_literal(n)),
                        _ => None,
                    }
                } else {
                    Some(self.node(value)?)
                }
            }
            Value::Array(_) => {
                return Err(Error::Application("nested arrays are not valid JSON-LD".to_string()))
            }
        };
        Ok(term)
    }
}

fn number_literal(n: &serde_json::Number) -> Term {
    if let Some(i) = n.as_i64() {
        return Term::Literal {
            value: i.to_string(),
            datatype: XSD_INTEGER.to_string(),
            language: None,
        };
    }
    let f = n.as_f64().unwrap_or(0.0);
    // canonical xsd:double lexical form: mantissa with a fraction digit,
    // then E and the exponent
    let formatted = format!("{f:E}");
    let value = if formatted.contains('.') {
        formatted
    } else {
        match formatted.split_once('E') {
            Some((mantissa, exponent)) => format!("{mantissa}.0E{exponent}"),
            None => format!("{formatted}.0E0"),
        }
    };
    Term::Literal {
        value,
        datatype: XSD_DOUBLE.to_string(),
        language: None,
    }
}

fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Serialize a term in N-Quads syntax.
pub(crate) fn term_to_nquads(term: &Term) -> String {
    match term {
        Term::Iri(iri) => format!("<{iri}>"),
        Term::Blank(label) => format!("_:{label}"),
        Term::Literal {
            value,
            datatype,
            language,
        } => {
            let escaped = escape_literal(value);
            if let Some(language) = language {
                format!("\"{escaped}\"@{language}")
            } else if datatype == XSD_STRING {
                format!("\"{escaped}\"")
            } else {
                format!("\"{escaped}\"^^<{datatype}>")
            }
        }
    }
}

/// Serialize a quad as an N-Quads line, without the trailing newline.
pub(crate) fn quad_to_nquads(quad: &Quad) -> String {
    format!(
        "{} <{}> {} .",
        term_to_nquads(&quad.subject),
        quad.predicate,
        term_to_nquads(&quad.object)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_options_conversion() {
        let options = json!({
            "@context": "https://w3id.org/identity/v1",
            "created": "2024-01-01T00:00:00Z",
            "creator": "https://example.com/users/alice#main-key",
            "nonce": "deadbeef12345678"
        });
        let mut quads = json_to_quads(&options, &HashMap::new()).unwrap();
        quads.sort_by_key(quad_to_nquads);
        let lines: Vec<String> = quads.iter().map(quad_to_nquads).collect();
        assert_eq!(
            lines,
            vec![
                "_:b0 <http://purl.org/dc/terms/created> \"2024-01-01T00:00:00Z\"^^<http://www.w3.org/2001/XMLSchema#dateTime> .",
                "_:b0 <http://purl.org/dc/terms/creator> <https://example.com/users/alice#main-key> .",
                "_:b0 <https://w3id.org/security#nonce> \"deadbeef12345678\" .",
            ]
        );
    }

    #[test]
    fn test_note_conversion() {
        let note = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://example.com/notes/1",
            "type": "Note",
            "attributedTo": "https://example.com/users/alice",
            "content": "Hello, world!"
        });
        let quads = json_to_quads(&note, &HashMap::new()).unwrap();
        let lines: Vec<String> = quads.iter().map(quad_to_nquads).collect();
        assert!(lines.contains(
            &"<https://example.com/notes/1> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <https://www.w3.org/ns/activitystreams#Note> ."
                .to_string()
        ));
        assert!(lines.contains(
            &"<https://example.com/notes/1> <https://www.w3.org/ns/activitystreams#content> \"Hello, world!\" ."
                .to_string()
        ));
    }

    #[test]
    fn test_unknown_terms_dropped() {
        let doc = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://example.com/x",
            "madeUpProperty": "ignored"
        });
        let quads = json_to_quads(&doc, &HashMap::new()).unwrap();
        assert!(quads.is_empty());
    }

    #[test]
    fn test_inline_context() {
        let doc = json!({
            "@context": { "content": "https://www.w3.org/ns/activitystreams#content" },
            "content": "hi"
        });
        let quads = json_to_quads(&doc, &HashMap::new()).unwrap();
        assert_eq!(quads.len(), 1);
        assert_eq!(
            quads[0].predicate,
            "https://www.w3.org/ns/activitystreams#content"
        );
    }

    #[test]
    fn test_embedded_node() {
        let doc = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "actor": "https://example.com/users/alice",
            "object": {
                "type": "Note",
                "content": "nested"
            }
        });
        let quads = json_to_quads(&doc, &HashMap::new()).unwrap();
        // actor IRI object, rdf:type for both nodes, object link, content
        assert_eq!(quads.len(), 5);
    }
}
