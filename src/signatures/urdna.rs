//! URDNA2015 canonicalization
//!
//! Deterministic blank-node labelling over the internal quad model, used by
//! the legacy `RsaSignature2017` verification path. Output is canonical
//! N-Quads, sorted, one quad per line.

use crate::signatures::rdf::{quad_to_nquads, term_to_nquads, Quad, Term};
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

#[derive(Debug, Clone)]
struct IdentifierIssuer {
    prefix: String,
    counter: usize,
    issued: HashMap<String, String>,
    order: Vec<String>,
}

impl IdentifierIssuer {
    fn new(prefix: &str) -> IdentifierIssuer {
        IdentifierIssuer {
            prefix: prefix.to_string(),
            counter: 0,
            issued: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn issue(&mut self, existing: &str) -> String {
        if let Some(id) = self.issued.get(existing) {
            return id.clone();
        }
        let id = format!("{}{}", self.prefix, self.counter);
        self.counter += 1;
        self.issued.insert(existing.to_string(), id.clone());
        self.order.push(existing.to_string());
        id
    }

    fn get(&self, existing: &str) -> Option<&String> {
        self.issued.get(existing)
    }

    fn has(&self, existing: &str) -> bool {
        self.issued.contains_key(existing)
    }
}

struct State<'a> {
    quads: &'a [Quad],
    blank_quads: HashMap<String, Vec<usize>>,
}

fn serialize_with<F: Fn(&str) -> String>(quad: &Quad, relabel: &F) -> String {
    let map = |term: &Term| match term {
        Term::Blank(label) => format!("_:{}", relabel(label)),
        other => term_to_nquads(other),
    };
    format!(
        "{} <{}> {} .",
        map(&quad.subject),
        quad.predicate,
        map(&quad.object)
    )
}

fn hash_first_degree(state: &State<'_>, identifier: &str) -> String {
    let mut nquads: Vec<String> = state.blank_quads[identifier]
        .iter()
        .map(|&i| {
            let line = serialize_with(&state.quads[i], &|label: &str| {
                if label == identifier { "a" } else { "z" }.to_string()
            });
            format!("{line}\n")
        })
        .collect();
    nquads.sort();
    sha256_hex(&nquads.concat())
}

fn hash_related(
    state: &State<'_>,
    canonical: &IdentifierIssuer,
    related: &str,
    quad: &Quad,
    issuer: &IdentifierIssuer,
    position: char,
) -> String {
    let mut input = position.to_string();
    if position != 'g' {
        input.push('<');
        input.push_str(&quad.predicate);
        input.push('>');
    }
    if let Some(id) = canonical.get(related) {
        input.push_str("_:");
        input.push_str(id);
    } else if let Some(id) = issuer.get(related) {
        input.push_str("_:");
        input.push_str(id);
    } else {
        input.push_str(&hash_first_degree(state, related));
    }
    sha256_hex(&input)
}

fn hash_n_degree(
    state: &State<'_>,
    canonical: &IdentifierIssuer,
    identifier: &str,
    issuer: IdentifierIssuer,
) -> (String, IdentifierIssuer) {
    let mut related_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for &qi in &state.blank_quads[identifier] {
        let quad = &state.quads[qi];
        for (term, position) in [(&quad.subject, 's'), (&quad.object, 'o')] {
            if let Term::Blank(label) = term {
                if label != identifier {
                    let hash = hash_related(state, canonical, label, quad, &issuer, position);
                    related_map.entry(hash).or_default().push(label.clone());
                }
            }
        }
    }

    let mut data_to_hash = String::new();
    let mut issuer = issuer;
    for (related_hash, blank_list) in related_map {
        data_to_hash.push_str(&related_hash);
        let mut chosen_path = String::new();
        let mut chosen_issuer: Option<IdentifierIssuer> = None;

        for permutation in blank_list
            .iter()
            .permutations(blank_list.len())
            .unique()
        {
            let mut issuer_copy = issuer.clone();
            let mut path = String::new();
            let mut recursion_list: Vec<String> = Vec::new();
            let mut abandoned = false;

            for related in &permutation {
                if let Some(id) = canonical.get(related) {
                    path.push_str("_:");
                    path.push_str(id);
                } else {
                    if !issuer_copy.has(related) {
                        recursion_list.push((*related).clone());
                    }
                    path.push_str("_:");
                    path.push_str(&issuer_copy.issue(related));
                }
                if !chosen_path.is_empty() && path.len() >= chosen_path.len() && path > chosen_path
                {
                    abandoned = true;
                    break;
                }
            }
            if abandoned {
                continue;
            }

            for related in &recursion_list {
                let (result_hash, result_issuer) =
                    hash_n_degree(state, canonical, related, issuer_copy);
                issuer_copy = result_issuer;
                path.push_str("_:");
                path.push_str(&issuer_copy.issue(related));
                path.push('<');
                path.push_str(&result_hash);
                path.push('>');
                if !chosen_path.is_empty() && path.len() >= chosen_path.len() && path > chosen_path
                {
                    abandoned = true;
                    break;
                }
            }
            if abandoned {
                continue;
            }

            if chosen_path.is_empty() || path < chosen_path {
                chosen_path = path;
                chosen_issuer = Some(issuer_copy);
            }
        }

        data_to_hash.push_str(&chosen_path);
        if let Some(chosen) = chosen_issuer {
            issuer = chosen;
        }
    }

    (sha256_hex(&data_to_hash), issuer)
}

/// Canonicalize a dataset: relabel blank nodes deterministically and return
/// sorted canonical N-Quads, one per line, newline-terminated.
pub(crate) fn canonicalize(quads: &[Quad]) -> String {
    let mut blank_quads: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, quad) in quads.iter().enumerate() {
        for term in [&quad.subject, &quad.object] {
            if let Term::Blank(label) = term {
                let entry = blank_quads.entry(label.clone()).or_default();
                if entry.last() != Some(&i) {
                    entry.push(i);
                }
            }
        }
    }
    let state = State { quads, blank_quads };
    let mut canonical = IdentifierIssuer::new("c14n");

    let mut hash_to_blanks: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for label in state.blank_quads.keys().sorted() {
        hash_to_blanks
            .entry(hash_first_degree(&state, label))
            .or_default()
            .push(label.clone());
    }

    let mut non_unique: Vec<Vec<String>> = Vec::new();
    for (_hash, blanks) in &hash_to_blanks {
        if blanks.len() == 1 {
            canonical.issue(&blanks[0]);
        } else {
            non_unique.push(blanks.clone());
        }
    }

    for blanks in non_unique {
        let mut hash_path_list: Vec<(String, IdentifierIssuer)> = Vec::new();
        for label in &blanks {
            if canonical.has(label) {
                continue;
            }
            let mut temporary = IdentifierIssuer::new("b");
            temporary.issue(label);
            hash_path_list.push(hash_n_degree(&state, &canonical, label, temporary));
        }
        hash_path_list.sort_by(|a, b| a.0.cmp(&b.0));
        for (_hash, issuer) in hash_path_list {
            for existing in &issuer.order {
                canonical.issue(existing);
            }
        }
    }

    let mut lines: Vec<String> = quads
        .iter()
        .map(|quad| {
            let line = serialize_with(quad, &|label: &str| {
                canonical
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| label.to_string())
            });
            format!("{line}\n")
        })
        .collect();
    lines.sort();
    lines.dedup();
    lines.concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iri(s: &str) -> Term {
        Term::Iri(s.to_string())
    }

    fn blank(s: &str) -> Term {
        Term::Blank(s.to_string())
    }

    fn literal(s: &str) -> Term {
        Term::Literal {
            value: s.to_string(),
            datatype: "http://www.w3.org/2001/XMLSchema#string".to_string(),
            language: None,
        }
    }

    #[test]
    fn test_single_blank_node() {
        let quads = vec![Quad {
            subject: blank("b0"),
            predicate: "http://example.com/p".to_string(),
            object: literal("v"),
        }];
        assert_eq!(
            canonicalize(&quads),
            "_:c14n0 <http://example.com/p> \"v\" .\n"
        );
    }

    #[test]
    fn test_labelling_is_input_label_independent() {
        let a = vec![
            Quad {
                subject: blank("x"),
                predicate: "http://example.com/p".to_string(),
                object: literal("first"),
            },
            Quad {
                subject: blank("y"),
                predicate: "http://example.com/p".to_string(),
                object: literal("second"),
            },
        ];
        let b = vec![
            Quad {
                subject: blank("y"),
                predicate: "http://example.com/p".to_string(),
                object: literal("first"),
            },
            Quad {
                subject: blank("x"),
                predicate: "http://example.com/p".to_string(),
                object: literal("second"),
            },
        ];
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn test_connected_blank_nodes() {
        let quads = vec![
            Quad {
                subject: blank("a"),
                predicate: "http://example.com/linked".to_string(),
                object: blank("b"),
            },
            Quad {
                subject: blank("b"),
                predicate: "http://example.com/name".to_string(),
                object: literal("leaf"),
            },
        ];
        let canonical = canonicalize(&quads);
        assert!(canonical.contains("_:c14n0"));
        assert!(canonical.contains("_:c14n1"));
        // two lines, sorted
        assert_eq!(canonical.lines().count(), 2);
    }

    #[test]
    fn test_ground_quads_unchanged() {
        let quads = vec![Quad {
            subject: iri("http://example.com/s"),
            predicate: "http://example.com/p".to_string(),
            object: iri("http://example.com/o"),
        }];
        assert_eq!(
            canonicalize(&quads),
            "<http://example.com/s> <http://example.com/p> <http://example.com/o> .\n"
        );
    }
}
