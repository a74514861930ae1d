//! URI-template routing
//!
//! The router is the single source of truth for URL shapes. Every route is an
//! RFC 6570 level 1 template (`/users/{handle}/inbox`) registered under a
//! logical name; all URI construction in [Context](crate::context::Context)
//! goes through [Router::build].

use crate::error::Error;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::{HashMap, HashSet};

/// Unreserved characters per RFC 3986 stay literal, everything else is
/// percent-encoded during expansion.
const EXPANSION: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable(String),
}

/// A parsed RFC 6570 level 1 URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    parts: Vec<Part>,
    literal_len: usize,
}

impl UriTemplate {
    /// Parse a template string. Must start with `/`; variables are written
    /// `{name}` and match a single path segment.
    pub fn parse(template: &str) -> Result<UriTemplate, Error> {
        if !template.starts_with('/') {
            return Err(Error::InvalidTemplate(format!(
                "template {template:?} must start with '/'"
            )));
        }
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(Error::InvalidTemplate(format!(
                                    "unclosed variable in {template:?}"
                                )))
                            }
                            Some(v) => name.push(v),
                        }
                    }
                    if name.is_empty()
                        || !name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(Error::InvalidTemplate(format!(
                            "invalid variable name {name:?} in {template:?}"
                        )));
                    }
                    if !seen.insert(name.clone()) {
                        return Err(Error::InvalidTemplate(format!(
                            "duplicate variable {name:?} in {template:?}"
                        )));
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(Part::Variable(name));
                }
                '}' => {
                    return Err(Error::InvalidTemplate(format!(
                        "unmatched '}}' in {template:?}"
                    )))
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        let literal_len = parts
            .iter()
            .map(|p| match p {
                Part::Literal(l) => l.len(),
                Part::Variable(_) => 0,
            })
            .sum();
        Ok(UriTemplate { parts, literal_len })
    }

    /// Names of the variables in this template.
    pub fn variables(&self) -> HashSet<String> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Variable(name) => Some(name.clone()),
                Part::Literal(_) => None,
            })
            .collect()
    }

    /// Match a pathname against this template, extracting decoded variable
    /// values. Variables never match across `/`.
    fn matches(&self, pathname: &str) -> Option<HashMap<String, String>> {
        let mut values = HashMap::new();
        let mut rest = pathname;
        for (i, part) in self.parts.iter().enumerate() {
            match part {
                Part::Literal(l) => {
                    rest = rest.strip_prefix(l.as_str())?;
                }
                Part::Variable(name) => {
                    // the variable extends to the start of the next literal,
                    // or to the end of the path
                    let raw = match self.parts.get(i + 1) {
                        Some(Part::Literal(next)) => {
                            let idx = rest.find(next.as_str())?;
                            let (raw, tail) = rest.split_at(idx);
                            rest = tail;
                            raw
                        }
                        _ => std::mem::take(&mut rest),
                    };
                    if raw.is_empty() || raw.contains('/') {
                        return None;
                    }
                    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
                    values.insert(name.clone(), decoded.into_owned());
                }
            }
        }
        if rest.is_empty() {
            Some(values)
        } else {
            None
        }
    }

    /// Expand the template with the given values. Returns `None` when a
    /// required variable is missing.
    fn expand(&self, values: &HashMap<String, String>) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(l) => out.push_str(l),
                Part::Variable(name) => {
                    let value = values.get(name)?;
                    out.push_str(&utf8_percent_encode(value, EXPANSION).to_string());
                }
            }
        }
        Some(out)
    }
}

#[derive(Debug, Clone)]
struct Route {
    name: String,
    template: UriTemplate,
}

/// Result of a successful [Router::route] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Logical name of the matched route
    pub name: String,
    /// Extracted variable values
    pub values: HashMap<String, String>,
}

/// Table of named URI templates.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Router {
        Router::default()
    }

    /// Register `template` under `name` and return the set of variable names.
    /// At most one route may exist per name.
    pub fn add(&mut self, template: &str, name: &str) -> Result<HashSet<String>, Error> {
        if self.has(name) {
            return Err(Error::RouteAlreadyExists(name.to_string()));
        }
        let template = UriTemplate::parse(template)?;
        let variables = template.variables();
        self.routes.push(Route {
            name: name.to_string(),
            template,
        });
        Ok(variables)
    }

    /// Whether a route with this name exists.
    pub fn has(&self, name: &str) -> bool {
        self.routes.iter().any(|r| r.name == name)
    }

    /// Match a pathname against all registered templates. The most literal
    /// (longest-specific) match wins; ties go to the earliest registration.
    pub fn route(&self, pathname: &str) -> Option<RouteMatch> {
        self.routes
            .iter()
            .filter_map(|r| {
                r.template.matches(pathname).map(|values| {
                    (
                        r.template.literal_len,
                        RouteMatch {
                            name: r.name.clone(),
                            values,
                        },
                    )
                })
            })
            // max_by_key returns the last maximum; compare strictly so the
            // first registration wins ties
            .fold(None, |best: Option<(usize, RouteMatch)>, candidate| {
                match best {
                    Some(b) if b.0 >= candidate.0 => Some(b),
                    _ => Some(candidate),
                }
            })
            .map(|(_, m)| m)
    }

    /// Expand the named template with `values`. Returns `None` when the route
    /// does not exist or a required variable is missing.
    pub fn build(&self, name: &str, values: &HashMap<String, String>) -> Option<String> {
        self.routes
            .iter()
            .find(|r| r.name == name)?
            .template
            .expand(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_add_returns_variables() {
        let mut router = Router::new();
        let vars = router.add("/users/{handle}/inbox", "inbox").unwrap();
        assert_eq!(vars, HashSet::from(["handle".to_string()]));
    }

    #[test]
    fn test_template_must_start_with_slash() {
        let mut router = Router::new();
        assert!(router.add("users/{handle}", "actor").is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut router = Router::new();
        router.add("/users/{handle}", "actor").unwrap();
        let err = router.add("/people/{handle}", "actor").unwrap_err();
        assert_eq!(err, Error::RouteAlreadyExists(String::new()));
    }

    #[test]
    fn test_route_and_build_roundtrip() {
        let mut router = Router::new();
        router.add("/users/{handle}", "actor").unwrap();
        router.add("/users/{handle}/followers", "followers").unwrap();

        let built = router
            .build("followers", &values(&[("handle", "alice")]))
            .unwrap();
        assert_eq!(built, "/users/alice/followers");

        let matched = router.route(&built).unwrap();
        assert_eq!(matched.name, "followers");
        assert_eq!(matched.values, values(&[("handle", "alice")]));
    }

    #[test]
    fn test_longest_specific_match() {
        let mut router = Router::new();
        router.add("/users/{handle}", "actor").unwrap();
        router.add("/users/{handle}/outbox", "outbox").unwrap();
        assert_eq!(router.route("/users/alice/outbox").unwrap().name, "outbox");
        assert_eq!(router.route("/users/alice").unwrap().name, "actor");
    }

    #[test]
    fn test_variables_do_not_span_segments() {
        let mut router = Router::new();
        router.add("/users/{handle}", "actor").unwrap();
        assert!(router.route("/users/alice/inbox").is_none());
    }

    #[test]
    fn test_build_missing_variable() {
        let mut router = Router::new();
        router.add("/notes/{id}", "object:Note").unwrap();
        assert!(router.build("object:Note", &HashMap::new()).is_none());
        assert!(router.build("missing", &HashMap::new()).is_none());
    }

    #[test]
    fn test_expansion_percent_encodes() {
        let mut router = Router::new();
        router.add("/users/{handle}", "actor").unwrap();
        let built = router
            .build("actor", &values(&[("handle", "alice smith")]))
            .unwrap();
        assert_eq!(built, "/users/alice%20smith");
        let matched = router.route(&built).unwrap();
        assert_eq!(matched.values["handle"], "alice smith");
    }
}
