//! Identifier and storage key generation.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{RatekeeperError, Result};

use super::rate::RateSpec;

/// Prefix shared by every storage key the engine produces.
const KEY_PREFIX: &str = "LIMITER";

/// An ordered, non-empty tuple of strings naming a rate-limited scope.
///
/// Typically `[namespace, operation, methods?, caller?]`. Order is significant:
/// two identifiers address the same counter only when every component matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    components: Vec<String>,
}

impl Identifier {
    /// Create an identifier from its components.
    ///
    /// At least one component (the namespace) is required.
    pub fn new<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        if components.is_empty() {
            return Err(RatekeeperError::InvalidIdentifier(
                "at least one identifier component is required".to_string(),
            ));
        }
        Ok(Self { components })
    }

    /// The components in order.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Append a component, returning the extended identifier.
    pub fn with(mut self, component: impl fmt::Display) -> Self {
        self.components.push(component.to_string());
        self
    }

    /// Derive the storage key for this identifier under `rate`.
    ///
    /// Format: `LIMITER/<component>/.../<amount>/<multiples>/<period>`.
    /// Components are escaped so that a `/` inside one can never be mistaken
    /// for a separator.
    pub fn storage_key(&self, rate: &RateSpec) -> String {
        let mut key = String::from(KEY_PREFIX);
        for component in &self.components {
            key.push('/');
            key.push_str(&escape_component(component));
        }
        key.push('/');
        key.push_str(&rate.key_suffix());
        key
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))
    }
}

/// Render a methods filter as a canonical tag: de-duplicated, sorted and
/// pipe-joined, so that `["PUT", "POST"]` and `["POST", "PUT"]` agree.
pub fn methods_tag<I, S>(methods: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let methods: BTreeSet<String> = methods
        .into_iter()
        .map(|m| m.as_ref().to_string())
        .collect();
    methods.into_iter().collect::<Vec<_>>().join("|")
}

/// Build an identifier from fixed base components, an optional methods
/// filter and an optional per-caller key value (appended last).
pub fn build_identifier<B, M>(
    base: &[B],
    methods: Option<&[M]>,
    extra: Option<&dyn fmt::Display>,
) -> Result<Identifier>
where
    B: AsRef<str>,
    M: AsRef<str>,
{
    let mut identifier = Identifier::new(base.iter().map(|b| b.as_ref().to_string()))?;

    if let Some(methods) = methods.filter(|m| !m.is_empty()) {
        identifier = identifier.with(methods_tag(methods));
    }

    if let Some(extra) = extra {
        identifier = identifier.with(extra);
    }

    Ok(identifier)
}

fn escape_component(component: &str) -> String {
    component.replace('%', "%25").replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rate::parse;

    const NO_METHODS: Option<&[&str]> = None;

    #[test]
    fn test_identifier_requires_namespace() {
        let err = Identifier::new(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, RatekeeperError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_storage_key_format() {
        let rate = parse("5/minute").unwrap();
        let id = build_identifier(&["app.views", "by_string_key"], NO_METHODS, Some(&42)).unwrap();

        assert_eq!(
            id.storage_key(&rate),
            "LIMITER/app.views/by_string_key/42/5/1/minute"
        );
    }

    #[test]
    fn test_storage_key_depends_on_rate() {
        let id = Identifier::new(["ns", "op"]).unwrap();
        let a = id.storage_key(&parse("5/minute").unwrap());
        let b = id.storage_key(&parse("5/2 minutes").unwrap());
        let c = id.storage_key(&parse("6/minute").unwrap());

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, id.storage_key(&parse("5/minute").unwrap()));
    }

    #[test]
    fn test_storage_key_escapes_separators() {
        let rate = parse("1/second").unwrap();
        let joined = Identifier::new(["a/b", "c"]).unwrap();
        let split = Identifier::new(["a", "b/c"]).unwrap();

        assert_ne!(joined.storage_key(&rate), split.storage_key(&rate));
        assert_eq!(joined.storage_key(&rate), "LIMITER/a%2Fb/c/1/1/second");
    }

    #[test]
    fn test_methods_order_independent() {
        let rate = parse("5/minute").unwrap();
        let a = build_identifier(&["ns", "op"], Some(&["POST", "PUT"][..]), None).unwrap();
        let b = build_identifier(&["ns", "op"], Some(&["PUT", "POST"][..]), None).unwrap();
        let c = build_identifier(&["ns", "op"], Some(&["POST"][..]), None).unwrap();

        assert_eq!(a.storage_key(&rate), b.storage_key(&rate));
        assert_ne!(a.storage_key(&rate), c.storage_key(&rate));
        assert_eq!(a.components()[2], "POST|PUT");
    }

    #[test]
    fn test_methods_deduplicated() {
        assert_eq!(methods_tag(["POST", "POST", "GET"]), "GET|POST");
    }

    #[test]
    fn test_caller_key_appended_last() {
        let id = build_identifier(&["ns", "op"], Some(&["GET"][..]), Some(&"user-1")).unwrap();
        assert_eq!(id.components(), &["ns", "op", "GET", "user-1"]);
        assert_eq!(id.to_string(), "ns/op/GET/user-1");
    }

    #[test]
    fn test_distinct_callers_distinct_keys() {
        let rate = parse("5/minute").unwrap();
        let a = build_identifier(&["ns", "op"], NO_METHODS, Some(&"A")).unwrap();
        let b = build_identifier(&["ns", "op"], NO_METHODS, Some(&"B")).unwrap();
        assert_ne!(a.storage_key(&rate), b.storage_key(&rate));
    }
}
