use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// Error for a malformed URI.
#[derive(Debug, Error)]
#[error("invalid URI: {uri:?}")]
pub struct InvalidUri {
    pub uri: String,
}

impl InvalidUri {
    fn new<S>(uri: S) -> Self
    where
        S: Into<String>,
    {
        Self { uri: uri.into() }
    }
}

// Components are non-empty and printable, with no whitespace, dots, or hashes.
static STRICT_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s.#\p{Cc}]+\.)*([^\s.#\p{Cc}]+)$").unwrap());

// Same as above, but any component may be empty.
static WILDCARD_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s.#\p{Cc}]*\.)*([^\s.#\p{Cc}]*)$").unwrap());

/// Validates a URI that names exactly one resource.
pub fn validate_strict_uri(uri: &str) -> Result<(), InvalidUri> {
    if STRICT_URI.is_match(uri) {
        Ok(())
    } else {
        Err(InvalidUri::new(uri))
    }
}

/// Validates a URI pattern, where empty components match anything.
pub fn validate_wildcard_uri(uri: &str) -> Result<(), InvalidUri> {
    if !uri.is_empty() && WILDCARD_URI.is_match(uri) {
        Ok(())
    } else {
        Err(InvalidUri::new(uri))
    }
}

/// A dot-separated identifier for a realm, procedure, topic, or error.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Wraps a value that is already known to be valid.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the dot-separated components.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Checks if this URI starts with the given prefix URI, at component boundaries or not.
    pub fn has_prefix(&self, prefix: &Uri) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_strict_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_strict_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl TryFrom<&WildcardUri> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &WildcardUri) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Uri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

/// A URI pattern for wildcard registrations and subscriptions.
///
/// Every strict [`Uri`] is also a valid wildcard URI.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct WildcardUri(String);

impl WildcardUri {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks if the concrete URI matches this pattern.
    ///
    /// Both must have the same number of components; empty components in the pattern match any
    /// component.
    pub fn matches(&self, uri: &Uri) -> bool {
        let pattern = self.0.split('.');
        let mut components = uri.components();
        for expected in pattern {
            match components.next() {
                Some(actual) if expected.is_empty() || expected == actual => (),
                _ => return false,
            }
        }
        components.next().is_none()
    }
}

impl Display for WildcardUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WildcardUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WildcardUri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_wildcard_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for WildcardUri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_wildcard_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<Uri> for WildcardUri {
    fn from(value: Uri) -> Self {
        Self(value.0)
    }
}

struct WildcardUriVisitor;

impl<'de> Visitor<'de> for WildcardUriVisitor {
    type Value = WildcardUri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a wildcard URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        WildcardUri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for WildcardUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(WildcardUriVisitor)
    }
}

#[cfg(test)]
mod uri_test {
    use crate::core::uri::{
        Uri,
        WildcardUri,
        validate_strict_uri,
        validate_wildcard_uri,
    };

    #[test]
    fn accepts_dot_separated_printable_components() {
        assert_matches::assert_matches!(validate_strict_uri("com"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example.add2"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example.onCounter"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("wamp.error.no_such_procedure"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example-1.x@y"), Ok(()));
    }

    #[test]
    fn rejects_malformed_strict_uris() {
        assert_matches::assert_matches!(validate_strict_uri(""), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("."), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com..example"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri(".com.example"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.example."), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.exa mple"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.example#"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.\u{7}bell"), Err(_));
    }

    #[test]
    fn wildcard_uris_allow_empty_components() {
        assert_matches::assert_matches!(validate_wildcard_uri("com.example.add2"), Ok(()));
        assert_matches::assert_matches!(validate_wildcard_uri("com..add2"), Ok(()));
        assert_matches::assert_matches!(validate_wildcard_uri(".example."), Ok(()));
        assert_matches::assert_matches!(validate_wildcard_uri(""), Err(_));
        assert_matches::assert_matches!(validate_wildcard_uri("com. .add2"), Err(_));
        assert_matches::assert_matches!(validate_wildcard_uri("com.#.add2"), Err(_));
    }

    #[test]
    fn wildcard_uri_matches_same_length_uris() {
        let pattern = WildcardUri::try_from("com..oncounter").unwrap();
        assert!(pattern.matches(&Uri::try_from("com.example.oncounter").unwrap()));
        assert!(pattern.matches(&Uri::try_from("com.other.oncounter").unwrap()));
        assert!(!pattern.matches(&Uri::try_from("com.example.add2").unwrap()));
        assert!(!pattern.matches(&Uri::try_from("com.example.sub.oncounter").unwrap()));
        assert!(!pattern.matches(&Uri::try_from("com.oncounter").unwrap()));
    }

    #[test]
    fn fails_deserialization_of_invalid_uri() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com..example""#), Err(err) => {
            assert!(err.to_string().contains("expected a URI"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<WildcardUri>(r#""""#), Err(err) => {
            assert!(err.to_string().contains("expected a wildcard URI"));
        });
    }
}
