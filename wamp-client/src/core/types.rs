use serde::{
    Deserialize,
    Serialize,
};

/// An integer value.
pub type Integer = u64;

/// A dictionary of values, keyed by string.
///
/// Used for keyword arguments, message options and details, and extra session metadata.
pub type Dictionary = ahash::HashMap<String, Value>;

/// A list of values.
///
/// Used for positional arguments.
pub type List = Vec<Value>;

/// A value that can be sent over WAMP messages, regardless of serialization format.
///
/// Non-negative integers always decode as [`Value::Integer`], so [`Value::Signed`] only holds
/// negative numbers once a value has crossed the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(Integer),
    Signed(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Dictionary(Dictionary),
    List(List),
    Null,
}

impl Value {
    /// The integer, if the value is an integer.
    pub fn integer(&self) -> Option<Integer> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// The signed integer, if the value is an integer that fits.
    pub fn signed(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => i64::try_from(*value).ok(),
            Self::Signed(value) => Some(*value),
            _ => None,
        }
    }

    /// The number, if the value is numeric.
    pub fn float(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Signed(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The string, if the value is a string.
    pub fn string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// The boolean, if the value is a boolean.
    pub fn bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// The dictionary, if the value is a dictionary.
    pub fn dictionary(&self) -> Option<&Dictionary> {
        match self {
            Self::Dictionary(value) => Some(value),
            _ => None,
        }
    }

    /// The list, if the value is a list.
    pub fn list(&self) -> Option<&List> {
        match self {
            Self::List(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Integer> for Value {
    fn from(value: Integer) -> Self {
        Self::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        match Integer::try_from(value) {
            Ok(value) => Self::Integer(value),
            Err(_) => Self::Signed(value),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Dictionary> for Value {
    fn from(value: Dictionary) -> Self {
        Self::Dictionary(value)
    }
}

impl From<List> for Value {
    fn from(value: List) -> Self {
        Self::List(value)
    }
}

/// Looks up a nested value in a dictionary by following a path of keys.
///
/// Every key except the last must name a dictionary.
pub fn lookup<'a>(dictionary: &'a Dictionary, path: &[&str]) -> Option<&'a Value> {
    let (last, parents) = path.split_last()?;
    let mut current = dictionary;
    for key in parents {
        current = current.get(*key)?.dictionary()?;
    }
    current.get(*last)
}

#[cfg(test)]
mod types_test {
    use crate::core::types::{
        Dictionary,
        List,
        Value,
        lookup,
    };

    #[test]
    fn deserializes_untagged_values() {
        assert_matches::assert_matches!(
            serde_json::from_str::<Value>(r#"[1, "a", true, {"b": []}]"#),
            Ok(Value::List(list)) => {
                pretty_assertions::assert_eq!(list, List::from_iter([
                    Value::Integer(1),
                    Value::String("a".to_owned()),
                    Value::Bool(true),
                    Value::Dictionary(Dictionary::from_iter([(
                        "b".to_owned(),
                        Value::List(List::default()),
                    )])),
                ]));
            }
        );
    }

    #[test]
    fn deserializes_negative_fractional_and_null_values() {
        assert_matches::assert_matches!(
            serde_json::from_str::<Value>(r#"[-1, 1.5, null, 2.0]"#),
            Ok(Value::List(list)) => {
                pretty_assertions::assert_eq!(list, List::from_iter([
                    Value::Signed(-1),
                    Value::Float(1.5),
                    Value::Null,
                    Value::Float(2.0),
                ]));
            }
        );
    }

    #[test]
    fn converts_numbers_between_representations() {
        assert_eq!(Value::from(7i64), Value::Integer(7));
        assert_eq!(Value::from(-7i64), Value::Signed(-7));
        assert_eq!(Value::Integer(7).signed(), Some(7));
        assert_eq!(Value::Integer(u64::MAX).signed(), None);
        assert_eq!(Value::Signed(-2).float(), Some(-2.0));
        assert_eq!(Value::Float(0.5).integer(), None);
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(false).is_null());
    }

    #[test]
    fn looks_up_nested_values() {
        let details: Dictionary = serde_json::from_str(
            r#"{"roles": {"dealer": {"features": {"call_canceling": true}}}}"#,
        )
        .unwrap();
        assert_eq!(
            lookup(&details, &["roles", "dealer", "features", "call_canceling"]),
            Some(&Value::Bool(true))
        );
        assert_eq!(lookup(&details, &["roles", "broker"]), None);
        assert_eq!(
            lookup(&details, &["roles", "dealer", "features", "call_canceling", "x"]),
            None
        );
        assert_eq!(lookup(&details, &[]), None);
    }
}
