//! The generic message payload carried by pipes and network frames.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tagged message value.
///
/// Transports treat values as opaque; only ordering and message boundaries
/// matter to them. Dictionaries keep their keys sorted so two equal values
/// always serialize to the same bytes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KgrValue {
    /// Absence of a value.
    #[default]
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<KgrValue>),
    /// String-keyed map of values.
    Dictionary(BTreeMap<String, KgrValue>),
}

impl KgrValue {
    /// Build an empty dictionary.
    pub fn dictionary() -> Self {
        Self::Dictionary(BTreeMap::new())
    }

    /// Insert a key into a dictionary value, returning the updated value.
    ///
    /// Non-dictionary values are replaced by a fresh dictionary.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<KgrValue>) -> Self {
        match &mut self {
            Self::Dictionary(map) => {
                map.insert(key.into(), value.into());
                self
            }
            _ => Self::dictionary().with(key, value),
        }
    }

    /// Look up a key in a dictionary value.
    pub fn get(&self, key: &str) -> Option<&KgrValue> {
        match self {
            Self::Dictionary(map) => map.get(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view, widening integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[KgrValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<String, KgrValue>> {
        match self {
            Self::Dictionary(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the variant, used in protocol error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Dictionary(_) => "dictionary",
        }
    }
}

impl From<bool> for KgrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for KgrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for KgrValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for KgrValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for KgrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for KgrValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for KgrValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<KgrValue>> for KgrValue {
    fn from(v: Vec<KgrValue>) -> Self {
        Self::Array(v)
    }
}

impl From<BTreeMap<String, KgrValue>> for KgrValue {
    fn from(v: BTreeMap<String, KgrValue>) -> Self {
        Self::Dictionary(v)
    }
}

impl std::fmt::Display for KgrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "<{}>", self.type_name()),
        }
    }
}
