//! Hierarchical service names.
//!
//! A [`KgrPath`] is a slash-separated name such as `/editor/documents`. Paths
//! are always absolute once parsed: relative input is resolved against the
//! root, `.` segments are dropped and `..` segments pop their parent.

use crate::error::{KgrError, KgrResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Separator between path components.
pub const SEPARATOR: char = '/';

/// Normalized absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KgrPath {
    components: Vec<String>,
}

impl KgrPath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and normalize a path string.
    pub fn parse(raw: &str) -> KgrResult<Self> {
        let mut components: Vec<String> = Vec::new();
        for segment in raw.split(SEPARATOR) {
            match segment {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(KgrError::InvalidInput(format!(
                            "path escapes the root: {raw}"
                        )));
                    }
                }
                other => components.push(other.to_string()),
            }
        }
        Ok(Self { components })
    }

    /// Append a child component (which may itself contain separators).
    pub fn child(&self, name: &str) -> KgrResult<Self> {
        let mut raw = self.to_string();
        raw.push(SEPARATOR);
        raw.push_str(name);
        Self::parse(&raw)
    }

    /// The enclosing path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.components.is_empty() {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(Self { components })
    }

    /// Last component, if any.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Whether `prefix` is this path or one of its ancestors.
    ///
    /// Matching is component-wise: `/public` is a prefix of `/public/x` but
    /// not of `/publicity`.
    pub fn starts_with(&self, prefix: &KgrPath) -> bool {
        self.components.len() >= prefix.components.len()
            && self
                .components
                .iter()
                .zip(&prefix.components)
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for KgrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "{SEPARATOR}{component}")?;
        }
        Ok(())
    }
}

impl FromStr for KgrPath {
    type Err = KgrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for KgrPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KgrPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
