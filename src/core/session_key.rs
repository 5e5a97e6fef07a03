//! Hierarchical session keys.
//!
//! A key is a colon-separated path of node ids, outermost first:
//! `"12"`, `"12:7"`, `"12:7:3"`. A nested execution (sub-graph inside a loop
//! inside a batch) reports its innermost key, and every enclosing node shows
//! the same preview, so the tracker needs the prefixes of a key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment separator
pub const KEY_SEPARATOR: char = ':';

/// Session key parse errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKeyError {
    Empty,
    EmptySegment(String),
}

impl fmt::Display for SessionKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKeyError::Empty => write!(f, "Session key is empty"),
            SessionKeyError::EmptySegment(k) => write!(f, "Session key has an empty segment: {:?}", k),
        }
    }
}

impl std::error::Error for SessionKeyError {}

/// Validated hierarchical key (non-empty, no empty segments)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey(String);

impl SessionKey {
    pub fn parse(raw: &str) -> Result<Self, SessionKeyError> {
        if raw.is_empty() {
            return Err(SessionKeyError::Empty);
        }
        if raw.split(KEY_SEPARATOR).any(str::is_empty) {
            return Err(SessionKeyError::EmptySegment(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, outermost first
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// All prefixes from the root down to (and including) this key.
    ///
    /// `"a:b:c"` -> `["a", "a:b", "a:b:c"]`
    pub fn prefixes(&self) -> Vec<SessionKey> {
        let mut out = Vec::with_capacity(self.depth());
        for (idx, ch) in self.0.char_indices() {
            if ch == KEY_SEPARATOR {
                out.push(SessionKey(self.0[..idx].to_string()));
            }
        }
        out.push(self.clone());
        out
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}
