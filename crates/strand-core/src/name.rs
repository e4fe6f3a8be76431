//! Hierarchical names.
//!
//! A name is a list of text components written `/a/b/c`. Numbers are
//! carried in marked components: `%FD` version, `%FE` sequence number,
//! `%00` segment number, each followed by the decimal value.

use std::fmt;
use std::str::FromStr;

pub const VERSION_MARKER: &str = "%FD";
pub const SEQUENCE_MARKER: &str = "%FE";
pub const SEGMENT_MARKER: &str = "%00";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    components: Vec<String>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse `/a/b/c`. Leading and trailing slashes are optional; empty
    /// components in between are not allowed.
    pub fn parse(uri: &str) -> Result<Self, NameError> {
        let trimmed = uri.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::new());
        }
        let mut components = Vec::new();
        for part in trimmed.split('/') {
            if part.is_empty() {
                return Err(NameError::EmptyComponent(uri.to_string()));
            }
            components.push(part.to_string());
        }
        Ok(Self { components })
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(String::as_str)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> + '_ {
        self.components.iter().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// First `n` components.
    pub fn prefix(&self, n: usize) -> Name {
        Name {
            components: self.components[..n.min(self.components.len())].to_vec(),
        }
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.len() <= other.len() && self.components[..] == other.components[..self.len()]
    }

    pub fn append(mut self, component: impl Into<String>) -> Self {
        self.components.push(component.into());
        self
    }

    pub fn append_version(self, version: u64) -> Self {
        self.append(format!("{VERSION_MARKER}{version}"))
    }

    pub fn append_sequence(self, seq: u64) -> Self {
        self.append(format!("{SEQUENCE_MARKER}{seq}"))
    }

    pub fn append_segment(self, seg: u64) -> Self {
        self.append(format!("{SEGMENT_MARKER}{seg}"))
    }

    pub fn push(&mut self, component: impl Into<String>) {
        self.components.push(component.into());
    }
}

/// Value of a marked numeric component, if `component` carries `marker`.
pub fn marked_number(component: &str, marker: &str) -> Option<u64> {
    let digits = component.strip_prefix(marker)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn version_of(component: &str) -> Option<u64> {
    marked_number(component, VERSION_MARKER)
}

pub fn sequence_of(component: &str) -> Option<u64> {
    marked_number(component, SEQUENCE_MARKER)
}

pub fn segment_of(component: &str) -> Option<u64> {
    marked_number(component, SEGMENT_MARKER)
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for c in &self.components {
            write!(f, "/{c}")?;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("empty component in {0}")]
    EmptyComponent(String),

    #[error("{0} is not a stream name")]
    NotStreamName(String),

    #[error("{name}: {reason}")]
    Malformed { name: String, reason: &'static str },
}
