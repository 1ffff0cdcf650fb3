//! Label sets identify series; matchers select them.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DbError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A set of labels sorted by name with unique names.
///
/// The derived ordering compares pairwise by (name, value) and orders a strict prefix first,
/// which is the order series are listed in by queries and written into block indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Result<Self, DbError> {
        labels.sort();
        for w in labels.windows(2) {
            if w[0].name == w[1].name {
                return Err(DbError::InvalidLabels(format!(
                    "duplicate label name {:?}",
                    w[0].name
                )));
            }
        }
        if let Some(l) = labels.iter().find(|l| l.name.is_empty()) {
            return Err(DbError::InvalidLabels(format!(
                "empty label name for value {:?}",
                l.value
            )));
        }
        Ok(Self(labels))
    }

    pub fn from_pairs<N, V>(pairs: &[(N, V)]) -> Result<Self, DbError>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        Self::new(
            pairs
                .iter()
                .map(|(n, v)| Label::new(n.as_ref(), v.as_ref()))
                .collect(),
        )
    }

    /// Builds a set from labels that are already sorted and unique, e.g. decoded from disk.
    pub(crate) fn from_sorted(labels: Vec<Label>) -> Self {
        Self(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Deterministic 64-bit hash over all pairs.
    pub fn hash(&self) -> u64 {
        let mut h = DefaultHasher::new();
        for l in &self.0 {
            l.name.hash(&mut h);
            0xffu8.hash(&mut h);
            l.value.hash(&mut h);
            0xffu8.hash(&mut h);
        }
        h.finish()
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        f.write_str("}")
    }
}

/// Selects series by the value of one label. A series without the label is treated as having
/// the empty value.
#[derive(Debug, Clone)]
pub enum Matcher {
    Equal { name: String, value: String },
    NotEqual { name: String, value: String },
    Regex { name: String, re: Regex },
    NotRegex { name: String, re: Regex },
    Prefix { name: String, prefix: String },
}

impl Matcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher::Equal {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher::NotEqual {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Regex matchers are anchored at both ends.
    pub fn regex(name: impl Into<String>, pattern: &str) -> Result<Self, DbError> {
        Ok(Matcher::Regex {
            name: name.into(),
            re: anchored(pattern)?,
        })
    }

    pub fn not_regex(name: impl Into<String>, pattern: &str) -> Result<Self, DbError> {
        Ok(Matcher::NotRegex {
            name: name.into(),
            re: anchored(pattern)?,
        })
    }

    pub fn prefix(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Matcher::Prefix {
            name: name.into(),
            prefix: prefix.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Matcher::Equal { name, .. }
            | Matcher::NotEqual { name, .. }
            | Matcher::Regex { name, .. }
            | Matcher::NotRegex { name, .. }
            | Matcher::Prefix { name, .. } => name,
        }
    }

    pub fn matches(&self, v: &str) -> bool {
        match self {
            Matcher::Equal { value, .. } => v == value,
            Matcher::NotEqual { value, .. } => v != value,
            Matcher::Regex { re, .. } => re.is_match(v),
            Matcher::NotRegex { re, .. } => !re.is_match(v),
            Matcher::Prefix { prefix, .. } => v.starts_with(prefix.as_str()),
        }
    }

    /// Parses `name=value`, `name!=value`, `name=~re` and `name!~re`.
    pub fn parse(s: &str) -> Result<Self, DbError> {
        let bad = || DbError::InvalidLabels(format!("cannot parse matcher {:?}", s));
        if let Some((n, v)) = s.split_once("!=") {
            return Ok(Matcher::not_equal(n.trim(), v.trim()));
        }
        if let Some((n, v)) = s.split_once("!~") {
            return Matcher::not_regex(n.trim(), v.trim());
        }
        if let Some((n, v)) = s.split_once("=~") {
            return Matcher::regex(n.trim(), v.trim());
        }
        if let Some((n, v)) = s.split_once('=') {
            if n.trim().is_empty() {
                return Err(bad());
            }
            return Ok(Matcher::equal(n.trim(), v.trim()));
        }
        Err(bad())
    }
}

fn anchored(pattern: &str) -> Result<Regex, DbError> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| DbError::InvalidLabels(format!("invalid regex {:?}: {}", pattern, e)))
}
