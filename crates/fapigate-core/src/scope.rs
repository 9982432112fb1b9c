//! Normalized scope sets for consent entitlement checks.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered set of normalized scope strings
///
/// Scopes are trimmed and lower-cased at construction, so membership checks
/// are case- and whitespace-insensitive by construction rather than by
/// defensive re-normalization at every call site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Create an empty scope set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scope set from raw scope strings, normalizing each entry
    ///
    /// Empty entries are dropped; duplicates collapse.
    pub fn from_raw<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            scopes
                .into_iter()
                .filter_map(|s| {
                    let normalized = normalize(s.as_ref());
                    (!normalized.is_empty()).then_some(normalized)
                })
                .collect(),
        )
    }

    /// Parse a space-separated OAuth scope string
    pub fn from_scope_string(raw: &str) -> Self {
        Self::from_raw(raw.split_whitespace())
    }

    /// Case-insensitive membership check
    pub fn has_scope(&self, scope: &str) -> bool {
        self.0.contains(&normalize(scope))
    }

    /// Check that every scope in `required` is granted
    pub fn contains_all(&self, required: &ScopeSet) -> bool {
        required.0.is_subset(&self.0)
    }

    /// Number of distinct scopes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over normalized scopes in lexicographic order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope)?;
            first = false;
        }
        Ok(())
    }
}

fn normalize(scope: &str) -> String {
    scope.trim().to_ascii_lowercase()
}
