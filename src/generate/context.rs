//! Per-run context bundle assembled from the user's document data.
//!
//! The bundle is a bounded set of key/value facts (education, experience,
//! skills, certifications) supplied by the document-processing subsystem.
//! Its digest is the second half of the generation idempotency key: two
//! tasks with the same `(question, digest)` are duplicates even across runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ContextError;

/// Stable hex digest of a context bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextDigest(String);

impl ContextDigest {
    /// Get the digest string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bounded set of document-derived facts about the user.
///
/// Facts are kept in a `BTreeMap` so the digest does not depend on
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    facts: BTreeMap<String, String>,
}

impl ContextBundle {
    /// Creates an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bundle from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            facts: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Adds or replaces a fact.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(key.into(), value.into());
    }

    /// Looks up a fact.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }

    /// Number of facts in the bundle.
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Whether the bundle holds no facts.
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Computes the bundle's stable digest.
    ///
    /// The digest is SHA-256 over the canonical `key\x1fvalue\x1e` framing of
    /// the sorted facts, so equal bundles hash equally regardless of how
    /// they were built.
    pub fn digest(&self) -> ContextDigest {
        let mut hasher = Sha256::new();
        for (key, value) in &self.facts {
            hasher.update(key.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1e]);
        }
        ContextDigest(hex::encode(hasher.finalize()))
    }

    /// Renders the bundle as prompt text, one `key: value` line per fact.
    pub fn render(&self) -> String {
        self.facts
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Read-only boundary to the document-processing subsystem.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Returns the context bundle for a user.
    async fn context_bundle(&self, user_ref: &str) -> Result<ContextBundle, ContextError>;
}

/// Context source serving one fixed bundle for every user.
///
/// Stands in for the document-processing subsystem in tests and
/// single-user deployments where the facts come from a config file.
pub struct StaticContextSource {
    bundle: ContextBundle,
}

impl StaticContextSource {
    /// Creates a source over a fixed bundle.
    pub fn new(bundle: ContextBundle) -> Self {
        Self { bundle }
    }

    /// Loads the bundle from a JSON file of `{"key": "value"}` facts.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ContextError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ContextError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let facts: BTreeMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| ContextError::Unavailable(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            bundle: ContextBundle { facts },
        })
    }
}

#[async_trait]
impl ContextSource for StaticContextSource {
    async fn context_bundle(&self, _user_ref: &str) -> Result<ContextBundle, ContextError> {
        Ok(self.bundle.clone())
    }
}
