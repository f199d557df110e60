//! Rule identity and dependency declarations.

use serde::{Deserialize, Serialize};

use crate::error::RuleSetError;

/// Declarative metadata for a single rule.
///
/// A rule's behavior (predicate + action) is supplied by the host program;
/// the metadata is what the dependency resolver and the engines consume:
/// the rule's name, the names it must run after, the names it satisfies,
/// and an optional predicate-cache declaration.
///
/// `provides` always contains the rule's own name, so depending on a rule
/// by name needs no extra declaration on the provider side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMetadata {
    /// Unique-ish name of the rule. Uniqueness within a ruleset is
    /// recommended but not required.
    pub name: String,
    /// Names this rule must run after.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Names this rule satisfies. Always includes `name`.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Optional predicate-cache declaration.
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    /// Optional description of what this rule does.
    #[serde(default)]
    pub description: Option<String>,
}

impl RuleMetadata {
    /// Create metadata for a rule with the given name.
    ///
    /// Returns [`RuleSetError::EmptyRuleName`] if the name is empty;
    /// identity is always explicit, never inferred.
    pub fn new(name: impl Into<String>) -> Result<Self, RuleSetError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RuleSetError::EmptyRuleName);
        }
        let provides = vec![name.clone()];
        Ok(Self {
            name,
            dependencies: Vec::new(),
            provides,
            cache: None,
            description: None,
        })
    }

    /// Add a dependency name.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Add a provided name (in addition to the rule's own name).
    #[must_use]
    pub fn with_provides(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.provides.contains(&name) {
            self.provides.push(name);
        }
        self
    }

    /// Declare a predicate-cache slot for this rule.
    ///
    /// Multiple rules may intentionally share one key; the key is
    /// independent of rule identity.
    #[must_use]
    pub fn with_cache(mut self, key: impl Into<String>, scope: CacheScope) -> Self {
        self.cache = Some(CacheSpec {
            key: key.into(),
            scope,
        });
        self
    }

    /// Set a description.
    #[must_use]
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Predicate-cache declaration: which slot to use and how long it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Caller-declared cache key, independent of the rule name.
    pub key: String,
    /// Lifetime of cached entries under this key.
    pub scope: CacheScope,
}

/// Lifetime of a predicate-cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// Entries live while one input item is being processed.
    PerInput,
    /// Entries live for one whole `apply` call across all items.
    PerExecution,
}
