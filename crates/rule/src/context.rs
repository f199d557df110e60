//! Per-call engine context (non-serializable).

use parking_lot::RwLock;
use uuid::Uuid;

use crate::cache::PredicateCache;

/// Mutable, request-scoped state threaded through every rule invocation.
///
/// Holds a trace identifier, a string-keyed bag of caller-defined values
/// for inter-rule communication, the two predicate-cache tables, and a
/// snapshot of the owning engine for introspection by rules.
///
/// A context is created fresh per top-level apply call unless the caller
/// supplies one to share trace/state across calls; the engine resets the
/// execution-scoped parts at the start of each call. The engine does not
/// synchronize access to the value bag beyond the lock's own consistency —
/// guarding concurrent mutation of individual entries is the caller's
/// responsibility.
#[derive(Debug)]
pub struct EngineContext {
    trace_id: Uuid,
    values: RwLock<serde_json::Map<String, serde_json::Value>>,
    per_input: PredicateCache,
    per_execution: PredicateCache,
    engine: RwLock<Option<EngineInfo>>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineContext {
    /// Create a context with a fresh trace identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4())
    }

    /// Create a context with a caller-supplied trace identifier.
    #[must_use]
    pub fn with_trace_id(trace_id: Uuid) -> Self {
        Self {
            trace_id,
            values: RwLock::new(serde_json::Map::new()),
            per_input: PredicateCache::new(),
            per_execution: PredicateCache::new(),
            engine: RwLock::new(None),
        }
    }

    /// The trace identifier for this context.
    #[must_use]
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Set a caller-defined value.
    pub fn set_value(&self, key: impl Into<String>, value: serde_json::Value) {
        self.values.write().insert(key.into(), value);
    }

    /// Get a caller-defined value.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        self.values.read().get(key).cloned()
    }

    /// Remove a caller-defined value, returning it if present.
    pub fn remove_value(&self, key: &str) -> Option<serde_json::Value> {
        self.values.write().remove(key)
    }

    /// The input-scoped predicate cache.
    #[must_use]
    pub fn per_input_cache(&self) -> &PredicateCache {
        &self.per_input
    }

    /// The execution-scoped predicate cache.
    #[must_use]
    pub fn per_execution_cache(&self) -> &PredicateCache {
        &self.per_execution
    }

    /// Reset execution-scoped state at the start of a top-level apply call.
    ///
    /// Clears the execution-scoped predicate cache. Caller-defined values
    /// survive so a shared context can carry state across calls.
    pub fn begin_execution(&self) {
        self.per_execution.clear();
        self.per_input.clear();
    }

    /// Reset input-scoped state before processing the next item.
    pub fn begin_item(&self) {
        self.per_input.clear();
    }

    /// Record the owning engine's shape for introspection by rules.
    pub fn attach_engine(&self, info: EngineInfo) {
        *self.engine.write() = Some(info);
    }

    /// A snapshot of the engine this context is currently attached to.
    #[must_use]
    pub fn engine(&self) -> Option<EngineInfo> {
        self.engine.read().clone()
    }
}

/// Immutable snapshot of an engine's shape, attached to the context so
/// rules can introspect the pipeline they run in without holding a
/// reference cycle back to the engine.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    /// Names of the main-phase rules, in input order.
    pub rule_names: Vec<String>,
    /// Names of the pre-phase rules (empty for single-object engines).
    pub pre_rule_names: Vec<String>,
    /// Names of the post-phase rules (empty for single-object engines).
    pub post_rule_names: Vec<String>,
    /// Whether stages execute their rules concurrently.
    pub is_parallel: bool,
    /// Whether the engine is the async variant.
    pub is_async: bool,
    /// Type name of the input subject.
    pub input_type: &'static str,
    /// Type name of the output subject (dual-object engines only).
    pub output_type: Option<&'static str>,
}
