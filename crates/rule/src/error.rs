//! Rule and ruleset error types.

use thiserror::Error;

/// Errors returned by rule predicates and actions at runtime.
///
/// The halt variants are typed control signals a rule may raise directly;
/// the engine interprets them natively without consulting the failure
/// policy. Arbitrary failures travel as [`RuleError::User`] and are routed
/// through the configured policy.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Abort processing of the current item; the batch continues.
    #[error("item halted: {0}")]
    HaltItem(String),

    /// Abort the entire batch.
    #[error("engine halted: {0}")]
    HaltEngine(String),

    /// An arbitrary failure raised by rule code.
    #[error("rule failed: {0}")]
    User(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RuleError {
    /// Wrap an arbitrary error raised by rule code.
    pub fn user(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::User(Box::new(err))
    }

    /// Wrap a plain message as a user failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::User(message.into().into())
    }

    /// Request an item-scoped halt.
    pub fn halt_item(reason: impl Into<String>) -> Self {
        Self::HaltItem(reason.into())
    }

    /// Request an engine-scoped halt.
    pub fn halt_engine(reason: impl Into<String>) -> Self {
        Self::HaltEngine(reason.into())
    }

    /// Whether this error is one of the typed halt signals.
    #[must_use]
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::HaltItem(_) | Self::HaltEngine(_))
    }
}

/// Construction-time errors for a ruleset.
///
/// These are contract violations and prevent engine construction; they are
/// never produced at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleSetError {
    /// Rule names must not be empty.
    #[error("rule name must not be empty")]
    EmptyRuleName,

    /// A rule depends on a name no rule in the set provides.
    #[error("rule {rule} depends on {dependency}, which no rule provides")]
    MissingProvider {
        /// The rule with the unsatisfiable dependency.
        rule: String,
        /// The dependency name with no provider.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle among rules: {}", unresolved.join(", "))]
    CycleDetected {
        /// Names of the rules that could not be scheduled.
        unresolved: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_item_display() {
        let err = RuleError::halt_item("bad record");
        assert_eq!(err.to_string(), "item halted: bad record");
        assert!(err.is_halt());
    }

    #[test]
    fn halt_engine_display() {
        let err = RuleError::halt_engine("fatal");
        assert_eq!(err.to_string(), "engine halted: fatal");
        assert!(err.is_halt());
    }

    #[test]
    fn user_error_keeps_source() {
        let io = std::io::Error::other("boom");
        let err = RuleError::user(io);
        assert!(!err.is_halt());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn missing_provider_display() {
        let err = RuleSetError::MissingProvider {
            rule: "b".into(),
            dependency: "a".into(),
        };
        assert_eq!(
            err.to_string(),
            "rule b depends on a, which no rule provides"
        );
    }

    #[test]
    fn cycle_display_lists_rules() {
        let err = RuleSetError::CycleDetected {
            unresolved: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle among rules: a, b");
    }
}
