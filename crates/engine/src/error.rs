//! Engine error types.

use ruleflow_rule::{RuleError, RuleSetError};
use thiserror::Error;

/// Errors a top-level apply call (or engine construction) can return.
///
/// Policy-sanctioned halts are NOT errors — they end the call normally and
/// are inspectable via the engine's last failure record. What does surface
/// here: construction-time contract violations, rule failures the policy
/// chose to escalate, and caller-initiated cancellation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The rule collection could not be resolved into stages.
    #[error("engine construction failed: {0}")]
    Construction(#[from] RuleSetError),

    /// A rule failure the failure policy escalated to the caller.
    #[error("rule {rule} failed")]
    Rule {
        /// Name of the failing rule.
        rule: String,
        /// The original rule error, unmodified.
        #[source]
        source: RuleError,
    },

    /// The caller's cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,
}
