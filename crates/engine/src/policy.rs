//! Pluggable failure policies.
//!
//! When a rule's predicate or action returns an arbitrary
//! [`RuleError::User`] error, the engine offers it to the configured
//! policy, whose [`FailureDecision`] the stage loop interprets explicitly.
//! Typed halt signals ([`RuleError::HaltItem`] / [`RuleError::HaltEngine`])
//! raised by rule code bypass the policy entirely.

use ruleflow_rule::{EngineContext, RuleError, RuleMetadata};

/// What the engine should do with a rule failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Continue as if the rule had not applied.
    Suppress,
    /// Return the error to the caller of apply.
    Escalate,
    /// Abort the current item; the batch continues.
    HaltItem,
    /// Abort the whole batch.
    HaltEngine,
}

/// Strategy invoked on any uncaught error from a rule.
pub trait FailurePolicy: Send + Sync {
    /// Decide what to do with `error`, raised by `rule`.
    fn handle(
        &self,
        error: &RuleError,
        ctx: &EngineContext,
        rule: &RuleMetadata,
    ) -> FailureDecision;
}

/// Always escalate. The default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rethrow;

impl FailurePolicy for Rethrow {
    fn handle(&self, _: &RuleError, _: &EngineContext, _: &RuleMetadata) -> FailureDecision {
        FailureDecision::Escalate
    }
}

/// Always suppress; execution continues as if the rule had not applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignore;

impl FailurePolicy for Ignore {
    fn handle(&self, _: &RuleError, _: &EngineContext, _: &RuleMetadata) -> FailureDecision {
        FailureDecision::Suppress
    }
}

/// Convert any failure into an item-scoped halt.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaltItem;

impl FailurePolicy for HaltItem {
    fn handle(&self, _: &RuleError, _: &EngineContext, _: &RuleMetadata) -> FailureDecision {
        FailureDecision::HaltItem
    }
}

/// Convert any failure into an engine-scoped halt.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaltEngine;

impl FailurePolicy for HaltEngine {
    fn handle(&self, _: &RuleError, _: &EngineContext, _: &RuleMetadata) -> FailureDecision {
        FailureDecision::HaltEngine
    }
}
