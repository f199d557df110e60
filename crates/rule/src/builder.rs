//! Fluent builder for closure-backed rules.
//!
//! Hosts with nontrivial rules implement [`Rule`]/[`JointRule`] (or the
//! async traits) directly; for the common case of a predicate and an
//! action expressed as closures, the builder assembles the metadata and
//! wraps the closures into a ready-to-register trait object.

use std::sync::Arc;

use crate::applicability::Applicability;
use crate::context::EngineContext;
use crate::error::{RuleError, RuleSetError};
use crate::metadata::{CacheScope, CacheSpec, RuleMetadata};
use crate::rule::{JointRule, Rule};

type Predicate<T> =
    Box<dyn Fn(&EngineContext, &T) -> Result<Applicability, RuleError> + Send + Sync>;
type Action<T> = Box<dyn Fn(&EngineContext, &T) -> Result<(), RuleError> + Send + Sync>;
type JointPredicate<I, O> =
    Box<dyn Fn(&EngineContext, &I, &O) -> Result<Applicability, RuleError> + Send + Sync>;
type JointAction<I, O> =
    Box<dyn Fn(&EngineContext, &I, &O) -> Result<(), RuleError> + Send + Sync>;

/// A builder that accumulates a rule's declarations, then pairs them with
/// predicate/action closures to produce a rule trait object.
#[derive(Debug)]
pub struct RuleBuilder {
    name: String,
    dependencies: Vec<String>,
    provides: Vec<String>,
    cache: Option<CacheSpec>,
    description: Option<String>,
}

impl RuleBuilder {
    /// Start building a rule with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            provides: Vec::new(),
            cache: None,
            description: None,
        }
    }

    /// Declare a name this rule must run after.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Declare a name this rule satisfies, in addition to its own name.
    #[must_use]
    pub fn provides(mut self, name: impl Into<String>) -> Self {
        self.provides.push(name.into());
        self
    }

    /// Declare a predicate-cache slot.
    #[must_use]
    pub fn cache(mut self, key: impl Into<String>, scope: CacheScope) -> Self {
        self.cache = Some(CacheSpec {
            key: key.into(),
            scope,
        });
        self
    }

    /// Set a description.
    #[must_use]
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    fn metadata(self) -> Result<RuleMetadata, RuleSetError> {
        let mut meta = RuleMetadata::new(self.name)?;
        for dep in self.dependencies {
            meta = meta.with_dependency(dep);
        }
        for name in self.provides {
            meta = meta.with_provides(name);
        }
        meta.cache = self.cache;
        meta.description = self.description;
        Ok(meta)
    }

    /// Produce a single-object rule from a predicate and an action.
    pub fn build<T: 'static, P, A>(
        self,
        predicate: P,
        action: A,
    ) -> Result<Arc<dyn Rule<T>>, RuleSetError>
    where
        P: Fn(&EngineContext, &T) -> Result<Applicability, RuleError> + Send + Sync + 'static,
        A: Fn(&EngineContext, &T) -> Result<(), RuleError> + Send + Sync + 'static,
    {
        Ok(Arc::new(FnRule {
            meta: self.metadata()?,
            predicate: Box::new(predicate),
            action: Box::new(action),
        }))
    }

    /// Produce a single-object rule that always applies.
    pub fn build_action<T: 'static, A>(
        self,
        action: A,
    ) -> Result<Arc<dyn Rule<T>>, RuleSetError>
    where
        A: Fn(&EngineContext, &T) -> Result<(), RuleError> + Send + Sync + 'static,
    {
        self.build(|_, _| Ok(Applicability::Applies), action)
    }

    /// Produce a dual-object (input + output) rule from a predicate and an
    /// action.
    pub fn build_joint<I: 'static, O: 'static, P, A>(
        self,
        predicate: P,
        action: A,
    ) -> Result<Arc<dyn JointRule<I, O>>, RuleSetError>
    where
        P: Fn(&EngineContext, &I, &O) -> Result<Applicability, RuleError> + Send + Sync + 'static,
        A: Fn(&EngineContext, &I, &O) -> Result<(), RuleError> + Send + Sync + 'static,
    {
        Ok(Arc::new(FnJointRule {
            meta: self.metadata()?,
            predicate: Box::new(predicate),
            action: Box::new(action),
        }))
    }

    /// Produce a dual-object rule that always applies.
    pub fn build_joint_action<I: 'static, O: 'static, A>(
        self,
        action: A,
    ) -> Result<Arc<dyn JointRule<I, O>>, RuleSetError>
    where
        A: Fn(&EngineContext, &I, &O) -> Result<(), RuleError> + Send + Sync + 'static,
    {
        self.build_joint(|_, _, _| Ok(Applicability::Applies), action)
    }
}

struct FnRule<T> {
    meta: RuleMetadata,
    predicate: Predicate<T>,
    action: Action<T>,
}

impl<T> Rule<T> for FnRule<T> {
    fn metadata(&self) -> &RuleMetadata {
        &self.meta
    }

    fn applies(&self, ctx: &EngineContext, item: &T) -> Result<Applicability, RuleError> {
        (self.predicate)(ctx, item)
    }

    fn apply(&self, ctx: &EngineContext, item: &T) -> Result<(), RuleError> {
        (self.action)(ctx, item)
    }
}

struct FnJointRule<I, O> {
    meta: RuleMetadata,
    predicate: JointPredicate<I, O>,
    action: JointAction<I, O>,
}

impl<I, O> JointRule<I, O> for FnJointRule<I, O> {
    fn metadata(&self) -> &RuleMetadata {
        &self.meta
    }

    fn applies(
        &self,
        ctx: &EngineContext,
        input: &I,
        output: &O,
    ) -> Result<Applicability, RuleError> {
        (self.predicate)(ctx, input, output)
    }

    fn apply(&self, ctx: &EngineContext, input: &I, output: &O) -> Result<(), RuleError> {
        (self.action)(ctx, input, output)
    }
}
