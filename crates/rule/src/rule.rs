//! Rule behavior traits, sync and async.
//!
//! A rule is an opaque behavioral unit: a predicate (`applies`) gating an
//! action (`apply`), plus declarative [`RuleMetadata`]. The engines store
//! rules as `Arc<dyn ...>` trait objects, so all traits are `Send + Sync`.
//!
//! Subjects are passed by shared reference; a rule that mutates its subject
//! does so through interior mutability the host chose for its own type,
//! which is what lets a parallel stage fan rules out safely.

use async_trait::async_trait;

use crate::applicability::Applicability;
use crate::context::EngineContext;
use crate::error::RuleError;
use crate::metadata::RuleMetadata;

/// A synchronous rule acting on one subject.
pub trait Rule<T>: Send + Sync {
    /// Declarative metadata for this rule.
    fn metadata(&self) -> &RuleMetadata;

    /// Whether the action should run for this subject.
    ///
    /// Defaults to always applicable.
    fn applies(&self, ctx: &EngineContext, item: &T) -> Result<Applicability, RuleError> {
        let _ = (ctx, item);
        Ok(Applicability::Applies)
    }

    /// Run the rule's action.
    fn apply(&self, ctx: &EngineContext, item: &T) -> Result<(), RuleError>;
}

/// A synchronous rule acting on an input and an output jointly
/// (the main phase of a dual-object pipeline).
pub trait JointRule<I, O>: Send + Sync {
    /// Declarative metadata for this rule.
    fn metadata(&self) -> &RuleMetadata;

    /// Whether the action should run for this input/output pair.
    fn applies(
        &self,
        ctx: &EngineContext,
        input: &I,
        output: &O,
    ) -> Result<Applicability, RuleError> {
        let _ = (ctx, input, output);
        Ok(Applicability::Applies)
    }

    /// Run the rule's action.
    fn apply(&self, ctx: &EngineContext, input: &I, output: &O) -> Result<(), RuleError>;
}

/// An asynchronous rule acting on one subject.
#[async_trait]
pub trait AsyncRule<T: Sync>: Send + Sync {
    /// Declarative metadata for this rule.
    fn metadata(&self) -> &RuleMetadata;

    /// Whether the action should run for this subject.
    async fn applies(&self, ctx: &EngineContext, item: &T) -> Result<Applicability, RuleError> {
        let _ = (ctx, item);
        Ok(Applicability::Applies)
    }

    /// Run the rule's action.
    async fn apply(&self, ctx: &EngineContext, item: &T) -> Result<(), RuleError>;
}

/// An asynchronous rule acting on an input and an output jointly.
#[async_trait]
pub trait AsyncJointRule<I: Sync, O: Sync>: Send + Sync {
    /// Declarative metadata for this rule.
    fn metadata(&self) -> &RuleMetadata;

    /// Whether the action should run for this input/output pair.
    async fn applies(
        &self,
        ctx: &EngineContext,
        input: &I,
        output: &O,
    ) -> Result<Applicability, RuleError> {
        let _ = (ctx, input, output);
        Ok(Applicability::Applies)
    }

    /// Run the rule's action.
    async fn apply(&self, ctx: &EngineContext, input: &I, output: &O) -> Result<(), RuleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag {
        meta: RuleMetadata,
    }

    impl Rule<Vec<parking_lot::Mutex<String>>> for Tag {
        fn metadata(&self) -> &RuleMetadata {
            &self.meta
        }

        fn apply(
            &self,
            _ctx: &EngineContext,
            item: &Vec<parking_lot::Mutex<String>>,
        ) -> Result<(), RuleError> {
            item[0].lock().push_str(&self.meta.name);
            Ok(())
        }
    }

    #[test]
    fn default_predicate_applies() {
        let rule = Tag {
            meta: RuleMetadata::new("tag").unwrap(),
        };
        let ctx = EngineContext::new();
        let item = vec![parking_lot::Mutex::new(String::new())];
        let verdict = rule.applies(&ctx, &item).unwrap();
        assert!(verdict.is_applicable());

        rule.apply(&ctx, &item).unwrap();
        assert_eq!(*item[0].lock(), "tag");
    }

    struct Sleepy {
        meta: RuleMetadata,
    }

    #[async_trait]
    impl AsyncRule<std::sync::atomic::AtomicUsize> for Sleepy {
        fn metadata(&self) -> &RuleMetadata {
            &self.meta
        }

        async fn apply(
            &self,
            _ctx: &EngineContext,
            item: &std::sync::atomic::AtomicUsize,
        ) -> Result<(), RuleError> {
            tokio::task::yield_now().await;
            item.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn async_rule_runs() {
        let rule = Sleepy {
            meta: RuleMetadata::new("sleepy").unwrap(),
        };
        let ctx = EngineContext::new();
        let counter = std::sync::atomic::AtomicUsize::new(0);
        rule.apply(&ctx, &counter).await.unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
