//! Engines that run a rule set against one subject type.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use ruleflow_rule::{
    AsyncRule, EngineContext, EngineInfo, Rule, RuleError, RuleMetadata, resolve_stages,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::exec::{
    EngineOptions, Flow, ItemEnd, note_halt, run_async_stage, run_sync_stage,
};
use crate::record::{FailureRecord, Phase};

/// A synchronous engine over rules acting on subjects of type `T`.
///
/// Stages come from dependency resolution at construction time; each call
/// to one of the `apply*` surfaces walks them in order. Halts end the call
/// early and are reported through [`Engine::last_failure`], not as errors.
pub struct Engine<T> {
    rules: Vec<Arc<dyn Rule<T>>>,
    stages: Vec<Vec<usize>>,
    options: EngineOptions,
    last_failure: Mutex<Option<FailureRecord>>,
}

impl<T: Sync> Engine<T> {
    /// Build an engine, resolving the rules into dependency stages.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] when the rule set has a missing
    /// provider or a dependency cycle.
    pub fn new(rules: Vec<Arc<dyn Rule<T>>>, options: EngineOptions) -> Result<Self, EngineError> {
        let metas: Vec<&RuleMetadata> = rules.iter().map(|r| r.metadata()).collect();
        let stages = resolve_stages(&metas)?;
        Ok(Self {
            rules,
            stages,
            options,
            last_failure: Mutex::new(None),
        })
    }

    /// Metadata of the rules in this engine, in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.rules.iter().map(|r| r.metadata())
    }

    /// Number of resolved stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Whether stages fan their rules out concurrently.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.options.parallel
    }

    /// Whether this is the asynchronous variant.
    #[must_use]
    pub fn is_async(&self) -> bool {
        false
    }

    /// Type name of the subject this engine operates on.
    #[must_use]
    pub fn input_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    /// The failure that halted the most recent call, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<FailureRecord> {
        self.last_failure.lock().clone()
    }

    fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            rule_names: self.rules.iter().map(|r| r.metadata().name.clone()).collect(),
            pre_rule_names: Vec::new(),
            post_rule_names: Vec::new(),
            is_parallel: self.options.parallel,
            is_async: false,
            input_type: self.input_type(),
            output_type: None,
        }
    }

    fn begin_call(&self, ctx: &EngineContext) {
        *self.last_failure.lock() = None;
        ctx.begin_execution();
        ctx.attach_engine(self.engine_info());
    }

    /// Apply all rules to one subject with a fresh context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply(&self, item: &T) -> Result<(), EngineError> {
        self.apply_with(&EngineContext::new(), item)
    }

    /// Apply all rules to one subject using a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_with(&self, ctx: &EngineContext, item: &T) -> Result<(), EngineError> {
        self.begin_call(ctx);
        ctx.begin_item();
        self.run_item(ctx, item, None)?;
        Ok(())
    }

    /// Apply all rules to each item in order.
    ///
    /// An item halt skips to the next item; an engine halt abandons the
    /// rest of the batch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many(&self, items: &[T]) -> Result<(), EngineError> {
        self.apply_many_with(&EngineContext::new(), items)
    }

    /// Like [`Engine::apply_many`] with a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many_with(&self, ctx: &EngineContext, items: &[T]) -> Result<(), EngineError> {
        self.begin_call(ctx);
        for (index, item) in items.iter().enumerate() {
            ctx.begin_item();
            match self.run_item(ctx, item, Some(index))? {
                ItemEnd::Completed | ItemEnd::HaltedItem => {}
                ItemEnd::HaltedEngine => break,
            }
        }
        Ok(())
    }

    /// Apply all rules to every item concurrently on scoped threads.
    ///
    /// An engine halt stops items that have not started; items already in
    /// flight run to their own end. The input-scoped cache is reset once
    /// for the whole batch since items share the context concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many_parallel(&self, items: &[T]) -> Result<(), EngineError> {
        self.apply_many_parallel_with(&EngineContext::new(), items)
    }

    /// Like [`Engine::apply_many_parallel`] with a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many_parallel_with(
        &self,
        ctx: &EngineContext,
        items: &[T],
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        ctx.begin_item();
        let halted = AtomicBool::new(false);
        let mut results: Vec<Result<ItemEnd, EngineError>> = Vec::with_capacity(items.len());
        std::thread::scope(|scope| {
            let halted = &halted;
            let handles: Vec<_> = items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    scope.spawn(move || {
                        if halted.load(Ordering::SeqCst) {
                            return Ok(ItemEnd::HaltedEngine);
                        }
                        let end = self.run_item(ctx, item, Some(index))?;
                        if end == ItemEnd::HaltedEngine {
                            halted.store(true, Ordering::SeqCst);
                        }
                        Ok(end)
                    })
                })
                .collect();
            for handle in handles {
                let result = match handle.join() {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!("item thread panicked");
                        Err(EngineError::Rule {
                            rule: String::from("unknown"),
                            source: RuleError::msg("item thread panicked"),
                        })
                    }
                };
                results.push(result);
            }
        });
        for result in results {
            result?;
        }
        Ok(())
    }

    fn run_item(
        &self,
        ctx: &EngineContext,
        item: &T,
        item_index: Option<usize>,
    ) -> Result<ItemEnd, EngineError> {
        for stage in &self.stages {
            let flow = run_sync_stage(
                &self.rules,
                stage,
                ctx,
                item,
                Phase::Single,
                item_index,
                self.options.policy.as_ref(),
                self.options.parallel,
            );
            match flow {
                Flow::Continue => {}
                Flow::HaltItem(record) => {
                    note_halt(&self.last_failure, ctx, record);
                    return Ok(ItemEnd::HaltedItem);
                }
                Flow::HaltEngine(record) => {
                    note_halt(&self.last_failure, ctx, record);
                    return Ok(ItemEnd::HaltedEngine);
                }
                Flow::Escalate { rule, source } => {
                    return Err(EngineError::Rule { rule, source });
                }
                Flow::Cancelled => return Err(EngineError::Cancelled),
            }
        }
        Ok(ItemEnd::Completed)
    }
}

/// An asynchronous engine over rules acting on subjects of type `T`.
///
/// Subjects and contexts travel as `Arc`s so parallel stages can fan out
/// on spawned tasks. Every surface takes a [`CancellationToken`]; a fired
/// token surfaces as [`EngineError::Cancelled`].
pub struct AsyncEngine<T> {
    rules: Vec<Arc<dyn AsyncRule<T>>>,
    stages: Vec<Vec<usize>>,
    options: EngineOptions,
    last_failure: Mutex<Option<FailureRecord>>,
}

impl<T: Send + Sync + 'static> AsyncEngine<T> {
    /// Build an engine, resolving the rules into dependency stages.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] when the rule set has a missing
    /// provider or a dependency cycle.
    pub fn new(
        rules: Vec<Arc<dyn AsyncRule<T>>>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let metas: Vec<&RuleMetadata> = rules.iter().map(|r| r.metadata()).collect();
        let stages = resolve_stages(&metas)?;
        Ok(Self {
            rules,
            stages,
            options,
            last_failure: Mutex::new(None),
        })
    }

    /// Metadata of the rules in this engine, in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.rules.iter().map(|r| r.metadata())
    }

    /// Number of resolved stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Whether stages fan their rules out concurrently.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.options.parallel
    }

    /// Whether this is the asynchronous variant.
    #[must_use]
    pub fn is_async(&self) -> bool {
        true
    }

    /// Type name of the subject this engine operates on.
    #[must_use]
    pub fn input_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    /// The failure that halted the most recent call, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<FailureRecord> {
        self.last_failure.lock().clone()
    }

    fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            rule_names: self.rules.iter().map(|r| r.metadata().name.clone()).collect(),
            pre_rule_names: Vec::new(),
            post_rule_names: Vec::new(),
            is_parallel: self.options.parallel,
            is_async: true,
            input_type: self.input_type(),
            output_type: None,
        }
    }

    fn begin_call(&self, ctx: &EngineContext) {
        *self.last_failure.lock() = None;
        ctx.begin_execution();
        ctx.attach_engine(self.engine_info());
    }

    /// Apply all rules to one subject with a fresh context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply(
        &self,
        item: &Arc<T>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_with(&Arc::new(EngineContext::new()), item, token)
            .await
    }

    /// Apply all rules to one subject using a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_with(
        &self,
        ctx: &Arc<EngineContext>,
        item: &Arc<T>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        ctx.begin_item();
        self.run_item(ctx, item, None, token).await?;
        Ok(())
    }

    /// Apply all rules to each item in order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_many(
        &self,
        items: &[Arc<T>],
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_many_with(&Arc::new(EngineContext::new()), items, token)
            .await
    }

    /// Like [`AsyncEngine::apply_many`] with a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_many_with(
        &self,
        ctx: &Arc<EngineContext>,
        items: &[Arc<T>],
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        for (index, item) in items.iter().enumerate() {
            ctx.begin_item();
            match self.run_item(ctx, item, Some(index), token).await? {
                ItemEnd::Completed | ItemEnd::HaltedItem => {}
                ItemEnd::HaltedEngine => break,
            }
        }
        Ok(())
    }

    /// Apply all rules to every item concurrently on spawned tasks.
    ///
    /// Items run under a child token of `token`; an engine halt or an
    /// escalation cancels the remaining items. The input-scoped cache is
    /// reset once for the whole batch since items share the context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the caller's token fires.
    pub async fn apply_many_parallel(
        self: &Arc<Self>,
        items: &[Arc<T>],
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_many_parallel_with(&Arc::new(EngineContext::new()), items, token)
            .await
    }

    /// Like [`AsyncEngine::apply_many_parallel`] with a caller-provided
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the caller's token fires.
    pub async fn apply_many_parallel_with(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        items: &[Arc<T>],
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        ctx.begin_item();
        let batch_token = token.child_token();
        let mut join_set = JoinSet::new();
        for (index, item) in items.iter().enumerate() {
            let engine = Arc::clone(self);
            let ctx = Arc::clone(ctx);
            let item = Arc::clone(item);
            let item_token = batch_token.clone();
            join_set.spawn(async move {
                engine.run_item(&ctx, &item, Some(index), &item_token).await
            });
        }

        let mut first_err = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(ItemEnd::HaltedEngine)) => batch_token.cancel(),
                Ok(Ok(_)) => {}
                // Items torn down by the batch token are not the root cause.
                Ok(Err(EngineError::Cancelled)) => {}
                Ok(Err(err)) => {
                    batch_token.cancel();
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    tracing::error!(?join_err, "item task panicked");
                    batch_token.cancel();
                    if first_err.is_none() {
                        first_err = Some(EngineError::Rule {
                            rule: String::from("unknown"),
                            source: RuleError::msg("item task panicked"),
                        });
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_item(
        &self,
        ctx: &Arc<EngineContext>,
        item: &Arc<T>,
        item_index: Option<usize>,
        token: &CancellationToken,
    ) -> Result<ItemEnd, EngineError> {
        for stage in &self.stages {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let flow = run_async_stage(
                &self.rules,
                stage,
                ctx,
                item,
                Phase::Single,
                item_index,
                &self.options.policy,
                self.options.parallel,
                token,
            )
            .await;
            match flow {
                Flow::Continue => {}
                Flow::HaltItem(record) => {
                    note_halt(&self.last_failure, ctx, record);
                    return Ok(ItemEnd::HaltedItem);
                }
                Flow::HaltEngine(record) => {
                    note_halt(&self.last_failure, ctx, record);
                    return Ok(ItemEnd::HaltedEngine);
                }
                Flow::Escalate { rule, source } => {
                    return Err(EngineError::Rule { rule, source });
                }
                Flow::Cancelled => return Err(EngineError::Cancelled),
            }
        }
        Ok(ItemEnd::Completed)
    }
}
