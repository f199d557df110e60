//! Engines with pre/main/post phases over an input and an output object.
//!
//! Pre rules see the input alone, main rules see the input and output
//! jointly, post rules see the output alone. Pre and main run once per
//! input item; post runs once per call after every item, and is skipped
//! entirely when an engine halt ended the batch.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use ruleflow_rule::{
    AsyncJointRule, AsyncRule, EngineContext, EngineInfo, JointRule, Rule, RuleError,
    RuleMetadata, resolve_stages,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::exec::{
    EngineOptions, Flow, ItemEnd, note_halt, run_async_joint_stage, run_async_stage,
    run_sync_joint_stage, run_sync_stage,
};
use crate::record::{FailureRecord, Phase};

fn stages_of(metas: &[&RuleMetadata]) -> Result<Vec<Vec<usize>>, EngineError> {
    Ok(resolve_stages(metas)?)
}

/// A synchronous three-phase engine over inputs of type `I` producing into
/// an output of type `O`.
pub struct PipelineEngine<I, O> {
    pre: Vec<Arc<dyn Rule<I>>>,
    pre_stages: Vec<Vec<usize>>,
    main: Vec<Arc<dyn JointRule<I, O>>>,
    main_stages: Vec<Vec<usize>>,
    post: Vec<Arc<dyn Rule<O>>>,
    post_stages: Vec<Vec<usize>>,
    options: EngineOptions,
    last_failure: Mutex<Option<FailureRecord>>,
}

impl<I: Sync, O: Sync> PipelineEngine<I, O> {
    /// Build a pipeline engine, resolving each phase independently.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] when any phase's rule set has
    /// a missing provider or a dependency cycle.
    pub fn new(
        pre: Vec<Arc<dyn Rule<I>>>,
        main: Vec<Arc<dyn JointRule<I, O>>>,
        post: Vec<Arc<dyn Rule<O>>>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let pre_stages = stages_of(&pre.iter().map(|r| r.metadata()).collect::<Vec<_>>())?;
        let main_stages = stages_of(&main.iter().map(|r| r.metadata()).collect::<Vec<_>>())?;
        let post_stages = stages_of(&post.iter().map(|r| r.metadata()).collect::<Vec<_>>())?;
        Ok(Self {
            pre,
            pre_stages,
            main,
            main_stages,
            post,
            post_stages,
            options,
            last_failure: Mutex::new(None),
        })
    }

    /// Metadata of the pre-phase rules, in registration order.
    pub fn pre_rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.pre.iter().map(|r| r.metadata())
    }

    /// Metadata of the main-phase rules, in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.main.iter().map(|r| r.metadata())
    }

    /// Metadata of the post-phase rules, in registration order.
    pub fn post_rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.post.iter().map(|r| r.metadata())
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

    /// Type name of the input objects.
    #[must_use]
    pub fn input_type(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    /// Type name of the output object.
    #[must_use]
    pub fn output_type(&self) -> &'static str {
        std::any::type_name::<O>()
    }

    /// The failure that halted the most recent call, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<FailureRecord> {
        self.last_failure.lock().clone()
    }

    fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            rule_names: self.main.iter().map(|r| r.metadata().name.clone()).collect(),
            pre_rule_names: self.pre.iter().map(|r| r.metadata().name.clone()).collect(),
            post_rule_names: self.post.iter().map(|r| r.metadata().name.clone()).collect(),
            is_parallel: self.options.parallel,
            is_async: false,
            input_type: self.input_type(),
            output_type: Some(self.output_type()),
        }
    }

    fn begin_call(&self, ctx: &EngineContext) {
        *self.last_failure.lock() = None;
        ctx.begin_execution();
        ctx.attach_engine(self.engine_info());
    }

    /// Run the pipeline for a single input.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply(&self, input: &I, output: &O) -> Result<(), EngineError> {
        self.apply_many_with(&EngineContext::new(), std::slice::from_ref(input), output)
    }

    /// Like [`PipelineEngine::apply`] with a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_with(&self, ctx: &EngineContext, input: &I, output: &O) -> Result<(), EngineError> {
        self.apply_many_with(ctx, std::slice::from_ref(input), output)
    }

    /// Run the pipeline for each input in order, then the post phase once.
    ///
    /// An item halt skips to the next input; an engine halt abandons the
    /// remaining inputs and the post phase.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many(&self, inputs: &[I], output: &O) -> Result<(), EngineError> {
        self.apply_many_with(&EngineContext::new(), inputs, output)
    }

    /// Like [`PipelineEngine::apply_many`] with a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many_with(
        &self,
        ctx: &EngineContext,
        inputs: &[I],
        output: &O,
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        for (index, input) in inputs.iter().enumerate() {
            ctx.begin_item();
            match self.run_input(ctx, input, output, Some(index))? {
                ItemEnd::Completed | ItemEnd::HaltedItem => {}
                ItemEnd::HaltedEngine => return Ok(()),
            }
        }
        self.run_post(ctx, output)?;
        Ok(())
    }

    /// Run the pre and main phases for every input concurrently on scoped
    /// threads, then the post phase once.
    ///
    /// The input-scoped cache is reset once for the whole batch since the
    /// inputs share the context concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many_parallel(&self, inputs: &[I], output: &O) -> Result<(), EngineError> {
        self.apply_many_parallel_with(&EngineContext::new(), inputs, output)
    }

    /// Like [`PipelineEngine::apply_many_parallel`] with a caller-provided
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] when a failure escalates past the
    /// failure policy.
    pub fn apply_many_parallel_with(
        &self,
        ctx: &EngineContext,
        inputs: &[I],
        output: &O,
    ) -> Result<(), EngineError> {
        use std::sync::atomic::{AtomicBool, Ordering};

        self.begin_call(ctx);
        ctx.begin_item();
        let halted = AtomicBool::new(false);
        let mut results: Vec<Result<ItemEnd, EngineError>> = Vec::with_capacity(inputs.len());
        std::thread::scope(|scope| {
            let halted = &halted;
            let handles: Vec<_> = inputs
                .iter()
                .enumerate()
                .map(|(index, input)| {
                    scope.spawn(move || {
                        if halted.load(Ordering::SeqCst) {
                            return Ok(ItemEnd::HaltedEngine);
                        }
                        let end = self.run_input(ctx, input, output, Some(index))?;
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
                        tracing::error!("input thread panicked");
                        Err(EngineError::Rule {
                            rule: String::from("unknown"),
                            source: RuleError::msg("input thread panicked"),
                        })
                    }
                };
                results.push(result);
            }
        });
        let mut engine_halted = false;
        for result in results {
            if result? == ItemEnd::HaltedEngine {
                engine_halted = true;
            }
        }
        if engine_halted {
            return Ok(());
        }
        self.run_post(ctx, output)?;
        Ok(())
    }

    fn run_input(
        &self,
        ctx: &EngineContext,
        input: &I,
        output: &O,
        item_index: Option<usize>,
    ) -> Result<ItemEnd, EngineError> {
        for stage in &self.pre_stages {
            let flow = run_sync_stage(
                &self.pre,
                stage,
                ctx,
                input,
                Phase::Pre,
                item_index,
                self.options.policy.as_ref(),
                self.options.parallel,
            );
            if let Some(end) = self.settle(ctx, flow)? {
                return Ok(end);
            }
        }
        for stage in &self.main_stages {
            let flow = run_sync_joint_stage(
                &self.main,
                stage,
                ctx,
                input,
                output,
                item_index,
                self.options.policy.as_ref(),
                self.options.parallel,
            );
            if let Some(end) = self.settle(ctx, flow)? {
                return Ok(end);
            }
        }
        Ok(ItemEnd::Completed)
    }

    fn run_post(&self, ctx: &EngineContext, output: &O) -> Result<(), EngineError> {
        for stage in &self.post_stages {
            let flow = run_sync_stage(
                &self.post,
                stage,
                ctx,
                output,
                Phase::Post,
                None,
                self.options.policy.as_ref(),
                self.options.parallel,
            );
            // A halt of either kind ends the post phase; there are no
            // further items for the distinction to matter for.
            if self.settle(ctx, flow)?.is_some() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn settle(&self, ctx: &EngineContext, flow: Flow) -> Result<Option<ItemEnd>, EngineError> {
        match flow {
            Flow::Continue => Ok(None),
            Flow::HaltItem(record) => {
                note_halt(&self.last_failure, ctx, record);
                Ok(Some(ItemEnd::HaltedItem))
            }
            Flow::HaltEngine(record) => {
                note_halt(&self.last_failure, ctx, record);
                Ok(Some(ItemEnd::HaltedEngine))
            }
            Flow::Escalate { rule, source } => Err(EngineError::Rule { rule, source }),
            Flow::Cancelled => Err(EngineError::Cancelled),
        }
    }
}

/// An asynchronous three-phase engine over inputs of type `I` producing
/// into an output of type `O`.
pub struct AsyncPipelineEngine<I, O> {
    pre: Vec<Arc<dyn AsyncRule<I>>>,
    pre_stages: Vec<Vec<usize>>,
    main: Vec<Arc<dyn AsyncJointRule<I, O>>>,
    main_stages: Vec<Vec<usize>>,
    post: Vec<Arc<dyn AsyncRule<O>>>,
    post_stages: Vec<Vec<usize>>,
    options: EngineOptions,
    last_failure: Mutex<Option<FailureRecord>>,
}

impl<I, O> AsyncPipelineEngine<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Build a pipeline engine, resolving each phase independently.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] when any phase's rule set has
    /// a missing provider or a dependency cycle.
    pub fn new(
        pre: Vec<Arc<dyn AsyncRule<I>>>,
        main: Vec<Arc<dyn AsyncJointRule<I, O>>>,
        post: Vec<Arc<dyn AsyncRule<O>>>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let pre_stages = stages_of(&pre.iter().map(|r| r.metadata()).collect::<Vec<_>>())?;
        let main_stages = stages_of(&main.iter().map(|r| r.metadata()).collect::<Vec<_>>())?;
        let post_stages = stages_of(&post.iter().map(|r| r.metadata()).collect::<Vec<_>>())?;
        Ok(Self {
            pre,
            pre_stages,
            main,
            main_stages,
            post,
            post_stages,
            options,
            last_failure: Mutex::new(None),
        })
    }

    /// Metadata of the pre-phase rules, in registration order.
    pub fn pre_rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.pre.iter().map(|r| r.metadata())
    }

    /// Metadata of the main-phase rules, in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.main.iter().map(|r| r.metadata())
    }

    /// Metadata of the post-phase rules, in registration order.
    pub fn post_rules(&self) -> impl Iterator<Item = &RuleMetadata> {
        self.post.iter().map(|r| r.metadata())
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

    /// Type name of the input objects.
    #[must_use]
    pub fn input_type(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    /// Type name of the output object.
    #[must_use]
    pub fn output_type(&self) -> &'static str {
        std::any::type_name::<O>()
    }

    /// The failure that halted the most recent call, if any.
    #[must_use]
    pub fn last_failure(&self) -> Option<FailureRecord> {
        self.last_failure.lock().clone()
    }

    fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            rule_names: self.main.iter().map(|r| r.metadata().name.clone()).collect(),
            pre_rule_names: self.pre.iter().map(|r| r.metadata().name.clone()).collect(),
            post_rule_names: self.post.iter().map(|r| r.metadata().name.clone()).collect(),
            is_parallel: self.options.parallel,
            is_async: true,
            input_type: self.input_type(),
            output_type: Some(self.output_type()),
        }
    }

    fn begin_call(&self, ctx: &EngineContext) {
        *self.last_failure.lock() = None;
        ctx.begin_execution();
        ctx.attach_engine(self.engine_info());
    }

    /// Run the pipeline for a single input.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply(
        &self,
        input: &Arc<I>,
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_many_with(
            &Arc::new(EngineContext::new()),
            std::slice::from_ref(input),
            output,
            token,
        )
        .await
    }

    /// Like [`AsyncPipelineEngine::apply`] with a caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_with(
        &self,
        ctx: &Arc<EngineContext>,
        input: &Arc<I>,
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_many_with(ctx, std::slice::from_ref(input), output, token)
            .await
    }

    /// Run the pipeline for each input in order, then the post phase once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_many(
        &self,
        inputs: &[Arc<I>],
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_many_with(&Arc::new(EngineContext::new()), inputs, output, token)
            .await
    }

    /// Like [`AsyncPipelineEngine::apply_many`] with a caller-provided
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_many_with(
        &self,
        ctx: &Arc<EngineContext>,
        inputs: &[Arc<I>],
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        for (index, input) in inputs.iter().enumerate() {
            ctx.begin_item();
            match self.run_input(ctx, input, output, Some(index), token).await? {
                ItemEnd::Completed | ItemEnd::HaltedItem => {}
                ItemEnd::HaltedEngine => return Ok(()),
            }
        }
        self.run_post(ctx, output, token).await?;
        Ok(())
    }

    /// Run the pre and main phases for every input concurrently on spawned
    /// tasks, then the post phase once.
    ///
    /// Inputs run under a child token of `token`; an engine halt or an
    /// escalation cancels the remaining inputs and skips the post phase.
    /// The input-scoped cache is reset once for the whole batch since the
    /// inputs share the context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the caller's token fires.
    pub async fn apply_many_parallel(
        self: &Arc<Self>,
        inputs: &[Arc<I>],
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.apply_many_parallel_with(&Arc::new(EngineContext::new()), inputs, output, token)
            .await
    }

    /// Like [`AsyncPipelineEngine::apply_many_parallel`] with a
    /// caller-provided context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the caller's token fires.
    pub async fn apply_many_parallel_with(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        inputs: &[Arc<I>],
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.begin_call(ctx);
        ctx.begin_item();
        let batch_token = token.child_token();
        let mut join_set = JoinSet::new();
        for (index, input) in inputs.iter().enumerate() {
            let engine = Arc::clone(self);
            let ctx = Arc::clone(ctx);
            let input = Arc::clone(input);
            let output = Arc::clone(output);
            let item_token = batch_token.clone();
            join_set.spawn(async move {
                engine
                    .run_input(&ctx, &input, &output, Some(index), &item_token)
                    .await
            });
        }

        let mut first_err = None;
        let mut engine_halted = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(ItemEnd::HaltedEngine)) => {
                    engine_halted = true;
                    batch_token.cancel();
                }
                Ok(Ok(_)) => {}
                Ok(Err(EngineError::Cancelled)) => {}
                Ok(Err(err)) => {
                    batch_token.cancel();
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    tracing::error!(?join_err, "input task panicked");
                    batch_token.cancel();
                    if first_err.is_none() {
                        first_err = Some(EngineError::Rule {
                            rule: String::from("unknown"),
                            source: RuleError::msg("input task panicked"),
                        });
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        if engine_halted {
            return Ok(());
        }
        self.run_post(ctx, output, token).await?;
        Ok(())
    }

    /// Run the pipeline over a push-based input source, consuming one item
    /// at a time, then the post phase once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_stream<S>(
        &self,
        inputs: S,
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError>
    where
        S: futures::Stream<Item = Arc<I>> + Unpin,
    {
        self.apply_stream_with(&Arc::new(EngineContext::new()), inputs, output, token)
            .await
    }

    /// Like [`AsyncPipelineEngine::apply_stream`] with a caller-provided
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] on escalation and
    /// [`EngineError::Cancelled`] when the token fires.
    pub async fn apply_stream_with<S>(
        &self,
        ctx: &Arc<EngineContext>,
        mut inputs: S,
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError>
    where
        S: futures::Stream<Item = Arc<I>> + Unpin,
    {
        self.begin_call(ctx);
        let mut index = 0;
        loop {
            let next = tokio::select! {
                () = token.cancelled() => return Err(EngineError::Cancelled),
                next = inputs.next() => next,
            };
            let Some(input) = next else { break };
            ctx.begin_item();
            match self.run_input(ctx, &input, output, Some(index), token).await? {
                ItemEnd::Completed | ItemEnd::HaltedItem => {}
                ItemEnd::HaltedEngine => return Ok(()),
            }
            index += 1;
        }
        self.run_post(ctx, output, token).await?;
        Ok(())
    }

    async fn run_input(
        &self,
        ctx: &Arc<EngineContext>,
        input: &Arc<I>,
        output: &Arc<O>,
        item_index: Option<usize>,
        token: &CancellationToken,
    ) -> Result<ItemEnd, EngineError> {
        for stage in &self.pre_stages {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let flow = run_async_stage(
                &self.pre,
                stage,
                ctx,
                input,
                Phase::Pre,
                item_index,
                &self.options.policy,
                self.options.parallel,
                token,
            )
            .await;
            if let Some(end) = self.settle(ctx, flow)? {
                return Ok(end);
            }
        }
        for stage in &self.main_stages {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let flow = run_async_joint_stage(
                &self.main,
                stage,
                ctx,
                input,
                output,
                item_index,
                &self.options.policy,
                self.options.parallel,
                token,
            )
            .await;
            if let Some(end) = self.settle(ctx, flow)? {
                return Ok(end);
            }
        }
        Ok(ItemEnd::Completed)
    }

    async fn run_post(
        &self,
        ctx: &Arc<EngineContext>,
        output: &Arc<O>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        for stage in &self.post_stages {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let flow = run_async_stage(
                &self.post,
                stage,
                ctx,
                output,
                Phase::Post,
                None,
                &self.options.policy,
                self.options.parallel,
                token,
            )
            .await;
            if self.settle(ctx, flow)?.is_some() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn settle(&self, ctx: &EngineContext, flow: Flow) -> Result<Option<ItemEnd>, EngineError> {
        match flow {
            Flow::Continue => Ok(None),
            Flow::HaltItem(record) => {
                note_halt(&self.last_failure, ctx, record);
                Ok(Some(ItemEnd::HaltedItem))
            }
            Flow::HaltEngine(record) => {
                note_halt(&self.last_failure, ctx, record);
                Ok(Some(ItemEnd::HaltedEngine))
            }
            Flow::Escalate { rule, source } => Err(EngineError::Rule { rule, source }),
            Flow::Cancelled => Err(EngineError::Cancelled),
        }
    }
}
