//! Shared stage-walking machinery.
//!
//! Both engine families route every rule invocation through the same
//! protocol: consult the predicate cache when the rule declares one,
//! evaluate the predicate, conditionally run the action, and interpret any
//! failure as an explicit [`Flow`] tag rather than unwinding. The stage
//! loops in `single` and `pipeline` only ever look at the returned tag.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use ruleflow_rule::{
    Applicability, AsyncJointRule, AsyncRule, CacheScope, EngineContext, JointRule, Rule,
    RuleError, RuleMetadata,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::policy::{FailureDecision, FailurePolicy, Rethrow};
use crate::record::{FailureRecord, HaltKind, Phase};

/// Configuration shared by every engine variant.
pub struct EngineOptions {
    /// Run the rules within a stage concurrently.
    pub parallel: bool,
    /// Strategy for uncaught rule failures.
    pub policy: Arc<dyn FailurePolicy>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            policy: Arc::new(Rethrow),
        }
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl EngineOptions {
    /// Options with parallel stage execution enabled.
    #[must_use]
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }

    /// Replace the failure policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policy = policy;
        self
    }
}

/// Outcome of running one rule, interpreted explicitly by the stage loops.
#[derive(Debug)]
pub(crate) enum Flow {
    /// Proceed to the next rule.
    Continue,
    /// Abort the current item.
    HaltItem(FailureRecord),
    /// Abort the whole batch.
    HaltEngine(FailureRecord),
    /// Return the failure to the caller of apply.
    Escalate {
        rule: String,
        source: RuleError,
    },
    /// A cancellation token fired before or during the rule.
    Cancelled,
}

impl Flow {
    fn interrupts(&self) -> bool {
        !matches!(self, Self::Continue | Self::Cancelled)
    }
}

/// How processing of one item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemEnd {
    Completed,
    HaltedItem,
    HaltedEngine,
}

/// Record a halt on the engine and flush the execution-scoped cache.
pub(crate) fn note_halt(
    last_failure: &Mutex<Option<FailureRecord>>,
    ctx: &EngineContext,
    record: FailureRecord,
) {
    tracing::debug!(rule = %record.rule, kind = ?record.kind, "halt recorded");
    ctx.per_execution_cache().clear();
    *last_failure.lock() = Some(record);
}

fn halt_record(
    kind: HaltKind,
    meta: &RuleMetadata,
    ctx: &EngineContext,
    phase: Phase,
    item_index: Option<usize>,
    message: String,
) -> FailureRecord {
    FailureRecord {
        kind,
        rule: meta.name.clone(),
        phase,
        trace_id: ctx.trace_id(),
        item_index,
        message,
    }
}

/// Interpret a rule error: typed halt signals bypass the policy, arbitrary
/// failures go through it.
fn conclude(
    err: RuleError,
    meta: &RuleMetadata,
    ctx: &EngineContext,
    phase: Phase,
    item_index: Option<usize>,
    policy: &dyn FailurePolicy,
) -> Flow {
    let message = err.to_string();
    match err {
        RuleError::HaltItem(_) => Flow::HaltItem(halt_record(
            HaltKind::Item,
            meta,
            ctx,
            phase,
            item_index,
            message,
        )),
        RuleError::HaltEngine(_) => Flow::HaltEngine(halt_record(
            HaltKind::Engine,
            meta,
            ctx,
            phase,
            item_index,
            message,
        )),
        RuleError::User(_) => match policy.handle(&err, ctx, meta) {
            FailureDecision::Suppress => {
                tracing::debug!(rule = %meta.name, phase = %phase, error = %message, "failure suppressed");
                Flow::Continue
            }
            FailureDecision::Escalate => Flow::Escalate {
                rule: meta.name.clone(),
                source: err,
            },
            FailureDecision::HaltItem => Flow::HaltItem(halt_record(
                HaltKind::Item,
                meta,
                ctx,
                phase,
                item_index,
                message,
            )),
            FailureDecision::HaltEngine => Flow::HaltEngine(halt_record(
                HaltKind::Engine,
                meta,
                ctx,
                phase,
                item_index,
                message,
            )),
        },
    }
}

fn cached_verdict(meta: &RuleMetadata, ctx: &EngineContext) -> Option<Applicability> {
    let spec = meta.cache.as_ref()?;
    let cache = match spec.scope {
        CacheScope::PerInput => ctx.per_input_cache(),
        CacheScope::PerExecution => ctx.per_execution_cache(),
    };
    let hit = cache.get(&spec.key)?;
    tracing::trace!(rule = %meta.name, key = %spec.key, "predicate cache hit");
    Some(hit)
}

fn store_verdict(meta: &RuleMetadata, ctx: &EngineContext, verdict: Applicability) {
    if let Some(spec) = &meta.cache {
        let cache = match spec.scope {
            CacheScope::PerInput => ctx.per_input_cache(),
            CacheScope::PerExecution => ctx.per_execution_cache(),
        };
        cache.insert(spec.key.as_str(), verdict);
    }
}

/// Run one rule through the predicate/action protocol (sync).
pub(crate) fn run_rule_protocol(
    meta: &RuleMetadata,
    ctx: &EngineContext,
    phase: Phase,
    item_index: Option<usize>,
    policy: &dyn FailurePolicy,
    applies: impl FnOnce() -> Result<Applicability, RuleError>,
    apply: impl FnOnce() -> Result<(), RuleError>,
) -> Flow {
    let verdict = match cached_verdict(meta, ctx) {
        Some(hit) => hit,
        None => match applies() {
            Ok(verdict) => {
                store_verdict(meta, ctx, verdict);
                verdict
            }
            Err(err) => return conclude(err, meta, ctx, phase, item_index, policy),
        },
    };

    if !verdict.is_applicable() {
        tracing::debug!(rule = %meta.name, phase = %phase, "does not apply");
        return Flow::Continue;
    }
    tracing::debug!(rule = %meta.name, phase = %phase, "applies");

    tracing::debug!(rule = %meta.name, phase = %phase, "applying");
    match apply() {
        Ok(()) => {
            tracing::debug!(rule = %meta.name, phase = %phase, "finished");
            Flow::Continue
        }
        Err(err) => conclude(err, meta, ctx, phase, item_index, policy),
    }
}

/// Run one rule through the predicate/action protocol (async).
pub(crate) async fn run_rule_protocol_async(
    meta: &RuleMetadata,
    ctx: &EngineContext,
    phase: Phase,
    item_index: Option<usize>,
    policy: &dyn FailurePolicy,
    applies: impl Future<Output = Result<Applicability, RuleError>>,
    apply: impl Future<Output = Result<(), RuleError>>,
) -> Flow {
    let verdict = match cached_verdict(meta, ctx) {
        Some(hit) => hit,
        None => match applies.await {
            Ok(verdict) => {
                store_verdict(meta, ctx, verdict);
                verdict
            }
            Err(err) => return conclude(err, meta, ctx, phase, item_index, policy),
        },
    };

    if !verdict.is_applicable() {
        tracing::debug!(rule = %meta.name, phase = %phase, "does not apply");
        return Flow::Continue;
    }
    tracing::debug!(rule = %meta.name, phase = %phase, "applies");

    tracing::debug!(rule = %meta.name, phase = %phase, "applying");
    match apply.await {
        Ok(()) => {
            tracing::debug!(rule = %meta.name, phase = %phase, "finished");
            Flow::Continue
        }
        Err(err) => conclude(err, meta, ctx, phase, item_index, policy),
    }
}

/// Pick the stage outcome from per-rule flows, first interrupting flow in
/// stage order so serial and parallel execution halt deterministically on
/// the same rule when completion order does not matter.
fn first_interrupting(flows: Vec<Flow>) -> Flow {
    for flow in flows {
        if flow.interrupts() {
            return flow;
        }
    }
    Flow::Continue
}

/// Run a stage serially (sync).
fn run_stage_serial_sync(stage: &[usize], mut run: impl FnMut(usize) -> Flow) -> Flow {
    for &ri in stage {
        let flow = run(ri);
        if flow.interrupts() {
            return flow;
        }
    }
    Flow::Continue
}

/// Run a stage on scoped threads (sync parallel).
fn run_stage_parallel_sync(
    stage: &[usize],
    name_of: impl Fn(usize) -> String + Sync,
    run: impl Fn(usize) -> Flow + Sync,
) -> Flow {
    let mut flows = Vec::with_capacity(stage.len());
    std::thread::scope(|scope| {
        let run = &run;
        let handles: Vec<_> = stage
            .iter()
            .map(|&ri| (ri, scope.spawn(move || run(ri))))
            .collect();
        for (ri, handle) in handles {
            let flow = match handle.join() {
                Ok(flow) => flow,
                Err(_) => {
                    let rule = name_of(ri);
                    tracing::error!(rule = %rule, "rule thread panicked");
                    Flow::Escalate {
                        rule,
                        source: RuleError::msg("rule thread panicked"),
                    }
                }
            };
            flows.push(flow);
        }
    });
    first_interrupting(flows)
}

/// Fan a stage out on a `JoinSet` with a derived cancellation scope: the
/// first interrupting flow cancels the stage token so sibling rules stop
/// promptly, then the remaining tasks are drained before returning.
async fn run_stage_parallel_async<F, Fut>(
    stage: &[usize],
    caller_token: &CancellationToken,
    spawn_rule: F,
) -> Flow
where
    F: Fn(usize, CancellationToken) -> Fut,
    Fut: Future<Output = Flow> + Send + 'static,
{
    let stage_token = caller_token.child_token();
    let mut join_set = JoinSet::new();
    for &ri in stage {
        join_set.spawn(spawn_rule(ri, stage_token.clone()));
    }

    let mut outcome = Flow::Continue;
    while let Some(joined) = join_set.join_next().await {
        let flow = match joined {
            Ok(flow) => flow,
            Err(join_err) => {
                tracing::error!(?join_err, "rule task panicked");
                Flow::Escalate {
                    rule: String::from("unknown"),
                    source: RuleError::msg("rule task panicked"),
                }
            }
        };
        if flow.interrupts() && !outcome.interrupts() {
            stage_token.cancel();
            outcome = flow;
        }
    }

    // A caller-initiated cancellation always surfaces as a cancellation,
    // even when a rule also failed while the batch was being torn down.
    if caller_token.is_cancelled() {
        return Flow::Cancelled;
    }
    outcome
}

/// Run one stage of single-subject sync rules.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_sync_stage<S: Sync>(
    rules: &[Arc<dyn Rule<S>>],
    stage: &[usize],
    ctx: &EngineContext,
    item: &S,
    phase: Phase,
    item_index: Option<usize>,
    policy: &dyn FailurePolicy,
    parallel: bool,
) -> Flow {
    let run = |ri: usize| {
        let rule = &rules[ri];
        run_rule_protocol(
            rule.metadata(),
            ctx,
            phase,
            item_index,
            policy,
            || rule.applies(ctx, item),
            || rule.apply(ctx, item),
        )
    };
    if parallel && stage.len() > 1 {
        run_stage_parallel_sync(stage, |ri| rules[ri].metadata().name.clone(), run)
    } else {
        run_stage_serial_sync(stage, run)
    }
}

/// Run one stage of joint (input + output) sync rules.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_sync_joint_stage<I: Sync, O: Sync>(
    rules: &[Arc<dyn JointRule<I, O>>],
    stage: &[usize],
    ctx: &EngineContext,
    input: &I,
    output: &O,
    item_index: Option<usize>,
    policy: &dyn FailurePolicy,
    parallel: bool,
) -> Flow {
    let run = |ri: usize| {
        let rule = &rules[ri];
        run_rule_protocol(
            rule.metadata(),
            ctx,
            Phase::Main,
            item_index,
            policy,
            || rule.applies(ctx, input, output),
            || rule.apply(ctx, input, output),
        )
    };
    if parallel && stage.len() > 1 {
        run_stage_parallel_sync(stage, |ri| rules[ri].metadata().name.clone(), run)
    } else {
        run_stage_serial_sync(stage, run)
    }
}

/// Run one stage of single-subject async rules.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_async_stage<S: Send + Sync + 'static>(
    rules: &[Arc<dyn AsyncRule<S>>],
    stage: &[usize],
    ctx: &Arc<EngineContext>,
    item: &Arc<S>,
    phase: Phase,
    item_index: Option<usize>,
    policy: &Arc<dyn FailurePolicy>,
    parallel: bool,
    token: &CancellationToken,
) -> Flow {
    if parallel && stage.len() > 1 {
        run_stage_parallel_async(stage, token, |ri, stage_token| {
            let rule = Arc::clone(&rules[ri]);
            let ctx = Arc::clone(ctx);
            let item = Arc::clone(item);
            let policy = Arc::clone(policy);
            async move {
                tokio::select! {
                    () = stage_token.cancelled() => Flow::Cancelled,
                    flow = run_rule_protocol_async(
                        rule.metadata(),
                        &ctx,
                        phase,
                        item_index,
                        policy.as_ref(),
                        rule.applies(&ctx, &item),
                        rule.apply(&ctx, &item),
                    ) => flow,
                }
            }
        })
        .await
    } else {
        for &ri in stage {
            let rule = &rules[ri];
            let flow = tokio::select! {
                () = token.cancelled() => Flow::Cancelled,
                flow = run_rule_protocol_async(
                    rule.metadata(),
                    ctx,
                    phase,
                    item_index,
                    policy.as_ref(),
                    rule.applies(ctx, item),
                    rule.apply(ctx, item),
                ) => flow,
            };
            if !matches!(flow, Flow::Continue) {
                return flow;
            }
        }
        Flow::Continue
    }
}

/// Run one stage of joint (input + output) async rules.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_async_joint_stage<I, O>(
    rules: &[Arc<dyn AsyncJointRule<I, O>>],
    stage: &[usize],
    ctx: &Arc<EngineContext>,
    input: &Arc<I>,
    output: &Arc<O>,
    item_index: Option<usize>,
    policy: &Arc<dyn FailurePolicy>,
    parallel: bool,
    token: &CancellationToken,
) -> Flow
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    if parallel && stage.len() > 1 {
        run_stage_parallel_async(stage, token, |ri, stage_token| {
            let rule = Arc::clone(&rules[ri]);
            let ctx = Arc::clone(ctx);
            let input = Arc::clone(input);
            let output = Arc::clone(output);
            let policy = Arc::clone(policy);
            async move {
                tokio::select! {
                    () = stage_token.cancelled() => Flow::Cancelled,
                    flow = run_rule_protocol_async(
                        rule.metadata(),
                        &ctx,
                        Phase::Main,
                        item_index,
                        policy.as_ref(),
                        rule.applies(&ctx, &input, &output),
                        rule.apply(&ctx, &input, &output),
                    ) => flow,
                }
            }
        })
        .await
    } else {
        for &ri in stage {
            let rule = &rules[ri];
            let flow = tokio::select! {
                () = token.cancelled() => Flow::Cancelled,
                flow = run_rule_protocol_async(
                    rule.metadata(),
                    ctx,
                    Phase::Main,
                    item_index,
                    policy.as_ref(),
                    rule.applies(ctx, input, output),
                    rule.apply(ctx, input, output),
                ) => flow,
            };
            if !matches!(flow, Flow::Continue) {
                return flow;
            }
        }
        Flow::Continue
    }
}
