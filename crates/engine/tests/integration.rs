//! End-to-end engine behavior across dependency resolution, phases,
//! halting, caching, and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use ruleflow_engine::{
    AsyncEngine, AsyncPipelineEngine, Engine, EngineError, EngineOptions, HaltKind, Phase,
    PipelineEngine, policy,
};
use ruleflow_rule::{
    Applicability, AsyncJointRule, AsyncRule, CacheScope, EngineContext, JointRule, Rule,
    RuleBuilder, RuleError, RuleMetadata, RuleSetError,
};
use tokio_util::sync::CancellationToken;

type Journal = Mutex<Vec<String>>;

fn tag_rule(name: &str, deps: &[&str]) -> Arc<dyn Rule<Journal>> {
    let mut builder = RuleBuilder::new(name);
    for dep in deps {
        builder = builder.depends_on(*dep);
    }
    let tag = name.to_owned();
    builder
        .build_action(move |_ctx, journal: &Journal| {
            journal.lock().push(tag.clone());
            Ok(())
        })
        .unwrap()
}

#[test]
fn registration_order_does_not_affect_execution_order() {
    let build = |names: [&str; 3]| {
        let rules = names
            .iter()
            .map(|name| match *name {
                "load" => tag_rule("load", &[]),
                "check" => tag_rule("check", &["load"]),
                _ => tag_rule("store", &["check"]),
            })
            .collect();
        Engine::new(rules, EngineOptions::default()).unwrap()
    };

    for permutation in [
        ["load", "check", "store"],
        ["store", "load", "check"],
        ["check", "store", "load"],
    ] {
        let engine = build(permutation);
        let journal = Journal::default();
        engine.apply(&journal).unwrap();
        assert_eq!(*journal.lock(), vec!["load", "check", "store"]);
    }
}

#[test]
fn missing_provider_fails_construction() {
    let result = Engine::new(
        vec![tag_rule("check", &["load"])],
        EngineOptions::default(),
    );
    match result {
        Err(EngineError::Construction(RuleSetError::MissingProvider { rule, dependency })) => {
            assert_eq!(rule, "check");
            assert_eq!(dependency, "load");
        }
        other => panic!("expected missing provider, got {:?}", other.err()),
    }
}

#[test]
fn dependency_cycle_fails_construction() {
    let result = Engine::new(
        vec![tag_rule("a", &["b"]), tag_rule("b", &["a"])],
        EngineOptions::default(),
    );
    assert!(matches!(
        result,
        Err(EngineError::Construction(RuleSetError::CycleDetected { .. }))
    ));
}

#[test]
fn pipeline_phase_ordering_single_input() {
    // One input: pre runs, then main, then post.
    let pre: Arc<dyn Rule<Journal>> = RuleBuilder::new("pre")
        .build_action(|_ctx, input: &Journal| {
            input.lock().push("pre".into());
            Ok(())
        })
        .unwrap();
    let main: Arc<dyn JointRule<Journal, Journal>> = RuleBuilder::new("rule")
        .build_joint_action(|_ctx, input: &Journal, output: &Journal| {
            assert_eq!(*input.lock(), vec!["pre"]);
            input.lock().push("rule".into());
            output.lock().push("rule".into());
            Ok(())
        })
        .unwrap();
    let post: Arc<dyn Rule<Journal>> = RuleBuilder::new("post")
        .build_action(|_ctx, output: &Journal| {
            output.lock().push("post".into());
            Ok(())
        })
        .unwrap();

    let engine =
        PipelineEngine::new(vec![pre], vec![main], vec![post], EngineOptions::default()).unwrap();
    let input = Journal::default();
    let output = Journal::default();
    engine.apply(&input, &output).unwrap();

    assert_eq!(*input.lock(), vec!["pre", "rule"]);
    assert_eq!(*output.lock(), vec!["rule", "post"]);
}

#[test]
fn pipeline_post_runs_once_for_a_batch() {
    let main: Arc<dyn JointRule<Journal, Journal>> = RuleBuilder::new("rule")
        .build_joint_action(|_ctx, _input: &Journal, output: &Journal| {
            output.lock().push("rule".into());
            Ok(())
        })
        .unwrap();
    let post: Arc<dyn Rule<Journal>> = RuleBuilder::new("post")
        .build_action(|_ctx, output: &Journal| {
            output.lock().push("post".into());
            Ok(())
        })
        .unwrap();

    let engine =
        PipelineEngine::new(vec![], vec![main], vec![post], EngineOptions::default()).unwrap();
    let inputs = vec![Journal::default(), Journal::default()];
    let output = Journal::default();
    engine.apply_many(&inputs, &output).unwrap();

    assert_eq!(*output.lock(), vec!["rule", "rule", "post"]);
}

#[test]
fn item_halt_leaves_other_items_untouched() {
    let reject = RuleBuilder::new("reject")
        .build_action(|_ctx, journal: &Journal| {
            if journal.lock().iter().any(|entry| entry == "bad") {
                return Err(RuleError::halt_item("flagged item"));
            }
            Ok(())
        })
        .unwrap();
    let engine = Engine::new(
        vec![reject, tag_rule("mark", &["reject"])],
        EngineOptions::default(),
    )
    .unwrap();

    let items = vec![
        Journal::default(),
        Mutex::new(vec!["bad".to_owned()]),
        Journal::default(),
    ];
    engine.apply_many(&items).unwrap();

    assert_eq!(*items[0].lock(), vec!["mark"]);
    assert_eq!(*items[1].lock(), vec!["bad"]);
    assert_eq!(*items[2].lock(), vec!["mark"]);

    let record = engine.last_failure().unwrap();
    assert_eq!(record.kind, HaltKind::Item);
    assert_eq!(record.rule, "reject");
    assert_eq!(record.phase, Phase::Single);
    assert_eq!(record.item_index, Some(1));
    assert_eq!(record.message, "item halted: flagged item");
}

#[test]
fn engine_halt_is_total_for_the_batch() {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    let stop_on_second = RuleBuilder::new("stop")
        .build_action(move |_ctx, _journal: &Journal| {
            if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(RuleError::halt_engine("fatal"));
            }
            Ok(())
        })
        .unwrap();
    let engine = Engine::new(
        vec![stop_on_second, tag_rule("mark", &["stop"])],
        EngineOptions::default(),
    )
    .unwrap();

    let items = vec![Journal::default(), Journal::default(), Journal::default()];
    engine.apply_many(&items).unwrap();

    assert_eq!(*items[0].lock(), vec!["mark"]);
    assert!(items[1].lock().is_empty());
    assert!(items[2].lock().is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(engine.last_failure().unwrap().kind, HaltKind::Engine);
}

#[test]
fn halt_policy_downgrades_user_failures() {
    let flaky = RuleBuilder::new("flaky")
        .build_action(|_ctx, journal: &Journal| {
            if journal.lock().iter().any(|entry| entry == "bad") {
                return Err(RuleError::msg("io failure"));
            }
            Ok(())
        })
        .unwrap();
    let engine = Engine::new(
        vec![flaky, tag_rule("mark", &["flaky"])],
        EngineOptions::default().with_policy(Arc::new(policy::HaltItem)),
    )
    .unwrap();

    let items = vec![Mutex::new(vec!["bad".to_owned()]), Journal::default()];
    engine.apply_many(&items).unwrap();

    assert_eq!(*items[0].lock(), vec!["bad"]);
    assert_eq!(*items[1].lock(), vec!["mark"]);
    assert_eq!(engine.last_failure().unwrap().kind, HaltKind::Item);
}

#[test]
fn ignore_policy_suppresses_failures_entirely() {
    let flaky = RuleBuilder::new("flaky")
        .build_action(|_ctx, _journal: &Journal| Err(RuleError::msg("io failure")))
        .unwrap();
    let engine = Engine::new(
        vec![flaky, tag_rule("mark", &["flaky"])],
        EngineOptions::default().with_policy(Arc::new(policy::Ignore)),
    )
    .unwrap();

    let journal = Journal::default();
    engine.apply(&journal).unwrap();
    assert_eq!(*journal.lock(), vec!["mark"]);
    assert!(engine.last_failure().is_none());
}

struct CountedPredicate {
    meta: RuleMetadata,
    evaluations: AtomicUsize,
}

impl CountedPredicate {
    fn new(name: &str, scope: CacheScope) -> Self {
        Self {
            meta: RuleMetadata::new(name)
                .unwrap()
                .with_cache("shared-check", scope),
            evaluations: AtomicUsize::new(0),
        }
    }
}

impl Rule<Journal> for CountedPredicate {
    fn metadata(&self) -> &RuleMetadata {
        &self.meta
    }

    fn applies(&self, _ctx: &EngineContext, _item: &Journal) -> Result<Applicability, RuleError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Ok(Applicability::Applies)
    }

    fn apply(&self, _ctx: &EngineContext, item: &Journal) -> Result<(), RuleError> {
        item.lock().push(self.meta.name.clone());
        Ok(())
    }
}

#[test]
fn execution_scoped_cache_spans_items() {
    let rule = Arc::new(CountedPredicate::new("gate", CacheScope::PerExecution));
    let handle = Arc::clone(&rule);
    let engine = Engine::new(vec![rule], EngineOptions::default()).unwrap();

    let items = vec![Journal::default(), Journal::default(), Journal::default()];
    engine.apply_many(&items).unwrap();

    // One predicate evaluation serves the whole batch; the action still
    // ran for every item.
    assert_eq!(handle.evaluations.load(Ordering::SeqCst), 1);
    for item in &items {
        assert_eq!(*item.lock(), vec!["gate"]);
    }
}

#[test]
fn input_scoped_cache_resets_per_item() {
    let rule = Arc::new(CountedPredicate::new("gate", CacheScope::PerInput));
    let handle = Arc::clone(&rule);
    let engine = Engine::new(vec![rule], EngineOptions::default()).unwrap();

    let items = vec![Journal::default(), Journal::default(), Journal::default()];
    engine.apply_many(&items).unwrap();

    assert_eq!(handle.evaluations.load(Ordering::SeqCst), 3);
}

#[test]
fn shared_cache_key_short_circuits_sibling_rules() {
    // Two rules share one execution-scoped slot: whichever runs first
    // stores the verdict, the other reuses it.
    let first = Arc::new(CountedPredicate::new("first", CacheScope::PerExecution));
    let second = Arc::new(CountedPredicate::new("second", CacheScope::PerExecution));
    let first_handle = Arc::clone(&first);
    let second_handle = Arc::clone(&second);
    let engine = Engine::new(vec![first, second], EngineOptions::default()).unwrap();

    let journal = Journal::default();
    engine.apply(&journal).unwrap();

    let total = first_handle.evaluations.load(Ordering::SeqCst)
        + second_handle.evaluations.load(Ordering::SeqCst);
    assert_eq!(total, 1);
    assert_eq!(*journal.lock(), vec!["first", "second"]);
}

#[test]
fn halt_flushes_the_execution_scoped_cache() {
    let gate = Arc::new(CountedPredicate::new("gate", CacheScope::PerExecution));
    let handle = Arc::clone(&gate);
    let halt = RuleBuilder::new("halt")
        .depends_on("gate")
        .build_action(|_ctx, journal: &Journal| {
            if journal.lock().iter().any(|entry| entry == "bad") {
                return Err(RuleError::halt_item("flagged item"));
            }
            Ok(())
        })
        .unwrap();
    let engine = Engine::new(vec![gate, halt], EngineOptions::default()).unwrap();

    let items = vec![Mutex::new(vec!["bad".to_owned()]), Journal::default()];
    engine.apply_many(&items).unwrap();

    // The halt on the first item invalidated the stored verdict, so the
    // second item re-evaluates.
    assert_eq!(handle.evaluations.load(Ordering::SeqCst), 2);
}

#[test]
fn engine_state_resets_between_calls() {
    let reject = RuleBuilder::new("reject")
        .build_action(|_ctx, journal: &Journal| {
            if journal.lock().iter().any(|entry| entry == "bad") {
                return Err(RuleError::halt_item("flagged item"));
            }
            Ok(())
        })
        .unwrap();
    let engine = Engine::new(vec![reject], EngineOptions::default()).unwrap();

    engine.apply(&Mutex::new(vec!["bad".to_owned()])).unwrap();
    assert!(engine.last_failure().is_some());

    // A clean second call wipes the previous record.
    engine.apply(&Journal::default()).unwrap();
    assert!(engine.last_failure().is_none());
}

#[test]
fn context_values_survive_across_calls() {
    let remember = RuleBuilder::new("remember")
        .build_action(|ctx: &EngineContext, _journal: &Journal| {
            let runs = ctx
                .get_value("runs")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            ctx.set_value("runs", serde_json::json!(runs + 1));
            Ok(())
        })
        .unwrap();
    let engine = Engine::new(vec![remember], EngineOptions::default()).unwrap();

    let ctx = EngineContext::new();
    engine.apply_with(&ctx, &Journal::default()).unwrap();
    engine.apply_with(&ctx, &Journal::default()).unwrap();
    assert_eq!(ctx.get_value("runs"), Some(serde_json::json!(2)));
}

struct SlowRule {
    meta: RuleMetadata,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl AsyncRule<()> for SlowRule {
    fn metadata(&self) -> &RuleMetadata {
        &self.meta
    }

    async fn apply(&self, _ctx: &EngineContext, _item: &()) -> Result<(), RuleError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_in_flight_work() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let rules: Vec<Arc<dyn AsyncRule<()>>> = vec![Arc::new(SlowRule {
        meta: RuleMetadata::new("slow").unwrap(),
        started: Arc::clone(&started),
        finished: Arc::clone(&finished),
    })];
    let engine = Arc::new(AsyncEngine::new(rules, EngineOptions::default()).unwrap());

    let token = CancellationToken::new();
    let item = Arc::new(());
    let call = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        tokio::spawn(async move { engine.apply(&item, &token).await })
    };

    tokio::task::yield_now().await;
    token.cancel();
    let result = call.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

struct FailFast {
    meta: RuleMetadata,
}

#[async_trait::async_trait]
impl AsyncRule<()> for FailFast {
    fn metadata(&self) -> &RuleMetadata {
        &self.meta
    }

    async fn apply(&self, _ctx: &EngineContext, _item: &()) -> Result<(), RuleError> {
        Err(RuleError::msg("immediate failure"))
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_stage_failure_cancels_siblings() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let rules: Vec<Arc<dyn AsyncRule<()>>> = vec![
        Arc::new(SlowRule {
            meta: RuleMetadata::new("slow").unwrap(),
            started: Arc::clone(&started),
            finished: Arc::clone(&finished),
        }),
        Arc::new(FailFast {
            meta: RuleMetadata::new("fail-fast").unwrap(),
        }),
    ];
    let engine = AsyncEngine::new(rules, EngineOptions::parallel()).unwrap();

    let err = engine
        .apply(&Arc::new(()), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        EngineError::Rule { rule, .. } => assert_eq!(rule, "fail-fast"),
        other => panic!("expected rule error, got {other}"),
    }
    // The slow sibling was torn down by the stage token instead of
    // sleeping out its minute.
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn async_parallel_items_all_complete() {
    struct Bump {
        meta: RuleMetadata,
    }

    #[async_trait::async_trait]
    impl AsyncRule<AtomicUsize> for Bump {
        fn metadata(&self) -> &RuleMetadata {
            &self.meta
        }

        async fn apply(&self, _ctx: &EngineContext, item: &AtomicUsize) -> Result<(), RuleError> {
            tokio::task::yield_now().await;
            item.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let rules: Vec<Arc<dyn AsyncRule<AtomicUsize>>> = vec![Arc::new(Bump {
        meta: RuleMetadata::new("bump").unwrap(),
    })];
    let engine = Arc::new(AsyncEngine::new(rules, EngineOptions::default()).unwrap());

    let items: Vec<Arc<AtomicUsize>> = (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    engine
        .apply_many_parallel(&items, &CancellationToken::new())
        .await
        .unwrap();
    for item in &items {
        assert_eq!(item.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn async_pipeline_stream_halts_engine_mid_stream() {
    struct RejectMarked {
        meta: RuleMetadata,
    }

    #[async_trait::async_trait]
    impl AsyncJointRule<Journal, Journal> for RejectMarked {
        fn metadata(&self) -> &RuleMetadata {
            &self.meta
        }

        async fn apply(
            &self,
            _ctx: &EngineContext,
            input: &Journal,
            output: &Journal,
        ) -> Result<(), RuleError> {
            if input.lock().iter().any(|entry| entry == "stop") {
                return Err(RuleError::halt_engine("poisoned stream"));
            }
            output.lock().push(input.lock().join("+"));
            Ok(())
        }
    }

    struct Seal {
        meta: RuleMetadata,
    }

    #[async_trait::async_trait]
    impl AsyncRule<Journal> for Seal {
        fn metadata(&self) -> &RuleMetadata {
            &self.meta
        }

        async fn apply(&self, _ctx: &EngineContext, output: &Journal) -> Result<(), RuleError> {
            output.lock().push("sealed".into());
            Ok(())
        }
    }

    let engine = AsyncPipelineEngine::new(
        vec![],
        vec![Arc::new(RejectMarked {
            meta: RuleMetadata::new("reject-marked").unwrap(),
        }) as Arc<dyn AsyncJointRule<Journal, Journal>>],
        vec![Arc::new(Seal {
            meta: RuleMetadata::new("seal").unwrap(),
        }) as Arc<dyn AsyncRule<Journal>>],
        EngineOptions::default(),
    )
    .unwrap();

    let inputs = vec![
        Arc::new(Mutex::new(vec!["a".to_owned()])),
        Arc::new(Mutex::new(vec!["stop".to_owned()])),
        Arc::new(Mutex::new(vec!["c".to_owned()])),
    ];
    let output = Arc::new(Journal::default());
    engine
        .apply_stream(
            futures::stream::iter(inputs),
            &output,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // The halt ends consumption before "c" and skips the post phase.
    assert_eq!(*output.lock(), vec!["a"]);
    let record = engine.last_failure().unwrap();
    assert_eq!(record.kind, HaltKind::Engine);
    assert_eq!(record.item_index, Some(1));
}

#[tokio::test]
async fn channel_fed_stream_processes_items_as_they_arrive() {
    struct Copy {
        meta: RuleMetadata,
    }

    #[async_trait::async_trait]
    impl AsyncJointRule<String, Journal> for Copy {
        fn metadata(&self) -> &RuleMetadata {
            &self.meta
        }

        async fn apply(
            &self,
            _ctx: &EngineContext,
            input: &String,
            output: &Journal,
        ) -> Result<(), RuleError> {
            output.lock().push(input.clone());
            Ok(())
        }
    }

    let engine = AsyncPipelineEngine::<String, Journal>::new(
        vec![],
        vec![Arc::new(Copy {
            meta: RuleMetadata::new("copy").unwrap(),
        })],
        vec![],
        EngineOptions::default(),
    )
    .unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(2);
    let producer = tokio::spawn(async move {
        for word in ["one", "two", "three"] {
            tx.send(Arc::new(word.to_owned())).await.unwrap();
        }
    });

    let output = Arc::new(Journal::default());
    engine
        .apply_stream(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            &output,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    producer.await.unwrap();

    assert_eq!(*output.lock(), vec!["one", "two", "three"]);
}

#[test]
fn sync_parallel_items_match_serial_results() {
    let engine = Engine::new(
        vec![tag_rule("load", &[]), tag_rule("check", &["load"])],
        EngineOptions::default(),
    )
    .unwrap();

    let serial: Vec<Journal> = (0..4).map(|_| Journal::default()).collect();
    engine.apply_many(&serial).unwrap();
    let parallel: Vec<Journal> = (0..4).map(|_| Journal::default()).collect();
    engine.apply_many_parallel(&parallel).unwrap();

    for (a, b) in serial.iter().zip(&parallel) {
        assert_eq!(*a.lock(), *b.lock());
    }
}

#[test]
fn engine_info_snapshot_matches_configuration() {
    let engine = Engine::new(
        vec![tag_rule("load", &[]), tag_rule("check", &["load"])],
        EngineOptions::parallel(),
    )
    .unwrap();
    let ctx = EngineContext::new();
    engine.apply_with(&ctx, &Journal::default()).unwrap();

    let info = ctx.engine().unwrap();
    assert_eq!(info.rule_names, vec!["load", "check"]);
    assert!(info.is_parallel);
    assert!(!info.is_async);
    assert!(info.input_type.contains("Mutex"));
}
