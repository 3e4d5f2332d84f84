//! Unit tests for the state machine, event stores, activity executor,
//! configuration and activity collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serial_test::serial;

use research_report::activities::{
    MarkdownReportRenderer, OpenAiChatModel, RenderError, StubModel, format_report,
};
use research_report::executor::{ActivityContext, AttemptError};
use research_report::types::{FragmentKind, RenderInput, ResearchInput};
use research_report::workflow::{
    Command, RENDER_ACTIVITY, RESEARCH_ACTIVITY, artifact_filename, compose_prompt,
};
use research_report::{
    ActivityError, ActivityExecutor, ActivityInvocation, ActivityOptions, ActivityRegistry,
    AppConfig, ConfigError, DocumentRenderer, EngineError, Event, EventKind, EventLogStore,
    FileEventLog, InMemoryEventLog, InstanceState, LanguageModel, Outcome, ReportActivities,
    RetryPolicy, StateError, Step, UserDecision, WorkflowSettings,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PROMPT: &str = "tardigrades";

fn created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn event(seq: u64, kind: EventKind) -> Event {
    Event {
        instance_id: "report-1".to_string(),
        seq,
        recorded_at: created_at(),
        kind,
    }
}

/// An in-test history that keeps state and log in lockstep, the way the
/// orchestrator does after each committed append.
struct Recorder {
    state: InstanceState,
    log: Vec<Event>,
    settings: WorkflowSettings,
}

impl Recorder {
    fn start() -> Self {
        let first = event(
            1,
            EventKind::InstanceStarted {
                prompt: PROMPT.to_string(),
                model: "gpt-4o".to_string(),
                created_at: created_at(),
            },
        );
        let state = InstanceState::replay("report-1", std::slice::from_ref(&first)).unwrap();
        Self {
            state,
            log: vec![first],
            settings: WorkflowSettings::default(),
        }
    }

    fn record(&mut self, kind: EventKind) {
        let e = event(self.log.len() as u64 + 1, kind);
        self.state.apply(&e).unwrap();
        self.log.push(e);
    }

    fn decide(&self) -> Command {
        self.state.decide(&self.settings)
    }

    /// Record the `ActivityScheduled` the state machine asks for.
    fn schedule(&mut self) -> ActivityInvocation {
        match self.decide() {
            Command::Schedule(invocation) => {
                self.record(EventKind::ActivityScheduled {
                    invocation: invocation.clone(),
                });
                invocation
            }
            other => panic!("expected Schedule, got {other:?}"),
        }
    }

    fn complete_in_flight(&mut self, output: &str) {
        let scheduled_seq = self.state.in_flight.as_ref().expect("nothing in flight").scheduled_seq;
        self.record(EventKind::ActivityCompleted {
            scheduled_seq,
            output: serde_json::json!(output),
        });
    }

    fn signal(&mut self, signal: UserDecision) {
        self.record(EventKind::SignalReceived { signal });
    }

    fn finish(&mut self) -> Outcome {
        match self.decide() {
            Command::Complete(outcome) => {
                self.record(EventKind::InstanceCompleted {
                    outcome: outcome.clone(),
                });
                outcome
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }
}

fn research_prompt(invocation: &ActivityInvocation) -> String {
    assert_eq!(invocation.name, RESEARCH_ACTIVITY);
    serde_json::from_value::<ResearchInput>(invocation.input.clone())
        .unwrap()
        .prompt
}

// ---------------------------------------------------------------------------
// State machine tests
// ---------------------------------------------------------------------------

#[test]
fn first_decision_schedules_research_with_original_prompt() {
    let mut rec = Recorder::start();
    assert_eq!(rec.state.step, Step::AwaitingResearch);

    let invocation = rec.schedule();
    assert_eq!(research_prompt(&invocation), PROMPT);
    assert_eq!(invocation.options, rec.settings.research);
    assert_eq!(rec.state.research_rounds, 1);
    assert!(matches!(rec.decide(), Command::Dispatch(s) if s.scheduled_seq == 2));
}

#[test]
fn research_result_moves_to_awaiting_decision() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("five facts");

    assert_eq!(rec.state.step, Step::AwaitingDecision);
    assert_eq!(rec.state.research.as_deref(), Some("five facts"));
    assert_eq!(rec.decide(), Command::AwaitSignal);
    let kinds: Vec<FragmentKind> = rec.state.context.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FragmentKind::Prompt, FragmentKind::Research]);
}

#[test]
fn edit_then_keep_reenters_research_once_then_finalizes() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("first draft");

    rec.signal(UserDecision::edit(Some("X".to_string())));
    let second = rec.schedule();
    assert_eq!(research_prompt(&second), format!("{PROMPT}\n\nAdditional instructions: X"));
    assert_eq!(rec.state.step, Step::AwaitingResearch);
    assert_eq!(rec.state.research_rounds, 2);
    assert!(rec.state.pending_signal.is_none(), "edit must be consumed");

    rec.complete_in_flight("second draft");
    rec.signal(UserDecision::keep());
    let render = rec.schedule();
    assert_eq!(render.name, RENDER_ACTIVITY);
    let input: RenderInput = serde_json::from_value(render.input).unwrap();
    assert_eq!(input.content, "second draft");
    assert_eq!(input.filename, "research_report-report-1.md");
    assert_eq!(rec.state.step, Step::Finalizing);

    rec.complete_in_flight("research_report.md");
    let outcome = rec.finish();
    assert_eq!(
        outcome,
        Outcome::Succeeded {
            artifact_id: "research_report.md".to_string()
        }
    );
    assert_eq!(rec.state.step, Step::Completed);

    let research_rounds = rec
        .log
        .iter()
        .filter(|e| {
            matches!(
                &e.kind,
                EventKind::ActivityScheduled { invocation } if invocation.name == RESEARCH_ACTIVITY
            )
        })
        .count();
    assert_eq!(research_rounds, 2);
}

#[test]
fn artifact_names_are_unique_per_instance() {
    assert_eq!(artifact_filename("research_report.md", "report-1"), "research_report-report-1.md");
    assert_eq!(artifact_filename("summary", "a/b c"), "summary-a_b_c");
    assert_eq!(artifact_filename(".hidden", "x"), ".hidden-x");
    assert_ne!(
        artifact_filename("research_report.md", "report-1"),
        artifact_filename("research_report.md", "report-2")
    );
}

#[test]
fn edit_without_instructions_reuses_original_prompt() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");

    rec.signal(UserDecision::edit(None));
    assert_eq!(research_prompt(&rec.schedule()), PROMPT);

    rec.complete_in_flight("draft 2");
    rec.signal(UserDecision::edit(Some("   ".to_string())));
    assert_eq!(research_prompt(&rec.schedule()), PROMPT);
}

#[test]
fn edits_always_build_on_the_original_prompt() {
    assert_eq!(compose_prompt("p", Some("a")), "p\n\nAdditional instructions: a");
    assert_eq!(compose_prompt("p", None), "p");

    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");
    rec.signal(UserDecision::edit(Some("shorter".to_string())));
    rec.schedule();
    rec.complete_in_flight("draft 2");
    rec.signal(UserDecision::edit(Some("funnier".to_string())));
    assert_eq!(
        research_prompt(&rec.schedule()),
        format!("{PROMPT}\n\nAdditional instructions: funnier")
    );
}

#[test]
fn second_unconsumed_signal_wins() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");

    rec.signal(UserDecision::edit(Some("X".to_string())));
    rec.signal(UserDecision::keep());
    assert_eq!(rec.state.pending_signal, Some(UserDecision::keep()));

    let next = rec.schedule();
    assert_eq!(next.name, RENDER_ACTIVITY, "only the keep should be observed");
    assert_eq!(rec.state.research_rounds, 1);
}

#[test]
fn signal_during_research_is_held_until_the_decision_point() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.signal(UserDecision::keep());
    assert_eq!(rec.state.step, Step::AwaitingResearch);
    assert!(matches!(rec.decide(), Command::Dispatch(_)));

    rec.complete_in_flight("draft");
    assert_eq!(rec.schedule().name, RENDER_ACTIVITY);
}

#[test]
fn invalid_decision_fails_instance() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");
    rec.signal(UserDecision::other("bogus"));

    let outcome = rec.finish();
    match outcome {
        Outcome::Failed { reason } => {
            assert!(reason.contains("invalid decision: bogus"), "{reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(rec.state.step, Step::Failed);
    assert_eq!(rec.decide(), Command::Halt);
}

#[test]
fn exhausted_research_fails_instance() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.record(EventKind::ActivityFailed {
        scheduled_seq: 2,
        error: ActivityError::RetriesExhausted {
            attempts: 3,
            message: "boom".to_string(),
        },
    });

    match rec.finish() {
        Outcome::Failed { reason } => {
            assert!(reason.starts_with("research failed: "), "{reason}");
            assert!(reason.contains("retries exhausted"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn exhausted_render_fails_instance() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");
    rec.signal(UserDecision::keep());
    rec.schedule();
    rec.record(EventKind::ActivityFailed {
        scheduled_seq: 5,
        error: ActivityError::Timeout {
            timeout: Duration::from_secs(20),
        },
    });

    match rec.finish() {
        Outcome::Failed { reason } => assert!(reason.starts_with("render failed: "), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn signals_after_terminal_state_are_ignored() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");
    rec.signal(UserDecision::other("nope"));
    rec.finish();

    rec.signal(UserDecision::keep());
    assert!(rec.state.pending_signal.is_none());
    assert_eq!(rec.state.step, Step::Failed);
    assert_eq!(rec.decide(), Command::Halt);
}

#[test]
fn replay_is_deterministic() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");
    rec.signal(UserDecision::edit(Some("more detail".to_string())));
    rec.schedule();
    rec.signal(UserDecision::other("ignored"));
    rec.signal(UserDecision::keep());
    rec.complete_in_flight("draft 2");
    rec.schedule();
    rec.complete_in_flight("out.md");
    rec.finish();

    let first = InstanceState::replay("report-1", &rec.log).unwrap();
    let second = InstanceState::replay("report-1", &rec.log).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, rec.state, "replay must match the incrementally built state");

    // Every prefix replays to the state seen at that point.
    for len in 1..=rec.log.len() {
        let a = InstanceState::replay("report-1", &rec.log[..len]).unwrap();
        let b = InstanceState::replay("report-1", &rec.log[..len]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.decide(&rec.settings), b.decide(&rec.settings));
    }
}

#[test]
fn replay_of_unresolved_activity_redispatches_it() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.complete_in_flight("draft");
    rec.signal(UserDecision::keep());
    let render = rec.schedule();

    let rebuilt = InstanceState::replay("report-1", &rec.log).unwrap();
    assert_eq!(rebuilt.step, Step::Finalizing);
    match rebuilt.decide(&rec.settings) {
        Command::Dispatch(scheduled) => {
            assert_eq!(scheduled.scheduled_seq, 5);
            assert_eq!(scheduled.invocation, render);
        }
        other => panic!("expected Dispatch, got {other:?}"),
    }
}

#[test]
fn replay_rejects_malformed_histories() {
    let no_start = vec![event(
        1,
        EventKind::SignalReceived {
            signal: UserDecision::keep(),
        },
    )];
    assert!(matches!(
        InstanceState::replay("report-1", &no_start),
        Err(StateError::CorruptHistory { .. })
    ));

    let rec = Recorder::start();
    let mut gap = rec.log.clone();
    gap.push(event(
        3,
        EventKind::SignalReceived {
            signal: UserDecision::keep(),
        },
    ));
    assert!(matches!(
        InstanceState::replay("report-1", &gap),
        Err(StateError::CorruptHistory { .. })
    ));

    assert!(matches!(
        InstanceState::replay("report-1", &[]),
        Err(StateError::NotFound(_))
    ));
}

#[test]
fn stale_activity_results_are_ignored() {
    let mut rec = Recorder::start();
    rec.schedule();
    rec.record(EventKind::InstanceCompleted {
        outcome: Outcome::failed("cancelled"),
    });
    rec.record(EventKind::ActivityCompleted {
        scheduled_seq: 2,
        output: serde_json::json!("late"),
    });
    assert_eq!(rec.state.step, Step::Failed);
    assert!(rec.state.research.is_none());
}

#[test]
fn non_text_activity_output_fails_instance_on_replay() {
    let mut r = Recorder::start();
    r.schedule();
    let scheduled_seq = r.state.in_flight.as_ref().unwrap().scheduled_seq;
    r.record(EventKind::ActivityCompleted {
        scheduled_seq,
        output: serde_json::json!({ "text": "facts" }),
    });
    assert!(r.state.research.is_none());
    assert!(r.state.in_flight.is_none());

    let replayed = InstanceState::replay("report-1", &r.log).unwrap();
    assert_eq!(replayed.decide(&r.settings), r.decide());
    match r.finish() {
        Outcome::Failed { reason } => {
            assert!(reason.starts_with("research failed: "), "{reason}");
            assert!(reason.contains("non-text output"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Event store tests
// ---------------------------------------------------------------------------

fn signal_kind(decision: &str) -> EventKind {
    EventKind::SignalReceived {
        signal: UserDecision::other(decision),
    }
}

async fn exercise_store(store: &dyn EventLogStore) {
    assert!(store.read_all("a").await.unwrap().is_empty());

    let first = store.append("a", 0, signal_kind("one")).await.unwrap();
    assert_eq!(first.seq, 1);
    let second = store.append("a", 1, signal_kind("two")).await.unwrap();
    assert_eq!(second.seq, 2);

    let err = store.append("a", 1, signal_kind("stale")).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::State(StateError::ConcurrencyConflict {
            instance_id: "a".to_string(),
            expected: 1,
            actual: 2,
        })
    );

    let err = store.append("b", 3, signal_kind("ahead")).await.unwrap_err();
    assert!(err.is_conflict());
    store.append("b", 0, signal_kind("b1")).await.unwrap();

    let events = store.read_all("a").await.unwrap();
    assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(events[1].kind, signal_kind("two"));

    let tail = store.read_after("a", 1).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq, 2);

    assert_eq!(store.list_instances().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn in_memory_store_appends_in_order_and_checks_sequence() {
    let store = InMemoryEventLog::new();
    exercise_store(&store).await;
    assert_eq!(store.len("a"), 2);
}

#[tokio::test]
async fn file_store_appends_in_order_and_checks_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileEventLog::open(dir.path()).await.unwrap();
    exercise_store(&store).await;
}

#[tokio::test]
async fn file_store_history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileEventLog::open(dir.path()).await.unwrap();
        store
            .append(
                "report-1",
                0,
                EventKind::InstanceStarted {
                    prompt: PROMPT.to_string(),
                    model: "gpt-4o".to_string(),
                    created_at: created_at(),
                },
            )
            .await
            .unwrap();
        store.append("report-1", 1, signal_kind("keep")).await.unwrap();
    }

    let reopened = FileEventLog::open(dir.path()).await.unwrap();
    let events = reopened.read_all("report-1").await.unwrap();
    assert_eq!(events.len(), 2);
    let state = InstanceState::replay("report-1", &events).unwrap();
    assert_eq!(state.original_prompt, PROMPT);
    assert_eq!(state.pending_signal, Some(UserDecision::other("keep")));
}

#[tokio::test]
async fn file_store_ignores_torn_trailing_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileEventLog::open(dir.path()).await.unwrap();
    store.append("a", 0, signal_kind("one")).await.unwrap();

    let path = dir.path().join("a.jsonl");
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("{\"instance_id\":\"a\",\"seq\":2,");
    std::fs::write(&path, contents).unwrap();

    assert_eq!(store.read_all("a").await.unwrap().len(), 1);
    let next = store.append("a", 1, signal_kind("two")).await.unwrap();
    assert_eq!(next.seq, 2);
    assert_eq!(store.read_all("a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn file_store_rejects_path_like_instance_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileEventLog::open(dir.path()).await.unwrap();
    let err = store.append("../escape", 0, signal_kind("x")).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));

    // Such ids simply have no history.
    assert!(store.read_all("../escape").await.unwrap().is_empty());
    assert!(store.read_after(".hidden", 0).await.unwrap().is_empty());
    assert!(store.list_instances().await.unwrap().is_empty());
}

#[test]
fn events_roundtrip_through_json() {
    let e = event(
        4,
        EventKind::ActivityFailed {
            scheduled_seq: 3,
            error: ActivityError::RetriesExhausted {
                attempts: 3,
                message: "boom".to_string(),
            },
        },
    );
    let json = serde_json::to_string(&e).unwrap();
    assert!(json.contains("\"event\":\"activity_failed\""), "{json}");
    let back: Event = serde_json::from_str(&json).unwrap();
    assert_eq!(back, e);

    let rejected = event(
        5,
        EventKind::ActivityFailed {
            scheduled_seq: 3,
            error: ActivityError::Rejected("no such activity".to_string()),
        },
    );
    let json = serde_json::to_string(&rejected).unwrap();
    assert_eq!(serde_json::from_str::<Event>(&json).unwrap(), rejected);
}

// ---------------------------------------------------------------------------
// Activity executor tests
// ---------------------------------------------------------------------------

fn invocation(name: &str, policy: RetryPolicy) -> ActivityInvocation {
    ActivityInvocation {
        name: name.to_string(),
        input: serde_json::json!({}),
        options: ActivityOptions {
            start_to_close_timeout: Duration::from_secs(5),
            retry_policy: policy,
        },
    }
}

fn fast_policy(maximum_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        maximum_attempts,
        initial_interval: Duration::from_millis(1),
        backoff_coefficient: 2.0,
        maximum_interval: None,
    }
}

#[tokio::test]
async fn always_failing_activity_runs_exactly_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActivityRegistry::new();
    let counter = Arc::clone(&calls);
    registry.register_fn("flaky", move |_ctx, _input: serde_json::Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(AttemptError::from(anyhow::anyhow!("always broken")))
        }
    });
    let executor = ActivityExecutor::new(registry);

    let err = executor
        .execute("report-1", &invocation("flaky", fast_policy(3)))
        .await
        .unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        err,
        ActivityError::RetriesExhausted {
            attempts: 3,
            message: "always broken".to_string(),
        }
    );
    assert!(err.to_string().contains("retries exhausted"));
}

#[tokio::test(start_paused = true)]
async fn retries_follow_exponential_backoff() {
    let start = tokio::time::Instant::now();
    let offsets = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = ActivityRegistry::new();
    let seen = Arc::clone(&offsets);
    registry.register_fn("flaky", move |ctx: ActivityContext, _input: serde_json::Value| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push((ctx.attempt, start.elapsed()));
            Err::<String, _>(AttemptError::from(anyhow::anyhow!("attempt {} failed", ctx.attempt)))
        }
    });
    let executor = ActivityExecutor::new(registry);

    let err = executor
        .execute("report-1", &invocation("flaky", RetryPolicy::default()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ActivityError::RetriesExhausted { attempts: 3, ref message }
            if message == "attempt 3 failed"
    ));

    let offsets = offsets.lock().unwrap().clone();
    assert_eq!(
        offsets,
        vec![
            (1, Duration::ZERO),
            (2, Duration::from_secs(1)),
            (3, Duration::from_secs(3)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn attempt_that_never_finishes_times_out() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActivityRegistry::new();
    let counter = Arc::clone(&calls);
    registry.register_fn("slow", move |_ctx, _input: serde_json::Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, AttemptError>("never".to_string())
        }
    });
    let executor = ActivityExecutor::new(registry);

    let mut slow = invocation("slow", RetryPolicy {
        maximum_attempts: 2,
        ..RetryPolicy::default()
    });
    slow.options.start_to_close_timeout = Duration::from_secs(1);

    let err = executor.execute("report-1", &slow).await.unwrap_err();
    assert_eq!(
        err,
        ActivityError::Timeout {
            timeout: Duration::from_secs(1)
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn flaky_activity_succeeds_on_a_later_attempt() {
    let mut registry = ActivityRegistry::new();
    registry.register_fn(
        "third_time_lucky",
        |ctx: ActivityContext, _input: serde_json::Value| async move {
            if ctx.attempt < 3 {
                return Err(AttemptError::from(anyhow::anyhow!("not yet")));
            }
            Ok::<_, AttemptError>(format!("done on attempt {}", ctx.attempt))
        },
    );
    let executor = ActivityExecutor::new(registry);

    let output = executor
        .execute("report-1", &invocation("third_time_lucky", fast_policy(3)))
        .await
        .unwrap();
    assert_eq!(output, serde_json::json!("done on attempt 3"));
}

#[tokio::test]
async fn non_retryable_failures_are_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActivityRegistry::new();
    let counter = Arc::clone(&calls);
    registry.register_fn("refuses", move |_ctx, _input: serde_json::Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(AttemptError::non_retryable(anyhow::anyhow!("bad request")))
        }
    });
    let executor = ActivityExecutor::new(registry);

    let err = executor
        .execute("report-1", &invocation("refuses", fast_policy(5)))
        .await
        .unwrap_err();
    assert_eq!(err, ActivityError::Rejected("bad request".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_activity_and_bad_input_are_rejected() {
    let mut registry = ActivityRegistry::new();
    registry.register_fn("typed", |_ctx, input: ResearchInput| async move {
        Ok::<_, AttemptError>(input.prompt)
    });
    let executor = ActivityExecutor::new(registry);
    assert_eq!(executor.registry().names(), vec!["typed"]);

    let err = executor
        .execute("report-1", &invocation("missing", fast_policy(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, ActivityError::Rejected(msg) if msg.contains("missing")));

    let err = executor
        .execute("report-1", &invocation("typed", fast_policy(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, ActivityError::Rejected(msg) if msg.contains("invalid input")));
}

// ---------------------------------------------------------------------------
// Activity collaborator tests
// ---------------------------------------------------------------------------

#[test]
fn report_layout_has_title_and_one_block_per_paragraph() {
    let report = format_report("First fact.\n\n\n\n  Second fact.  \n\n");
    assert_eq!(report, "# Research Report\n\nFirst fact.\n\nSecond fact.\n");
}

#[tokio::test]
async fn markdown_renderer_writes_into_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = MarkdownReportRenderer::new(dir.path().join("reports"));

    let artifact = renderer.render("Tardigrades survive space.", "facts.md").await.unwrap();
    let written = std::fs::read_to_string(&artifact).unwrap();
    assert!(artifact.ends_with("facts.md"));
    assert!(written.starts_with("# Research Report"));
    assert!(written.contains("Tardigrades survive space."));

    let err = renderer.render("x", "../facts.md").await.unwrap_err();
    assert!(matches!(err, RenderError::InvalidFilename(_)));
}

#[tokio::test]
async fn stub_model_echoes_prompt() {
    let text = StubModel.complete("water bears", "gpt-4o").await.unwrap();
    assert!(text.contains("water bears"));
    assert!(text.contains("gpt-4o"));
}

fn report_executor(
    model: Arc<dyn LanguageModel>,
    dir: &std::path::Path,
    failures: u32,
) -> ActivityExecutor {
    let mut registry = ActivityRegistry::new();
    ReportActivities::new(model, Arc::new(MarkdownReportRenderer::new(dir)))
        .with_simulated_render_failures(failures)
        .register(&mut registry);
    ActivityExecutor::new(registry)
}

#[tokio::test]
async fn simulated_render_failures_are_retried_away() {
    let dir = tempfile::tempdir().unwrap();
    let executor = report_executor(Arc::new(StubModel), dir.path(), 2);

    let render = ActivityInvocation {
        name: RENDER_ACTIVITY.to_string(),
        input: serde_json::json!(RenderInput {
            content: "facts".to_string(),
            filename: "report.md".to_string(),
        }),
        options: ActivityOptions {
            start_to_close_timeout: Duration::from_secs(5),
            retry_policy: fast_policy(3),
        },
    };
    let artifact = executor.execute("report-1", &render).await.unwrap();
    assert!(artifact.as_str().unwrap().ends_with("report.md"));

    let too_few = ActivityInvocation {
        options: ActivityOptions {
            retry_policy: fast_policy(2),
            ..render.options.clone()
        },
        ..render
    };
    let err = executor.execute("report-1", &too_few).await.unwrap_err();
    assert!(matches!(err, ActivityError::RetriesExhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn research_without_api_key_is_rejected_without_retries() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(OpenAiChatModel::new("http://127.0.0.1:9", None));
    let executor = report_executor(model, dir.path(), 0);

    let research = ActivityInvocation {
        name: RESEARCH_ACTIVITY.to_string(),
        input: serde_json::json!(ResearchInput {
            prompt: PROMPT.to_string(),
            model: "gpt-4o".to_string(),
        }),
        options: ActivityOptions {
            start_to_close_timeout: Duration::from_secs(5),
            retry_policy: fast_policy(3),
        },
    };
    let err = executor.execute("report-1", &research).await.unwrap_err();
    assert!(matches!(err, ActivityError::Rejected(msg) if msg.contains("OPENAI_API_KEY")));
}

// ---------------------------------------------------------------------------
// Configuration tests
// ---------------------------------------------------------------------------

#[test]
fn default_config_mirrors_tutorial_settings() {
    let settings = AppConfig::default().workflow_settings();
    assert_eq!(settings.model, "gpt-4o");
    assert_eq!(settings.research.start_to_close_timeout, Duration::from_secs(30));
    assert_eq!(settings.render.start_to_close_timeout, Duration::from_secs(20));
    assert_eq!(settings.render.retry_policy, RetryPolicy::default());
    assert_eq!(settings.report_filename, "research_report.md");
}

#[test]
fn partial_toml_keeps_defaults_for_missing_fields() {
    let config = AppConfig::from_toml_str(
        r#"
        [model]
        name = "gpt-4o-mini"

        [render]
        max_attempts = 5
        initial_interval_ms = 250

        [report]
        simulated_failures = 2
        "#,
    )
    .unwrap();

    let settings = config.workflow_settings();
    assert_eq!(settings.model, "gpt-4o-mini");
    assert_eq!(settings.render.start_to_close_timeout, Duration::from_secs(20));
    assert_eq!(settings.render.retry_policy.maximum_attempts, 5);
    assert_eq!(settings.render.retry_policy.initial_interval, Duration::from_millis(250));
    assert_eq!(settings.research.retry_policy, RetryPolicy::default());
    assert_eq!(config.report.simulated_failures, 2);
    assert!(!config.model.stub);
}

#[test]
fn invalid_toml_values_are_rejected() {
    assert!(matches!(
        AppConfig::from_toml_str("[research]\nbackoff_coefficient = 0.5"),
        Err(ConfigError::Invalid(_))
    ));
    assert!(AppConfig::from_toml_str("[render]\ntimeout_secs = 0").is_err());
    assert!(AppConfig::from_toml_str("[report]\nfilename = \"\"").is_err());
}

#[test]
fn environment_overrides_file_values() {
    let mut config = AppConfig::from_toml_str("[model]\nname = \"from-file\"").unwrap();
    config.apply_env(|key| match key {
        "OPENAI_API_KEY" => Some("sk-test".to_string()),
        "RESEARCH_MODEL" => Some("from-env".to_string()),
        "RESEARCH_STUB_MODEL" => Some("true".to_string()),
        "RESEARCH_DATA_DIR" => Some("/tmp/reports".to_string()),
        _ => None,
    });
    assert_eq!(config.model.api_key.as_deref(), Some("sk-test"));
    assert_eq!(config.model.name, "from-env");
    assert!(config.model.stub);
    assert_eq!(config.store.dir, std::path::PathBuf::from("/tmp/reports"));
}

#[test]
#[serial]
fn load_reads_file_named_by_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    let raw = "[model]\nname = \"custom\"\n[store]\ndir = \"/var/lib/reports\"\n";
    std::fs::write(&path, raw).unwrap();

    // SAFETY: serialized with the other environment-mutating tests.
    unsafe {
        std::env::set_var(research_report::config::CONFIG_ENV, &path);
        std::env::remove_var("RESEARCH_MODEL");
        std::env::remove_var("RESEARCH_DATA_DIR");
    }
    let loaded = AppConfig::load();
    unsafe {
        std::env::remove_var(research_report::config::CONFIG_ENV);
    }

    let config = loaded.unwrap();
    assert_eq!(config.model.name, "custom");
    assert_eq!(config.store.dir, std::path::PathBuf::from("/var/lib/reports"));
}

#[test]
#[serial]
fn load_reports_missing_config_file() {
    // SAFETY: serialized with the other environment-mutating tests.
    unsafe {
        std::env::set_var(research_report::config::CONFIG_ENV, "/definitely/not/here.toml");
    }
    let loaded = AppConfig::load();
    unsafe {
        std::env::remove_var(research_report::config::CONFIG_ENV);
    }
    assert!(matches!(loaded, Err(ConfigError::Read { .. })));
}

/// The binaries propagate config errors with `?` into `color_eyre::Report`.
fn load_for_binary(raw: &str) -> color_eyre::Result<AppConfig> {
    Ok(AppConfig::from_toml_str(raw)?)
}

#[test]
fn config_errors_convert_into_reports() {
    let report = load_for_binary("[render]\ntimeout_secs = 0").unwrap_err();
    assert!(report.to_string().contains("render.timeout_secs"), "{report}");

    let report = load_for_binary("[model\nname = ").unwrap_err();
    assert!(report.to_string().starts_with("invalid config"), "{report}");

    assert!(load_for_binary("").is_ok());
}
