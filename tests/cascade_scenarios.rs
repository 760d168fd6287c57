use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cascade_kernel::{
    CascadeStage, CascadeState, ConfirmationCascade, ConfirmationStage, DeliveryError, Detection,
    DispatcherConfig, EventOutcome, Frame, InFlightRegistry, NotificationDispatcher,
    NotificationPayload, NotificationSink, ObjectClass, OutcomeObserver, RetryPolicy,
    ShutdownSignal, SourceId, StageError, StagePolicy, StageResult, Timestamp, TimeoutPolicy,
    Trigger, TriggerId, Verdict,
};

struct ScriptedStage {
    name: String,
    results: Mutex<VecDeque<StageResult>>,
    fallback: StageResult,
    calls: AtomicUsize,
}

impl ScriptedStage {
    fn always(name: &str, result: StageResult) -> Arc<Self> {
        Self::script(name, Vec::new(), result)
    }

    fn script(name: &str, results: Vec<StageResult>, fallback: StageResult) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            results: Mutex::new(results.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConfirmationStage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn confirm(&self, _frame: &Frame, _deadline: Instant) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Never answers within any reasonable deadline.
struct HangingStage {
    calls: AtomicUsize,
}

impl ConfirmationStage for HangingStage {
    fn name(&self) -> &str {
        "hanging"
    }

    fn confirm(&self, _frame: &Frame, _deadline: Instant) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_secs(30));
        StageResult::Rejected("too late".into())
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<EventOutcome>>);

impl OutcomeObserver for Collect {
    fn observe(&self, outcome: &EventOutcome) {
        self.0.lock().unwrap().push(outcome.clone());
    }
}

#[derive(Default)]
struct CollectSink(Mutex<Vec<NotificationPayload>>);

impl NotificationSink for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        self.0.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

fn person(confidence: f32) -> Detection {
    Detection {
        x: 0.1,
        y: 0.1,
        w: 0.3,
        h: 0.6,
        confidence,
        class: ObjectClass::Person,
    }
}

fn trigger(id: u64) -> Trigger {
    let source = SourceId::from("porch");
    Trigger {
        id: TriggerId::from_raw(id),
        source: source.clone(),
        created_at: Timestamp::from_millis(1_000 + id),
        magnitude: 42.0,
        frame: Arc::new(Frame::gray(source, Timestamp::from_millis(1_000 + id), 2, 2, vec![7; 4])),
    }
}

fn cascade(
    stages: Vec<CascadeStage>,
    shutdown: ShutdownSignal,
    observer: Arc<Collect>,
) -> ConfirmationCascade {
    ConfirmationCascade::new(stages, Arc::new(InFlightRegistry::new(1)), shutdown, observer)
}

fn dispatcher(sink: Arc<CollectSink>) -> NotificationDispatcher {
    NotificationDispatcher::new(
        vec![sink as Arc<dyn NotificationSink>],
        DispatcherConfig::default(),
        ShutdownSignal::new(),
    )
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

#[test]
fn both_stages_confirm_and_sink_receives_one_delivery() {
    let first = ScriptedStage::always("edge", StageResult::Confirmed(vec![person(0.6)]));
    let last = ScriptedStage::always("cloud", StageResult::Confirmed(vec![person(0.97)]));
    let observer = Arc::new(Collect::default());
    let cascade = cascade(
        vec![
            CascadeStage::new(first.clone(), StagePolicy::default()),
            CascadeStage::new(last.clone(), StagePolicy::default()),
        ],
        ShutdownSignal::new(),
        observer.clone(),
    );
    let sink = Arc::new(CollectSink::default());
    let dispatcher = dispatcher(sink.clone());

    let outcome = cascade.run(trigger(1)).unwrap();
    assert_eq!(outcome.state, CascadeState::Confirmed);
    assert_eq!(outcome.verdict, Verdict::Notified);
    assert_eq!(outcome.detections, vec![person(0.97)]);

    let report = dispatcher.dispatch(&outcome);
    assert_eq!(report.delivered(), 1);
    let delivered = sink.0.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].trigger_id, TriggerId::from_raw(1));
    assert_eq!(delivered[0].frame_digest, outcome.frame_digest);
    assert_eq!(observer.0.lock().unwrap().len(), 1);
}

#[test]
fn first_stage_rejection_stops_the_cascade() {
    let first = ScriptedStage::always("edge", StageResult::Rejected("empty scene".into()));
    let last = ScriptedStage::always("cloud", StageResult::Confirmed(vec![person(0.9)]));
    let observer = Arc::new(Collect::default());
    let cascade = cascade(
        vec![
            CascadeStage::new(first.clone(), StagePolicy::default()),
            CascadeStage::new(last.clone(), StagePolicy::default()),
        ],
        ShutdownSignal::new(),
        observer.clone(),
    );
    let sink = Arc::new(CollectSink::default());
    let dispatcher = dispatcher(sink.clone());

    let outcome = cascade.run(trigger(2)).unwrap();
    assert_eq!(outcome.state, CascadeState::Rejected);
    assert_eq!(outcome.verdict, Verdict::Discarded);
    assert_eq!(outcome.reason.as_deref(), Some("empty scene"));
    assert_eq!(last.calls(), 0);

    let report = dispatcher.dispatch(&outcome);
    assert!(report.sinks.is_empty());
    assert!(sink.0.lock().unwrap().is_empty());
}

#[test]
fn repeated_timeouts_end_in_timed_out_and_are_still_recorded() {
    let hanging = Arc::new(HangingStage {
        calls: AtomicUsize::new(0),
    });
    let policy = StagePolicy {
        deadline: Duration::from_millis(60),
        on_timeout: TimeoutPolicy::Retry,
        retry: fast_retry(3),
    };
    let observer = Arc::new(Collect::default());
    let cascade = cascade(
        vec![CascadeStage::new(hanging.clone(), policy)],
        ShutdownSignal::new(),
        observer.clone(),
    );
    let sink = Arc::new(CollectSink::default());
    let dispatcher = dispatcher(sink.clone());

    let outcome = cascade.run(trigger(3)).unwrap();
    assert_eq!(outcome.state, CascadeState::TimedOut);
    assert_eq!(outcome.verdict, Verdict::Errored);
    assert_eq!(outcome.invocations_of(0), 3);
    assert!(outcome
        .attempts
        .iter()
        .all(|a| a.result == StageResult::TimedOut));
    assert_eq!(hanging.calls.load(Ordering::SeqCst), 3);

    dispatcher.dispatch(&outcome);
    assert!(sink.0.lock().unwrap().is_empty());
    let seen = observer.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].state, CascadeState::TimedOut);
}

#[test]
fn shutdown_mid_cascade_fails_the_trigger_promptly() {
    let hanging = Arc::new(HangingStage {
        calls: AtomicUsize::new(0),
    });
    let shutdown = ShutdownSignal::new();
    let observer = Arc::new(Collect::default());
    let cascade = cascade(
        vec![CascadeStage::new(
            hanging,
            StagePolicy::fail_closed(Duration::from_secs(20)),
        )],
        shutdown.clone(),
        observer.clone(),
    );

    let trigger_signal = shutdown.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        trigger_signal.trigger();
    });

    let started = Instant::now();
    let outcome = cascade.run(trigger(4)).unwrap();
    stopper.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.state, CascadeState::Failed);
    assert_eq!(outcome.reason.as_deref(), Some("shutdown"));
    assert_eq!(observer.0.lock().unwrap().len(), 1);
    assert_eq!(cascade.registry().total_active(), 0);
}

#[test]
fn never_responding_stage_cannot_block_the_cascade() {
    let hanging = Arc::new(HangingStage {
        calls: AtomicUsize::new(0),
    });
    let observer = Arc::new(Collect::default());
    let cascade = cascade(
        vec![CascadeStage::new(
            hanging,
            StagePolicy::fail_closed(Duration::from_millis(80)),
        )],
        ShutdownSignal::new(),
        observer,
    );

    let started = Instant::now();
    let outcome = cascade.run(trigger(5)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.state, CascadeState::Rejected);

    // The source is free again for the next trigger.
    let next = cascade.run(trigger(6)).unwrap();
    assert!(next.state.is_terminal());
}

#[test]
fn transient_failure_then_confirmation_escalates() {
    let flaky = ScriptedStage::script(
        "cloud",
        vec![StageResult::Failed(StageError::transient("503"))],
        StageResult::Confirmed(vec![person(0.8)]),
    );
    let observer = Arc::new(Collect::default());
    let cascade = cascade(
        vec![CascadeStage::new(
            flaky.clone(),
            StagePolicy::retrying(Duration::from_millis(200), fast_retry(3)),
        )],
        ShutdownSignal::new(),
        observer,
    );

    let outcome = cascade.run(trigger(7)).unwrap();
    assert_eq!(outcome.state, CascadeState::Confirmed);
    assert_eq!(outcome.invocations_of(0), 2);
    assert_eq!(flaky.calls(), 2);
}

#[test]
fn later_stages_run_only_after_a_confirmation() {
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    for round in 0..200u64 {
        let stage_count = rng.gen_range(1..=4);
        let stages: Vec<Arc<ScriptedStage>> = (0..stage_count)
            .map(|i| {
                let result = match rng.gen_range(0..3) {
                    0 => StageResult::Confirmed(vec![person(0.5 + i as f32 / 10.0)]),
                    1 => StageResult::Rejected("no".into()),
                    _ => StageResult::Failed(StageError::permanent("broken")),
                };
                ScriptedStage::always(&format!("s{}", i), result)
            })
            .collect();
        let cascade = cascade(
            stages
                .iter()
                .map(|s| {
                    let stage: Arc<dyn ConfirmationStage> = s.clone();
                    CascadeStage::new(stage, StagePolicy::default())
                })
                .collect(),
            ShutdownSignal::new(),
            Arc::new(Collect::default()),
        );

        let outcome = cascade.run(trigger(100 + round)).unwrap();
        let mut reached = true;
        for (i, stage) in stages.iter().enumerate() {
            assert_eq!(stage.calls(), usize::from(reached), "round {} stage {}", round, i);
            if reached {
                reached = matches!(stage.fallback, StageResult::Confirmed(_));
            }
        }
        // Confirmed iff every stage confirmed.
        assert_eq!(outcome.state == CascadeState::Confirmed, reached);
        assert_eq!(outcome.is_confirmed(), reached);
    }
}
