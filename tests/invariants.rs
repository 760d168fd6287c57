use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cascade_kernel::{
    CascadeStage, ConfirmationCascade, ConfirmationStage, DeliveryError, DispatcherConfig,
    EventOutcome, Frame, InFlightRegistry, InvariantViolation, NotificationDispatcher,
    NotificationPayload, NotificationSink, OutcomeObserver, ShutdownSignal, SourceId,
    StagePolicy, StageResult, Timestamp, Trigger, TriggerIdAllocator,
};

/// Records the highest number of concurrent evaluations seen per source.
#[derive(Default)]
struct ConcurrencyTracker {
    active: Mutex<HashMap<SourceId, usize>>,
    peak: Mutex<HashMap<SourceId, usize>>,
}

impl ConfirmationStage for ConcurrencyTracker {
    fn name(&self) -> &str {
        "tracker"
    }

    fn confirm(&self, frame: &Frame, _deadline: Instant) -> StageResult {
        let source = frame.source().clone();
        {
            let mut active = self.active.lock().unwrap();
            let now = active.entry(source.clone()).or_insert(0);
            *now += 1;
            let mut peak = self.peak.lock().unwrap();
            let best = peak.entry(source.clone()).or_insert(0);
            *best = (*best).max(*now);
        }
        thread::sleep(Duration::from_millis(2));
        *self.active.lock().unwrap().get_mut(&source).unwrap() -= 1;
        StageResult::Confirmed(Vec::new())
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<EventOutcome>>);

impl OutcomeObserver for Collect {
    fn observe(&self, outcome: &EventOutcome) {
        self.0.lock().unwrap().push(outcome.clone());
    }
}

fn trigger_for(ids: &TriggerIdAllocator, source: &SourceId) -> Trigger {
    let now = Timestamp::now();
    Trigger {
        id: ids.next_id(),
        source: source.clone(),
        created_at: now,
        magnitude: 30.0,
        frame: Arc::new(Frame::gray(source.clone(), now, 2, 2, vec![1; 4])),
    }
}

#[test]
fn concurrent_injection_never_runs_two_cascades_for_one_source() {
    let tracker = Arc::new(ConcurrencyTracker::default());
    let observer = Arc::new(Collect::default());
    let cascade = Arc::new(ConfirmationCascade::new(
        vec![CascadeStage::new(
            tracker.clone(),
            StagePolicy::fail_closed(Duration::from_secs(1)),
        )],
        Arc::new(InFlightRegistry::new(1)),
        ShutdownSignal::new(),
        observer.clone(),
    ));
    let ids = TriggerIdAllocator::new();
    let sources: Vec<SourceId> = ["a", "b", "c"].iter().map(|s| SourceId::from(*s)).collect();

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let admitted = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for t in 0..threads {
        let cascade = Arc::clone(&cascade);
        let ids = ids.clone();
        let sources = sources.clone();
        let barrier = Arc::clone(&barrier);
        let admitted = Arc::clone(&admitted);
        let refused = Arc::clone(&refused);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xfeed + t as u64);
            barrier.wait();
            for _ in 0..40 {
                let source = &sources[rng.gen_range(0..sources.len())];
                match cascade.run(trigger_for(&ids, source)) {
                    Ok(_) => {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                    // Ids are allocated before admission, so a thread can
                    // lose the race to a higher id as well as to a busy slot.
                    Err(InvariantViolation::SourceBusy { .. })
                    | Err(InvariantViolation::DuplicateTrigger { .. }) => {
                        refused.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(other) => panic!("unexpected violation: {}", other),
                }
                if rng.gen_bool(0.3) {
                    thread::sleep(Duration::from_millis(rng.gen_range(0..3)));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for (source, peak) in tracker.peak.lock().unwrap().iter() {
        assert_eq!(*peak, 1, "source {} ran {} cascades at once", source, peak);
    }
    let admitted = admitted.load(Ordering::SeqCst);
    assert_eq!(admitted + refused.load(Ordering::SeqCst), threads * 40);

    // Exactly one outcome per admitted trigger, none for refused ones.
    let outcomes = observer.0.lock().unwrap();
    assert_eq!(outcomes.len(), admitted);
    let unique: HashSet<_> = outcomes.iter().map(|o| o.trigger_id).collect();
    assert_eq!(unique.len(), outcomes.len());
    assert_eq!(cascade.registry().total_active(), 0);
}

#[test]
fn replayed_trigger_never_gets_a_second_outcome() {
    let observer = Arc::new(Collect::default());
    let cascade = ConfirmationCascade::new(
        Vec::new(),
        Arc::new(InFlightRegistry::new(1)),
        ShutdownSignal::new(),
        observer.clone(),
    );
    let ids = TriggerIdAllocator::new();
    let source = SourceId::from("door");
    let first = trigger_for(&ids, &source);
    let replay = first.clone();

    assert!(cascade.run(first).is_ok());
    assert!(matches!(
        cascade.run(replay),
        Err(InvariantViolation::DuplicateTrigger { .. })
    ));
    assert_eq!(observer.0.lock().unwrap().len(), 1);
}

struct CountingSink {
    delivered: Mutex<Vec<NotificationPayload>>,
    delay: Duration,
}

impl NotificationSink for CountingSink {
    fn name(&self) -> &str {
        "counting"
    }

    fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        thread::sleep(self.delay);
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

#[test]
fn duplicate_outcomes_across_workers_deliver_once() {
    let sink = Arc::new(CountingSink {
        delivered: Mutex::new(Vec::new()),
        delay: Duration::from_millis(20),
    });
    let dispatcher = Arc::new(NotificationDispatcher::new(
        vec![sink.clone() as Arc<dyn NotificationSink>],
        DispatcherConfig::default(),
        ShutdownSignal::new(),
    ));

    // Zero stages confirm immediately, which gives us real confirmed outcomes.
    let cascade = ConfirmationCascade::new(
        Vec::new(),
        Arc::new(InFlightRegistry::new(1)),
        ShutdownSignal::new(),
        Arc::new(Collect::default()),
    );
    let ids = TriggerIdAllocator::new();
    let source = SourceId::from("yard");
    let outcomes: Vec<EventOutcome> = (0..5)
        .map(|_| cascade.run(trigger_for(&ids, &source)).unwrap())
        .collect();

    let workers = 6;
    let barrier = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for w in 0..workers {
        let dispatcher = Arc::clone(&dispatcher);
        let outcomes = outcomes.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(w as u64);
            barrier.wait();
            let mut duplicates = 0;
            for _ in 0..outcomes.len() * 2 {
                let outcome = &outcomes[rng.gen_range(0..outcomes.len())];
                duplicates += dispatcher.dispatch(outcome).duplicates();
            }
            duplicates
        }));
    }
    let duplicates: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let delivered = sink.delivered.lock().unwrap();
    let unique: HashSet<_> = delivered.iter().map(|p| p.trigger_id).collect();
    assert_eq!(unique.len(), delivered.len(), "a trigger was delivered twice");
    assert_eq!(delivered.len() + duplicates, workers * outcomes.len() * 2);
}
