//! Runtime wiring: sources, detectors, debouncers, cascades, dispatchers.
//!
//! ```text
//!  per source                                         shared
//! +--------------------------+   triggers   +---------------+   outcomes   +-------------------+
//! | ingest thread            | -----------> | cascade thread| -----------> | dispatcher workers|
//! | FrameSource              | <----------- |               |              | (N threads)       |
//! | ChangeDetector           |   releases   +---------------+              +-------------------+
//! | EventDebouncer           |
//! +--------------------------+
//! ```
//!
//! The ingest thread is the only writer of its source's baseline and
//! debounce state. Releases flow back once a trigger's outcome exists, which
//! is what re-admits the source.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::cascade::{CascadeStage, ConfirmationCascade, InFlightRegistry, InvariantViolation};
use crate::debounce::{DebounceConfig, DebounceDecision, EventDebouncer};
use crate::detect::{ChangeDetector, ChangeDetectorConfig};
use crate::frame::{FrameRead, FrameSource};
use crate::notify::{DispatcherConfig, NotificationDispatcher, NotificationSink};
use crate::outcome::{EventOutcome, OutcomeObserver, Verdict};
use crate::shutdown::ShutdownSignal;
use crate::{SourceId, Trigger, TriggerId, TriggerIdAllocator};

const JOIN_POLL: Duration = Duration::from_millis(10);
const CHANNEL_POLL: Duration = Duration::from_millis(50);
const ABORT_SLACK: Duration = Duration::from_millis(250);
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub detector: ChangeDetectorConfig,
    pub debounce: DebounceConfig,
    pub dispatcher: DispatcherConfig,
    pub dispatch_workers: usize,
    /// Timeout passed to `FrameSource::next_frame`.
    pub read_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detector: ChangeDetectorConfig::default(),
            debounce: DebounceConfig::default(),
            dispatcher: DispatcherConfig::default(),
            dispatch_workers: 2,
            read_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct PipelineStats {
    frames: AtomicU64,
    input_errors: AtomicU64,
    source_errors: AtomicU64,
    triggers: AtomicU64,
    notified: AtomicU64,
    discarded: AtomicU64,
    errored: AtomicU64,
    invariant_violations: AtomicU64,
    dispatched: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    duplicates: AtomicU64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: &EventOutcome) {
        match outcome.verdict {
            Verdict::Notified => Self::bump(&self.notified),
            Verdict::Discarded => Self::bump(&self.discarded),
            Verdict::Errored => Self::bump(&self.errored),
        }
    }

    fn snapshot(&self, detached_threads: usize) -> ShutdownReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let outcomes = load(&self.notified) + load(&self.discarded) + load(&self.errored);
        ShutdownReport {
            frames: load(&self.frames),
            input_errors: load(&self.input_errors),
            source_errors: load(&self.source_errors),
            triggers: load(&self.triggers),
            notified: load(&self.notified),
            discarded: load(&self.discarded),
            errored: load(&self.errored),
            invariant_violations: load(&self.invariant_violations),
            deliveries: load(&self.deliveries),
            delivery_failures: load(&self.delivery_failures),
            duplicates_suppressed: load(&self.duplicates),
            undispatched: outcomes.saturating_sub(load(&self.dispatched)),
            detached_threads,
        }
    }
}

/// Counters collected over a pipeline's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub frames: u64,
    pub input_errors: u64,
    pub source_errors: u64,
    pub triggers: u64,
    pub notified: u64,
    pub discarded: u64,
    pub errored: u64,
    pub invariant_violations: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub duplicates_suppressed: u64,
    /// Outcomes produced but never handed to the dispatcher.
    pub undispatched: u64,
    /// Threads still running when the grace period ended.
    pub detached_threads: usize,
}

impl ShutdownReport {
    pub fn outcomes(&self) -> u64 {
        self.notified + self.discarded + self.errored
    }

    pub fn is_clean(&self) -> bool {
        self.detached_threads == 0 && self.undispatched == 0
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Spawn all workers. Sources must have distinct ids.
    pub fn start(
        settings: PipelineSettings,
        sources: Vec<Box<dyn FrameSource>>,
        stages: Vec<CascadeStage>,
        sinks: Vec<Arc<dyn NotificationSink>>,
        observer: Arc<dyn OutcomeObserver>,
    ) -> Result<PipelineHandle> {
        let ids: Vec<SourceId> = sources.iter().map(|s| s.source_id().clone()).collect();
        check_unique_sources(&ids)?;

        let shutdown = ShutdownSignal::new();
        let dispatch_abort = ShutdownSignal::new();
        let stats = Arc::new(PipelineStats::default());
        let trigger_ids = TriggerIdAllocator::new();
        let registry = Arc::new(InFlightRegistry::new(
            settings.debounce.max_in_flight_per_source,
        ));
        let cascade = Arc::new(ConfirmationCascade::new(
            stages,
            registry,
            shutdown.clone(),
            observer,
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            sinks,
            settings.dispatcher.clone(),
            dispatch_abort.clone(),
        ));

        let (outcome_tx, outcome_rx) = mpsc::channel::<EventOutcome>();
        let outcome_rx = Arc::new(Mutex::new(outcome_rx));

        let mut handle = PipelineHandle {
            shutdown: shutdown.clone(),
            dispatch_abort,
            sources: Vec::new(),
            workers: Vec::new(),
            stats: Arc::clone(&stats),
        };

        for i in 0..settings.dispatch_workers.max(1) {
            let rx = Arc::clone(&outcome_rx);
            let dispatcher = Arc::clone(&dispatcher);
            let stats = Arc::clone(&stats);
            let worker = thread::Builder::new()
                .name(format!("dispatch-{}", i))
                .spawn(move || dispatch_loop(rx, dispatcher, stats))
                .context("spawn dispatcher worker")?;
            handle.workers.push(worker);
        }

        for source in sources {
            let id = source.source_id().clone();
            let (trigger_tx, trigger_rx) = mpsc::channel::<Trigger>();
            let (release_tx, release_rx) = mpsc::channel::<TriggerId>();

            let ingest = IngestWorker {
                source,
                detector: ChangeDetector::new(settings.detector.clone()),
                debouncer: EventDebouncer::new(settings.debounce.clone(), trigger_ids.clone()),
                read_timeout: settings.read_timeout,
                triggers: trigger_tx,
                releases: release_rx,
                shutdown: shutdown.clone(),
                stats: Arc::clone(&stats),
            };
            let ingest = thread::Builder::new()
                .name(format!("ingest-{}", id))
                .spawn(move || ingest.run())
                .with_context(|| format!("spawn ingest thread for {}", id))?;

            let cascade_worker = CascadeWorker {
                cascade: Arc::clone(&cascade),
                triggers: trigger_rx,
                releases: release_tx,
                outcomes: outcome_tx.clone(),
                shutdown: shutdown.clone(),
                stats: Arc::clone(&stats),
            };
            let cascade = thread::Builder::new()
                .name(format!("cascade-{}", id))
                .spawn(move || cascade_worker.run())
                .with_context(|| format!("spawn cascade thread for {}", id))?;

            log::info!("pipeline: source {} started", id);
            handle.sources.push(SourceThreads { id, ingest, cascade });
        }
        // Workers exit once every cascade thread has dropped its sender.
        drop(outcome_tx);

        Ok(handle)
    }
}

struct SourceThreads {
    id: SourceId,
    ingest: JoinHandle<()>,
    cascade: JoinHandle<()>,
}

pub struct PipelineHandle {
    shutdown: ShutdownSignal,
    dispatch_abort: ShutdownSignal,
    sources: Vec<SourceThreads>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Counters so far.
    pub fn report(&self) -> ShutdownReport {
        self.stats.snapshot(0)
    }

    /// Cancel all cascades and flush buffered outcomes within `grace`.
    pub fn shutdown(self, grace: Duration) -> ShutdownReport {
        log::info!("pipeline: shutdown requested (grace {:?})", grace);
        self.shutdown.trigger();
        self.finish(Instant::now() + grace)
    }

    /// Wait for every source to reach end of stream, then let in-flight
    /// triggers and deliveries finish within `grace`.
    pub fn wait(self, grace: Duration) -> ShutdownReport {
        while !self.sources.iter().all(|s| s.ingest.is_finished()) {
            if self.shutdown.wait_timeout(CHANNEL_POLL) {
                break;
            }
        }
        self.finish(Instant::now() + grace)
    }

    fn finish(self, deadline: Instant) -> ShutdownReport {
        let PipelineHandle {
            shutdown,
            dispatch_abort,
            sources,
            workers,
            stats,
        } = self;

        let mut source_handles = Vec::new();
        for s in sources {
            source_handles.push((format!("ingest-{}", s.id), s.ingest));
            source_handles.push((format!("cascade-{}", s.id), s.cascade));
        }
        if !wait_finished(&source_handles, deadline) {
            log::warn!("pipeline: grace period over with cascades still running, cancelling");
            shutdown.trigger();
            wait_finished(&source_handles, Instant::now() + ABORT_SLACK);
        }

        let mut worker_handles: Vec<(String, JoinHandle<()>)> = workers
            .into_iter()
            .enumerate()
            .map(|(i, h)| (format!("dispatch-{}", i), h))
            .collect();
        if !wait_finished(&worker_handles, deadline) {
            log::warn!("pipeline: grace period over with deliveries pending, aborting dispatch");
            dispatch_abort.trigger();
            wait_finished(&worker_handles, Instant::now() + ABORT_SLACK);
        }

        source_handles.append(&mut worker_handles);
        let mut detached = 0;
        for (name, handle) in source_handles {
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("pipeline: thread {} panicked", name);
                }
            } else {
                log::warn!("pipeline: detaching thread {} that did not stop in time", name);
                detached += 1;
            }
        }

        let report = stats.snapshot(detached);
        log::info!(
            "pipeline: stopped triggers={} notified={} discarded={} errored={} deliveries={} undispatched={} detached={}",
            report.triggers,
            report.notified,
            report.discarded,
            report.errored,
            report.deliveries,
            report.undispatched,
            report.detached_threads
        );
        report
    }
}

fn wait_finished(handles: &[(String, JoinHandle<()>)], deadline: Instant) -> bool {
    loop {
        if handles.iter().all(|(_, h)| h.is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
}

struct IngestWorker {
    source: Box<dyn FrameSource>,
    detector: ChangeDetector,
    debouncer: EventDebouncer,
    read_timeout: Duration,
    triggers: Sender<Trigger>,
    releases: Receiver<TriggerId>,
    shutdown: ShutdownSignal,
    stats: Arc<PipelineStats>,
}

impl IngestWorker {
    fn run(mut self) {
        let id = self.source.source_id().clone();
        while !self.shutdown.is_triggered() {
            self.drain_releases(&id);

            let frame = match self.source.next_frame(self.read_timeout) {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::Idle) => continue,
                Ok(FrameRead::EndOfStream) => {
                    log::info!("ingest: source {} reached end of stream", id);
                    break;
                }
                Err(e) => {
                    PipelineStats::bump(&self.stats.source_errors);
                    log::warn!("ingest: source {} read failed: {:#}", id, e);
                    // The next good frame must not be compared against a stale scene.
                    self.detector.reset(&id);
                    if self.shutdown.wait_timeout(SOURCE_RETRY_DELAY) {
                        break;
                    }
                    continue;
                }
            };
            PipelineStats::bump(&self.stats.frames);

            let sample = match self.detector.observe(&frame) {
                Ok(Some(sample)) => sample,
                Ok(None) => continue,
                Err(e) => {
                    PipelineStats::bump(&self.stats.input_errors);
                    log::warn!("ingest: source {} dropped malformed frame: {}", id, e);
                    continue;
                }
            };

            match self.debouncer.offer(&sample, Arc::new(frame)) {
                DebounceDecision::Trigger(trigger) => {
                    PipelineStats::bump(&self.stats.triggers);
                    if self.triggers.send(trigger).is_err() {
                        log::error!("ingest: cascade worker for {} is gone", id);
                        break;
                    }
                }
                DebounceDecision::Cooldown { .. }
                | DebounceDecision::InFlight
                | DebounceDecision::BelowThreshold => {}
            }
        }
        log::debug!("ingest: source {} stopped", id);
    }

    fn drain_releases(&mut self, id: &SourceId) {
        loop {
            match self.releases.try_recv() {
                Ok(trigger) => {
                    self.debouncer.release(id, trigger);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }
}

struct CascadeWorker {
    cascade: Arc<ConfirmationCascade>,
    triggers: Receiver<Trigger>,
    releases: Sender<TriggerId>,
    outcomes: Sender<EventOutcome>,
    shutdown: ShutdownSignal,
    stats: Arc<PipelineStats>,
}

impl CascadeWorker {
    /// Runs until the ingest side hangs up. After shutdown every trigger
    /// still arriving is abandoned, including one produced by a read that
    /// was already blocked when the signal fired.
    fn run(self) {
        while let Ok(trigger) = self.triggers.recv() {
            let id = trigger.id;
            let outcome = if self.shutdown.is_triggered() {
                Some(self.cascade.abandon(&trigger, "shutdown"))
            } else {
                self.evaluate(trigger)
            };
            // The ingest side may already be gone at shutdown.
            let _ = self.releases.send(id);
            if let Some(outcome) = outcome {
                self.emit(outcome);
            }
        }
    }

    fn evaluate(&self, trigger: Trigger) -> Option<EventOutcome> {
        let fallback = trigger.clone();
        match self.cascade.run(trigger) {
            Ok(outcome) => Some(outcome),
            Err(violation) => {
                PipelineStats::bump(&self.stats.invariant_violations);
                match violation {
                    // The original trigger owns the outcome for this id.
                    InvariantViolation::DuplicateTrigger { .. } => None,
                    other => Some(self.cascade.abandon(&fallback, &other.to_string())),
                }
            }
        }
    }

    fn emit(&self, outcome: EventOutcome) {
        self.stats.record_outcome(&outcome);
        if self.outcomes.send(outcome).is_err() {
            log::error!("cascade: dispatcher channel closed, outcome dropped");
        }
    }
}

fn dispatch_loop(
    rx: Arc<Mutex<Receiver<EventOutcome>>>,
    dispatcher: Arc<NotificationDispatcher>,
    stats: Arc<PipelineStats>,
) {
    loop {
        let next = {
            let guard = match rx.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::error!("dispatch: outcome queue lock poisoned");
                    return;
                }
            };
            guard.recv()
        };
        let Ok(outcome) = next else {
            return;
        };
        let report = dispatcher.dispatch(&outcome);
        PipelineStats::bump(&stats.dispatched);
        PipelineStats::add(&stats.deliveries, report.delivered());
        PipelineStats::add(&stats.delivery_failures, report.failures());
        PipelineStats::add(&stats.duplicates, report.duplicates());
    }
}

/// Fails if any source is configured twice. Exposed for config validation.
pub fn check_unique_sources(ids: &[SourceId]) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(anyhow!("duplicate source id {}", id));
        }
    }
    Ok(())
}
