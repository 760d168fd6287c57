use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::deadline::{self, Invocation};
use crate::detect::Detection;
use crate::outcome::{EventOutcome, OutcomeObserver, StageAttempt, Verdict};
use crate::shutdown::ShutdownSignal;
use crate::Trigger;

use super::inflight::{InFlightRegistry, InvariantViolation};
use super::policy::{StagePolicy, TimeoutPolicy};
use super::stage::{ConfirmationStage, StageError, StageResult};

/// Cascade lifecycle. The last four variants are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeState {
    Pending,
    StageRunning(usize),
    Confirmed,
    Rejected,
    Failed,
    TimedOut,
}

impl CascadeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CascadeState::Pending | CascadeState::StageRunning(_))
    }
}

/// A stage together with the policy the cascade applies to it.
#[derive(Clone)]
pub struct CascadeStage {
    pub stage: Arc<dyn ConfirmationStage>,
    pub policy: StagePolicy,
}

impl CascadeStage {
    pub fn new(stage: Arc<dyn ConfirmationStage>, policy: StagePolicy) -> Self {
        Self { stage, policy }
    }
}

const SHUTDOWN_REASON: &str = "shutdown";

/// How one stage ended after all its attempts.
enum StageEnd {
    Escalate(Vec<Detection>),
    Terminal(CascadeState, Option<String>),
}

/// Runs triggers through an ordered list of stages.
///
/// Stages of one trigger run strictly in order on the calling thread; the
/// cascade may be shared (`Arc`) by the workers of several sources. Each
/// call to `run` produces exactly one `EventOutcome`, which is also handed
/// to the observer before it is returned.
pub struct ConfirmationCascade {
    stages: Vec<CascadeStage>,
    registry: Arc<InFlightRegistry>,
    shutdown: ShutdownSignal,
    observer: Arc<dyn OutcomeObserver>,
}

impl ConfirmationCascade {
    pub fn new(
        stages: Vec<CascadeStage>,
        registry: Arc<InFlightRegistry>,
        shutdown: ShutdownSignal,
        observer: Arc<dyn OutcomeObserver>,
    ) -> Self {
        Self {
            stages,
            registry,
            shutdown,
            observer,
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    pub fn stage_at(&self, index: usize) -> Result<&CascadeStage, InvariantViolation> {
        self.stages.get(index).ok_or(InvariantViolation::UnknownStage {
            index,
            stages: self.stages.len(),
        })
    }

    /// Evaluate one trigger to a terminal outcome.
    ///
    /// Returns `Err` only for wiring bugs (a second trigger for a busy source,
    /// a replayed trigger id); those are logged at error level.
    pub fn run(&self, trigger: Trigger) -> Result<EventOutcome, InvariantViolation> {
        let _slot = self.registry.admit(&trigger).map_err(|violation| {
            log::error!("cascade invariant violated: {}", violation);
            violation
        })?;

        let started = Instant::now();
        let mut state = CascadeState::Pending;
        let mut attempts = Vec::new();
        let mut detections = Vec::new();
        let mut reason = None;
        log::debug!("cascade: trigger={} source={} pending", trigger.id, trigger.source);

        for index in 0..self.stages.len() {
            if self.shutdown.is_triggered() {
                state = CascadeState::Failed;
                reason = Some(SHUTDOWN_REASON.to_string());
                break;
            }
            state = CascadeState::StageRunning(index);
            log::debug!("cascade: trigger={} stage_running={}", trigger.id, index);

            match self.run_stage(index, &trigger, &mut attempts) {
                Ok(StageEnd::Escalate(found)) => detections = found,
                Ok(StageEnd::Terminal(terminal, why)) => {
                    state = terminal;
                    reason = why;
                    break;
                }
                Err(violation) => {
                    log::error!("cascade invariant violated: {}", violation);
                    return Err(violation);
                }
            }
        }
        if !state.is_terminal() {
            // Every stage confirmed, or there were no stages.
            state = CascadeState::Confirmed;
        }
        if state != CascadeState::Confirmed {
            detections.clear();
        }

        let outcome = EventOutcome {
            trigger_id: trigger.id,
            source: trigger.source.clone(),
            triggered_at: trigger.created_at,
            state,
            verdict: Verdict::for_state(state),
            reason,
            attempts,
            detections,
            frame_digest: trigger.frame.fingerprint(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.observer.observe(&outcome);
        Ok(outcome)
    }

    /// Resolve a trigger that will never run (queued at shutdown) to `Failed`.
    pub fn abandon(&self, trigger: &Trigger, reason: &str) -> EventOutcome {
        let outcome = EventOutcome {
            trigger_id: trigger.id,
            source: trigger.source.clone(),
            triggered_at: trigger.created_at,
            state: CascadeState::Failed,
            verdict: Verdict::Errored,
            reason: Some(reason.to_string()),
            attempts: Vec::new(),
            detections: Vec::new(),
            frame_digest: trigger.frame.fingerprint(),
            elapsed_ms: 0,
        };
        self.observer.observe(&outcome);
        outcome
    }

    fn run_stage(
        &self,
        index: usize,
        trigger: &Trigger,
        attempts: &mut Vec<StageAttempt>,
    ) -> Result<StageEnd, InvariantViolation> {
        let cascade_stage = self.stage_at(index)?;
        let policy = &cascade_stage.policy;
        let name = cascade_stage.stage.name().to_string();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let deadline = started + policy.deadline;
            let stage = Arc::clone(&cascade_stage.stage);
            let frame = Arc::clone(&trigger.frame);

            let invocation = deadline::run_until(&name, deadline, &self.shutdown, move || {
                stage.confirm(&frame, deadline)
            });
            let (result, cancelled) = match invocation {
                Invocation::Completed(result) => (result, false),
                Invocation::DeadlineExceeded => (StageResult::TimedOut, false),
                Invocation::Cancelled => (
                    StageResult::Failed(StageError::permanent("cancelled by shutdown")),
                    true,
                ),
                Invocation::Crashed(msg) => (StageResult::Failed(StageError::permanent(msg)), false),
            };
            attempts.push(StageAttempt {
                stage_index: index,
                stage: name.clone(),
                attempt,
                result: result.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            log::debug!(
                "cascade: trigger={} stage={} attempt={} result={}",
                trigger.id,
                name,
                attempt,
                result.label()
            );
            if cancelled {
                return Ok(StageEnd::Terminal(
                    CascadeState::Failed,
                    Some(SHUTDOWN_REASON.to_string()),
                ));
            }

            match result {
                StageResult::Confirmed(found) => return Ok(StageEnd::Escalate(found)),
                StageResult::Rejected(why) => {
                    return Ok(StageEnd::Terminal(CascadeState::Rejected, Some(why)))
                }
                StageResult::TimedOut => match policy.on_timeout {
                    TimeoutPolicy::Reject => {
                        return Ok(StageEnd::Terminal(
                            CascadeState::Rejected,
                            Some(format!("{} exceeded its deadline", name)),
                        ))
                    }
                    TimeoutPolicy::Retry if policy.retry.allows_another(attempt) => {}
                    TimeoutPolicy::Retry => {
                        return Ok(StageEnd::Terminal(
                            CascadeState::TimedOut,
                            Some(format!("{} timed out after {} attempts", name, attempt)),
                        ))
                    }
                },
                StageResult::Failed(err) => {
                    if !(err.is_transient() && policy.retry.allows_another(attempt)) {
                        return Ok(StageEnd::Terminal(CascadeState::Failed, Some(err.message)));
                    }
                }
            }

            let backoff = policy.retry.backoff(attempt);
            log::warn!(
                "cascade: trigger={} stage={} attempt {}/{} did not finish, retrying in {:?}",
                trigger.id,
                name,
                attempt,
                policy.retry.max_attempts,
                backoff
            );
            if self.shutdown.wait_timeout(backoff) {
                return Ok(StageEnd::Terminal(
                    CascadeState::Failed,
                    Some(SHUTDOWN_REASON.to_string()),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::policy::RetryPolicy;
    use crate::detect::ObjectClass;
    use crate::frame::Frame;
    use crate::{SourceId, Timestamp, TriggerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Scripted {
        name: &'static str,
        results: Mutex<Vec<StageResult>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, results: Vec<StageResult>) -> Arc<Self> {
            Arc::new(Self {
                name,
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ConfirmationStage for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn confirm(&self, _frame: &Frame, _deadline: Instant) -> StageResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<EventOutcome>>);

    impl OutcomeObserver for Collect {
        fn observe(&self, outcome: &EventOutcome) {
            self.0.lock().unwrap().push(outcome.clone());
        }
    }

    fn trigger(id: u64) -> Trigger {
        let source = SourceId::from("cam");
        Trigger {
            id: TriggerId::from_raw(id),
            frame: Arc::new(Frame::gray(source.clone(), Timestamp::from_millis(5), 2, 1, vec![1, 2])),
            source,
            created_at: Timestamp::from_millis(5),
            magnitude: 40.0,
        }
    }

    fn person() -> Detection {
        Detection {
            x: 0.0,
            y: 0.0,
            w: 0.5,
            h: 0.5,
            confidence: 0.9,
            class: ObjectClass::Person,
        }
    }

    fn cascade(stages: Vec<CascadeStage>, observer: Arc<Collect>) -> ConfirmationCascade {
        ConfirmationCascade::new(
            stages,
            Arc::new(InFlightRegistry::new(1)),
            ShutdownSignal::new(),
            observer,
        )
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn no_stages_confirms_immediately() {
        let observer = Arc::new(Collect::default());
        let outcome = cascade(Vec::new(), observer.clone()).run(trigger(1)).unwrap();
        assert_eq!(outcome.state, CascadeState::Confirmed);
        assert!(outcome.attempts.is_empty());
        assert_eq!(observer.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn final_stage_detections_are_reported() {
        let s0 = Scripted::new("motion", vec![StageResult::Confirmed(Vec::new())]);
        let s1 = Scripted::new("person", vec![StageResult::Confirmed(vec![person()])]);
        let c = cascade(
            vec![
                CascadeStage::new(s0, StagePolicy::default()),
                CascadeStage::new(s1, StagePolicy::default()),
            ],
            Arc::new(Collect::default()),
        );
        let outcome = c.run(trigger(1)).unwrap();
        assert_eq!(outcome.verdict, Verdict::Notified);
        assert_eq!(outcome.detections, vec![person()]);
    }

    #[test]
    fn transient_failures_retry_then_fail() {
        let s0 = Scripted::new(
            "cloud",
            vec![StageResult::Failed(StageError::transient("503"))],
        );
        let c = cascade(
            vec![CascadeStage::new(
                s0.clone(),
                StagePolicy::retrying(Duration::from_millis(200), quick_retry(3)),
            )],
            Arc::new(Collect::default()),
        );
        let outcome = c.run(trigger(1)).unwrap();
        assert_eq!(outcome.state, CascadeState::Failed);
        assert_eq!(s0.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.reason.as_deref(), Some("503"));
    }

    #[test]
    fn transient_failure_recovers_on_retry() {
        let s0 = Scripted::new(
            "cloud",
            vec![
                StageResult::Failed(StageError::transient("reset")),
                StageResult::Confirmed(vec![person()]),
            ],
        );
        let c = cascade(
            vec![CascadeStage::new(
                s0.clone(),
                StagePolicy::retrying(Duration::from_millis(200), quick_retry(3)),
            )],
            Arc::new(Collect::default()),
        );
        let outcome = c.run(trigger(1)).unwrap();
        assert_eq!(outcome.state, CascadeState::Confirmed);
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[test]
    fn permanent_failure_short_circuits() {
        let s0 = Scripted::new(
            "cloud",
            vec![StageResult::Failed(StageError::permanent("401"))],
        );
        let s1 = Scripted::new("never", vec![StageResult::Confirmed(Vec::new())]);
        let c = cascade(
            vec![
                CascadeStage::new(
                    s0.clone(),
                    StagePolicy::retrying(Duration::from_millis(200), quick_retry(5)),
                ),
                CascadeStage::new(s1.clone(), StagePolicy::default()),
            ],
            Arc::new(Collect::default()),
        );
        let outcome = c.run(trigger(1)).unwrap();
        assert_eq!(outcome.state, CascadeState::Failed);
        assert_eq!(s0.calls.load(Ordering::SeqCst), 1);
        assert_eq!(s1.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fail_closed_timeout_rejects() {
        let s0 = Scripted::new("local", vec![StageResult::TimedOut]);
        let c = cascade(
            vec![CascadeStage::new(s0, StagePolicy::fail_closed(Duration::from_millis(100)))],
            Arc::new(Collect::default()),
        );
        let outcome = c.run(trigger(1)).unwrap();
        assert_eq!(outcome.state, CascadeState::Rejected);
        assert_eq!(outcome.attempts[0].result, StageResult::TimedOut);
    }

    #[test]
    fn replayed_trigger_is_an_error() {
        let c = cascade(Vec::new(), Arc::new(Collect::default()));
        c.run(trigger(7)).unwrap();
        assert_eq!(
            c.run(trigger(7)).unwrap_err(),
            InvariantViolation::DuplicateTrigger {
                source_id: SourceId::from("cam"),
                id: TriggerId::from_raw(7),
            }
        );
    }

    #[test]
    fn unknown_stage_index_is_reported() {
        let c = cascade(Vec::new(), Arc::new(Collect::default()));
        assert!(matches!(
            c.stage_at(3),
            Err(InvariantViolation::UnknownStage { index: 3, stages: 0 })
        ));
    }

    #[test]
    fn abandon_records_failed_outcome() {
        let observer = Arc::new(Collect::default());
        let c = cascade(Vec::new(), observer.clone());
        let outcome = c.abandon(&trigger(2), "shutdown");
        assert_eq!(outcome.state, CascadeState::Failed);
        assert_eq!(outcome.verdict, Verdict::Errored);
        assert_eq!(observer.0.lock().unwrap()[0].trigger_id, TriggerId::from_raw(2));
    }

    #[test]
    fn terminal_states() {
        assert!(!CascadeState::Pending.is_terminal());
        assert!(!CascadeState::StageRunning(0).is_terminal());
        assert!(CascadeState::TimedOut.is_terminal());
    }
}
