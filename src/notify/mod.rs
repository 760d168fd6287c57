//! Delivery of confirmed events to downstream sinks.
//!
//! Delivery is at-least-once per sink with the trigger id as idempotency key.
//! A bounded recently-delivered set, shared by all dispatcher workers,
//! suppresses duplicate outcomes so a sink sees each trigger at most once
//! while the entry is retained.

mod dedup;
pub mod mqtt;
mod sink;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::cascade::RetryPolicy;
use crate::deadline::{self, Invocation};
use crate::outcome::{EventOutcome, Verdict};
use crate::shutdown::ShutdownSignal;
use crate::TriggerId;

pub use dedup::{Claim, RecentlyDelivered};
pub use mqtt::{MqttSink, MqttSinkConfig};
pub use sink::{DeliveryError, LogSink, NotificationPayload, NotificationSink};

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Budget for a single `deliver` call.
    pub deadline: Duration,
    pub dedup_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deadline: Duration::from_secs(2),
            dedup_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    Delivered { attempts: u32 },
    /// Already delivered, or being delivered by another worker.
    Duplicate,
    Failed { attempts: u32, error: DeliveryError },
}

#[derive(Clone, Debug)]
pub struct DispatchReport {
    pub trigger_id: TriggerId,
    pub verdict: Verdict,
    /// Empty for outcomes that are recorded but not delivered.
    pub sinks: Vec<(String, SinkStatus)>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.count(|s| matches!(s, SinkStatus::Delivered { .. }))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|s| matches!(s, SinkStatus::Duplicate))
    }

    pub fn failures(&self) -> usize {
        self.count(|s| matches!(s, SinkStatus::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&SinkStatus) -> bool) -> usize {
        self.sinks.iter().filter(|(_, s)| pred(s)).count()
    }
}

pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    config: DispatcherConfig,
    recent: Mutex<RecentlyDelivered>,
    abort: ShutdownSignal,
}

impl NotificationDispatcher {
    /// `abort` cancels in-progress deliveries and backoff waits. It is kept
    /// separate from the cascade shutdown so outcomes can still be flushed
    /// during the grace period.
    pub fn new(
        sinks: Vec<Arc<dyn NotificationSink>>,
        config: DispatcherConfig,
        abort: ShutdownSignal,
    ) -> Self {
        let recent = Mutex::new(RecentlyDelivered::new(config.dedup_capacity));
        Self {
            sinks,
            config,
            recent,
            abort,
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    fn recent(&self) -> MutexGuard<'_, RecentlyDelivered> {
        match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver a terminal outcome. Non-confirmed outcomes are only recorded.
    pub fn dispatch(&self, outcome: &EventOutcome) -> DispatchReport {
        let mut report = DispatchReport {
            trigger_id: outcome.trigger_id,
            verdict: outcome.verdict,
            sinks: Vec::new(),
        };
        if outcome.verdict != Verdict::Notified {
            log::debug!(
                "dispatch: trigger={} verdict={:?} recorded, not delivered",
                outcome.trigger_id,
                outcome.verdict
            );
            return report;
        }

        let payload = Arc::new(NotificationPayload {
            trigger_id: outcome.trigger_id,
            source: outcome.source.clone(),
            detections: outcome.detections.clone(),
            timestamp: outcome.triggered_at,
            frame_digest: outcome.frame_digest.clone(),
        });

        for sink in &self.sinks {
            let name = sink.name().to_string();
            let claim = self.recent().try_claim(&name, outcome.trigger_id);
            let status = match claim {
                Claim::Claimed => {
                    let status = self.deliver_with_retry(sink, &payload);
                    let mut recent = self.recent();
                    if matches!(status, SinkStatus::Delivered { .. }) {
                        recent.complete(&name, outcome.trigger_id);
                    } else {
                        recent.abandon(&name, outcome.trigger_id);
                    }
                    status
                }
                Claim::InProgress | Claim::Delivered => {
                    log::debug!(
                        "dispatch: trigger={} sink={} duplicate suppressed",
                        outcome.trigger_id,
                        name
                    );
                    SinkStatus::Duplicate
                }
            };
            if let SinkStatus::Failed { attempts, error } = &status {
                log::error!(
                    "dispatch: trigger={} sink={} gave up after {} attempts: {}",
                    outcome.trigger_id,
                    name,
                    attempts,
                    error
                );
            }
            report.sinks.push((name, status));
        }
        report
    }

    fn deliver_with_retry(
        &self,
        sink: &Arc<dyn NotificationSink>,
        payload: &Arc<NotificationPayload>,
    ) -> SinkStatus {
        let name = sink.name().to_string();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call_sink = Arc::clone(sink);
            let call_payload = Arc::clone(payload);
            let result = match deadline::run_with_deadline(
                &name,
                self.config.deadline,
                &self.abort,
                move || call_sink.deliver(&call_payload),
            ) {
                Invocation::Completed(result) => result,
                Invocation::DeadlineExceeded => Err(DeliveryError::Retryable(format!(
                    "no answer within {:?}",
                    self.config.deadline
                ))),
                Invocation::Cancelled => {
                    return SinkStatus::Failed {
                        attempts: attempt,
                        error: DeliveryError::Permanent("dispatcher aborted".into()),
                    }
                }
                Invocation::Crashed(msg) => Err(DeliveryError::Permanent(msg)),
            };

            match result {
                Ok(()) => return SinkStatus::Delivered { attempts: attempt },
                Err(error) if error.is_retryable() && self.config.retry.allows_another(attempt) => {
                    let backoff = self.config.retry.backoff(attempt);
                    log::warn!(
                        "dispatch: trigger={} sink={} attempt {} failed ({}), retrying in {:?}",
                        payload.trigger_id,
                        name,
                        attempt,
                        error,
                        backoff
                    );
                    if self.abort.wait_timeout(backoff) {
                        return SinkStatus::Failed {
                            attempts: attempt,
                            error,
                        };
                    }
                }
                Err(error) => {
                    return SinkStatus::Failed {
                        attempts: attempt,
                        error,
                    }
                }
            }
        }
    }
}
