//! Terminal records and the observers that receive them.
//!
//! Every trigger produces exactly one `EventOutcome`. Observers see all of
//! them, whatever the verdict; only `Verdict::Notified` outcomes ever reach
//! the notification sinks.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cascade::{CascadeState, StageResult};
use crate::detect::Detection;
use crate::{SourceId, Timestamp, TriggerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Notified,
    Discarded,
    Errored,
}

impl Verdict {
    /// Map a terminal cascade state to the verdict it produces.
    pub fn for_state(state: CascadeState) -> Self {
        match state {
            CascadeState::Confirmed => Verdict::Notified,
            CascadeState::Rejected => Verdict::Discarded,
            _ => Verdict::Errored,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageAttempt {
    pub stage_index: usize,
    pub stage: String,
    /// 1-based attempt number within the stage.
    pub attempt: u32,
    pub result: StageResult,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventOutcome {
    pub trigger_id: TriggerId,
    pub source: SourceId,
    pub triggered_at: Timestamp,
    pub state: CascadeState,
    pub verdict: Verdict,
    /// Rejection or failure reason, when there is one.
    pub reason: Option<String>,
    pub attempts: Vec<StageAttempt>,
    /// Detections reported by the final confirming stage.
    pub detections: Vec<Detection>,
    /// SHA-256 of the reference frame. Outcome records never carry pixels.
    pub frame_digest: String,
    pub elapsed_ms: u64,
}

impl EventOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.verdict == Verdict::Notified
    }

    /// Number of times stage `index` was invoked.
    pub fn invocations_of(&self, index: usize) -> usize {
        self.attempts.iter().filter(|a| a.stage_index == index).count()
    }
}

/// Receives every terminal outcome.
pub trait OutcomeObserver: Send + Sync {
    fn observe(&self, outcome: &EventOutcome);
}

/// Writes one log line per outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl OutcomeObserver for LogObserver {
    fn observe(&self, outcome: &EventOutcome) {
        let level = match outcome.verdict {
            Verdict::Notified => log::Level::Info,
            Verdict::Discarded => log::Level::Debug,
            Verdict::Errored => log::Level::Warn,
        };
        log::log!(
            level,
            "outcome trigger={} source={} state={:?} attempts={} detections={} elapsed_ms={}{}",
            outcome.trigger_id,
            outcome.source,
            outcome.state,
            outcome.attempts.len(),
            outcome.detections.len(),
            outcome.elapsed_ms,
            outcome
                .reason
                .as_deref()
                .map(|r| format!(" reason={:?}", r))
                .unwrap_or_default()
        );
    }
}

/// Appends each outcome as one JSON object per line.
pub struct JsonLinesObserver {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesObserver {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    /// Open (or create) an append-only outcome log.
    pub fn append_to(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open outcome log {}", path.display()))?;
        Ok(Self::new(file))
    }

    fn write_record(&self, outcome: &EventOutcome) -> Result<()> {
        let line = serde_json::to_string(outcome)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("outcome log lock poisoned"))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

impl OutcomeObserver for JsonLinesObserver {
    fn observe(&self, outcome: &EventOutcome) {
        if let Err(e) = self.write_record(outcome) {
            log::warn!("outcome log write failed for {}: {:#}", outcome.trigger_id, e);
        }
    }
}

/// Forwards each outcome to several observers in order.
#[derive(Clone, Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn OutcomeObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn OutcomeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl OutcomeObserver for FanoutObserver {
    fn observe(&self, outcome: &EventOutcome) {
        for observer in &self.observers {
            observer.observe(outcome);
        }
    }
}
