//! Threshold + cooldown hysteresis turning motion samples into triggers.
//!
//! The debouncer is owned by one ingest worker; state for every source it
//! serves lives in a map keyed by `SourceId` and is never shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::detect::MotionSample;
use crate::frame::Frame;
use crate::{SourceId, Timestamp, Trigger, TriggerId, TriggerIdAllocator};

#[derive(Clone, Debug)]
pub struct DebounceConfig {
    /// A sample must strictly exceed this magnitude to trigger.
    pub threshold: f32,
    /// Minimum spacing between two triggers of one source.
    pub cooldown: Duration,
    pub max_in_flight_per_source: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            cooldown: Duration::from_secs(5),
            max_in_flight_per_source: 1,
        }
    }
}

/// What the debouncer did with one sample.
#[derive(Debug)]
pub enum DebounceDecision {
    Trigger(Trigger),
    BelowThreshold,
    Cooldown { remaining: Duration },
    /// The source already has the maximum number of non-terminal triggers.
    InFlight,
}

#[derive(Debug, Default)]
struct SourceState {
    last_trigger_at: Option<Timestamp>,
    last_magnitude: f32,
    in_flight: Vec<TriggerId>,
}

pub struct EventDebouncer {
    config: DebounceConfig,
    ids: TriggerIdAllocator,
    sources: HashMap<SourceId, SourceState>,
}

impl EventDebouncer {
    pub fn new(config: DebounceConfig, ids: TriggerIdAllocator) -> Self {
        Self {
            config,
            ids,
            sources: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Offer one sample along with the frame that produced it.
    pub fn offer(&mut self, sample: &MotionSample, frame: Arc<Frame>) -> DebounceDecision {
        let state = self.sources.entry(sample.source.clone()).or_default();
        state.last_magnitude = sample.magnitude;

        if sample.magnitude <= self.config.threshold {
            return DebounceDecision::BelowThreshold;
        }

        if let Some(last) = state.last_trigger_at {
            let elapsed = sample.at.saturating_duration_since(last);
            // A sample older than the last trigger counts as zero elapsed.
            if elapsed < self.config.cooldown || sample.at < last {
                return DebounceDecision::Cooldown {
                    remaining: self.config.cooldown.saturating_sub(elapsed),
                };
            }
        }

        if state.in_flight.len() >= self.config.max_in_flight_per_source.max(1) {
            return DebounceDecision::InFlight;
        }

        let id = self.ids.next_id();
        state.last_trigger_at = Some(sample.at);
        state.in_flight.push(id);
        log::debug!(
            "debounce: trigger source={} id={} magnitude={:.2}",
            sample.source,
            id,
            sample.magnitude
        );
        DebounceDecision::Trigger(Trigger {
            id,
            source: sample.source.clone(),
            created_at: sample.at,
            magnitude: sample.magnitude,
            frame,
        })
    }

    /// Mark a trigger as terminal so the source may be admitted again.
    /// Returns false if the trigger was not in flight.
    pub fn release(&mut self, source: &SourceId, id: TriggerId) -> bool {
        let Some(state) = self.sources.get_mut(source) else {
            return false;
        };
        match state.in_flight.iter().position(|x| *x == id) {
            Some(pos) => {
                state.in_flight.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self, source: &SourceId) -> usize {
        self.sources.get(source).map_or(0, |s| s.in_flight.len())
    }

    pub fn last_magnitude(&self, source: &SourceId) -> Option<f32> {
        self.sources.get(source).map(|s| s.last_magnitude)
    }
}
