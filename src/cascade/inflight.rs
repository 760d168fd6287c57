use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::{SourceId, Trigger, TriggerId};

/// Wiring bugs that would break the single-flight guarantee.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("duplicate trigger {id} for source {source_id}")]
    DuplicateTrigger { source_id: SourceId, id: TriggerId },
    #[error("trigger {id} for source {source_id} submitted while {active} is still in flight")]
    SourceBusy {
        source_id: SourceId,
        id: TriggerId,
        active: TriggerId,
    },
    #[error("stage index {index} out of range ({stages} stages configured)")]
    UnknownStage { index: usize, stages: usize },
}

#[derive(Debug, Default)]
struct Slots {
    active: Vec<TriggerId>,
    /// Highest trigger id ever admitted for the source.
    watermark: Option<TriggerId>,
}

/// Tracks non-terminal triggers per source.
///
/// Admission hands back a guard; the slot is freed when the guard drops,
/// which covers every exit path of a cascade run.
#[derive(Debug)]
pub struct InFlightRegistry {
    max_per_source: usize,
    slots: Mutex<HashMap<SourceId, Slots>>,
}

impl InFlightRegistry {
    pub fn new(max_per_source: usize) -> Self {
        Self {
            max_per_source: max_per_source.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SourceId, Slots>> {
        // The map holds plain ids; a panic elsewhere cannot leave it torn.
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn admit(&self, trigger: &Trigger) -> Result<InFlightGuard<'_>, InvariantViolation> {
        let mut slots = self.lock();
        let entry = slots.entry(trigger.source.clone()).or_default();

        if entry.active.contains(&trigger.id)
            || entry.watermark.map_or(false, |w| trigger.id <= w)
        {
            return Err(InvariantViolation::DuplicateTrigger {
                source_id: trigger.source.clone(),
                id: trigger.id,
            });
        }
        if entry.active.len() >= self.max_per_source {
            return Err(InvariantViolation::SourceBusy {
                source_id: trigger.source.clone(),
                id: trigger.id,
                active: entry.active[0],
            });
        }

        entry.active.push(trigger.id);
        entry.watermark = Some(trigger.id);
        Ok(InFlightGuard {
            registry: self,
            source: trigger.source.clone(),
            id: trigger.id,
        })
    }

    pub fn active(&self, source: &SourceId) -> Vec<TriggerId> {
        self.lock()
            .get(source)
            .map(|s| s.active.clone())
            .unwrap_or_default()
    }

    pub fn total_active(&self) -> usize {
        self.lock().values().map(|s| s.active.len()).sum()
    }

    fn release(&self, source: &SourceId, id: TriggerId) {
        if let Some(entry) = self.lock().get_mut(source) {
            entry.active.retain(|active| *active != id);
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard<'a> {
    registry: &'a InFlightRegistry,
    source: SourceId,
    id: TriggerId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.source, self.id);
    }
}
