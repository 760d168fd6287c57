use std::sync::Arc;
use std::time::Instant;

use crate::cascade::{ConfirmationStage, StageError, StageResult};
use crate::detect::{BackendRegistry, DetectionCapability, ObjectClass};
use crate::frame::Frame;

/// Confirmation stage backed by a local detector.
///
/// The backend sees the luma plane of the reference frame. A frame that
/// cannot be decoded fails permanently; a backend error is treated as
/// transient since local inference is usually just overloaded.
pub struct DetectorStage {
    name: String,
    registry: Arc<BackendRegistry>,
    backend: Option<String>,
    capability: DetectionCapability,
    min_confidence: f32,
    classes: Vec<ObjectClass>,
}

impl DetectorStage {
    pub fn new(name: impl Into<String>, registry: Arc<BackendRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            backend: None,
            capability: DetectionCapability::ObjectDetection,
            min_confidence: 0.5,
            classes: Vec::new(),
        }
    }

    /// Pin a backend by name instead of selecting by capability.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_capability(mut self, capability: DetectionCapability) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_classes(mut self, classes: Vec<ObjectClass>) -> Self {
        self.classes = classes;
        self
    }
}

impl ConfirmationStage for DetectorStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn confirm(&self, frame: &Frame, deadline: Instant) -> StageResult {
        let luma = match frame.luma() {
            Ok(luma) => luma,
            Err(e) => return StageResult::Failed(StageError::permanent(e.to_string())),
        };
        let result = match self.registry.detect(
            self.backend.as_deref(),
            self.capability,
            &luma,
            frame.width(),
            frame.height(),
        ) {
            Ok(result) => result,
            Err(e) => return StageResult::Failed(StageError::transient(format!("{:#}", e))),
        };
        if Instant::now() > deadline {
            return StageResult::TimedOut;
        }

        let confirmed = result.confirmed(self.min_confidence, &self.classes);
        if confirmed.is_empty() {
            StageResult::Rejected(format!(
                "no detection at or above {:.2} (best {:.2})",
                self.min_confidence, result.confidence
            ))
        } else {
            StageResult::Confirmed(confirmed)
        }
    }
}
