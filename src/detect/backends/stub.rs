use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::DetectionResult;

/// Stub backend for testing and demos. Replays scripted results in order,
/// then reports nothing.
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<DetectionResult>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: impl IntoIterator<Item = DetectionResult>) -> Self {
        Self {
            script: results.into_iter().collect(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(
            capability,
            DetectionCapability::ObjectDetection | DetectionCapability::Classification
        )
    }

    fn detect(&mut self, _luma: &[u8], _width: u32, _height: u32) -> Result<DetectionResult> {
        self.calls += 1;
        Ok(self.script.pop_front().unwrap_or_default())
    }
}
