use anyhow::Result;

use crate::detect::result::DetectionResult;

/// What a backend can answer about a frame.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// Localized objects with bounding boxes.
    ObjectDetection,
    /// Whole-frame "is something there" scoring.
    Classification,
}

/// Local detector consulted by `DetectorStage`.
///
/// `detect` receives the luma plane of a trigger's reference frame. The
/// plane is borrowed for the call only; backends keep no copy of it.
pub trait DetectorBackend: Send {
    fn name(&self) -> &'static str;

    fn supports(&self, capability: DetectionCapability) -> bool;

    fn detect(&mut self, luma: &[u8], width: u32, height: u32) -> Result<DetectionResult>;
}
