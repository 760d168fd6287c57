//! Change detection.
//!
//! `ChangeDetector` turns a frame stream into motion samples by comparing
//! each frame against a per-source smoothed baseline.
//!
//! - The first frame of a source seeds its baseline and yields no sample.
//! - A malformed frame is reported as an input error and leaves the baseline untouched.
//! - The baseline is replaced, never shared: each update builds a new buffer.
//!
//! The computation is pure integer/float arithmetic over in-memory buffers, so
//! identical (baseline, frame) pairs always yield identical magnitudes.

use std::collections::HashMap;

use crate::frame::{Frame, FrameError};
use crate::{SourceId, Timestamp};

/// Change magnitude between a frame and the source baseline.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionSample {
    pub source: SourceId,
    /// Percentage (0..=100) of pixels that differ from the baseline by more
    /// than the noise floor.
    pub magnitude: f32,
    /// Capture time of the newer frame.
    pub at: Timestamp,
}

#[derive(Clone, Debug)]
pub struct ChangeDetectorConfig {
    /// Weight of the new frame when updating the baseline, in (0, 1].
    /// 1.0 replaces the baseline with the latest frame.
    pub smoothing: f32,
    /// Per-pixel luma difference treated as sensor noise.
    pub noise_floor: u8,
}

impl Default for ChangeDetectorConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.5,
            noise_floor: 12,
        }
    }
}

struct Baseline {
    width: u32,
    height: u32,
    luma: Vec<f32>,
}

/// Per-source baselines keyed by source id.
///
/// One detector is owned by exactly one processing context; it is `Send` but
/// deliberately not shared.
pub struct ChangeDetector {
    config: ChangeDetectorConfig,
    baselines: HashMap<SourceId, Baseline>,
}

impl ChangeDetector {
    pub fn new(config: ChangeDetectorConfig) -> Self {
        Self {
            config,
            baselines: HashMap::new(),
        }
    }

    pub fn has_baseline(&self, source: &SourceId) -> bool {
        self.baselines.contains_key(source)
    }

    /// Drop the baseline for a source; its next frame re-seeds.
    pub fn reset(&mut self, source: &SourceId) {
        self.baselines.remove(source);
    }

    /// Compare `frame` to its source baseline and update the baseline.
    ///
    /// Returns `Ok(None)` when the frame seeds (or re-seeds after a resolution
    /// change) the baseline.
    pub fn observe(&mut self, frame: &Frame) -> Result<Option<MotionSample>, FrameError> {
        let luma = frame.luma()?;

        let Some(baseline) = self.baselines.get(frame.source()) else {
            self.seed(frame, &luma);
            return Ok(None);
        };

        if baseline.width != frame.width() || baseline.height != frame.height() {
            log::debug!(
                "change detector: {} resolution changed {}x{} -> {}x{}, reseeding",
                frame.source(),
                baseline.width,
                baseline.height,
                frame.width(),
                frame.height()
            );
            self.seed(frame, &luma);
            return Ok(None);
        }

        let noise_floor = self.config.noise_floor as f32;
        let changed = baseline
            .luma
            .iter()
            .zip(luma.iter())
            .filter(|(base, px)| (**px as f32 - **base).abs() > noise_floor)
            .count();
        let magnitude = changed as f32 * 100.0 / luma.len() as f32;

        let alpha = self.config.smoothing;
        let updated: Vec<f32> = baseline
            .luma
            .iter()
            .zip(luma.iter())
            .map(|(base, &px)| base + alpha * (px as f32 - base))
            .collect();
        self.baselines.insert(
            frame.source().clone(),
            Baseline {
                width: frame.width(),
                height: frame.height(),
                luma: updated,
            },
        );

        Ok(Some(MotionSample {
            source: frame.source().clone(),
            magnitude,
            at: frame.captured_at(),
        }))
    }

    fn seed(&mut self, frame: &Frame, luma: &[u8]) {
        self.baselines.insert(
            frame.source().clone(),
            Baseline {
                width: frame.width(),
                height: frame.height(),
                luma: luma.iter().map(|&px| px as f32).collect(),
            },
        );
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(ChangeDetectorConfig::default())
    }
}
