use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{Detection, DetectionResult, ObjectClass};

/// CPU backend: contrast blob heuristic.
///
/// Pixels that deviate from the frame mean by more than `deviation` form a
/// foreground mask; if the mask covers at least `min_area` of the frame its
/// bounding box is reported as one `Unknown` object. Confidence grows with
/// how densely the mask fills its bounding box.
pub struct CpuBackend {
    deviation: u8,
    min_area: f32,
}

impl CpuBackend {
    pub fn new(deviation: u8, min_area: f32) -> Self {
        Self {
            deviation,
            min_area,
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(48, 0.02)
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, luma: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || luma.len() != w * h {
            return Err(anyhow!(
                "cpu backend expected {}x{} luma plane, received {} bytes",
                width,
                height,
                luma.len()
            ));
        }

        let mean = luma.iter().map(|&p| p as u64).sum::<u64>() / luma.len() as u64;
        let deviation = self.deviation as i64;

        let mut count = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0usize, 0usize);
        for (i, &p) in luma.iter().enumerate() {
            if (p as i64 - mean as i64).abs() > deviation {
                let (x, y) = (i % w, i / w);
                count += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        let area = count as f32 / luma.len() as f32;
        if count == 0 || area < self.min_area {
            return Ok(DetectionResult::default());
        }

        let box_w = max_x - min_x + 1;
        let box_h = max_y - min_y + 1;
        let density = count as f32 / (box_w * box_h) as f32;
        let confidence = (0.5 + 0.5 * density).min(1.0);

        Ok(DetectionResult {
            detections: vec![Detection {
                x: min_x as f32 / w as f32,
                y: min_y as f32 / h as f32,
                w: box_w as f32 / w as f32,
                h: box_h as f32 / h as f32,
                confidence,
                class: ObjectClass::Unknown,
            }],
            confidence,
        })
    }
}
