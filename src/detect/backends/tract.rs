use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{Detection, DetectionResult, ObjectClass};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

/// Whole-frame person scorer running a local ONNX model with tract.
///
/// The model takes one `1x3xHxW` f32 image in `[0, 1]`; the luma plane is
/// fed to all three channels. The best output score becomes a single
/// full-frame `Person` detection, and the calling stage applies its own
/// confidence floor.
pub struct TractBackend {
    plan: Plan,
    input_width: u32,
    input_height: u32,
}

impl TractBackend {
    pub fn new(model_path: impl AsRef<Path>, input_width: u32, input_height: u32) -> Result<Self> {
        let path = model_path.as_ref();
        let shape = tvec!(1, 3, input_height as usize, input_width as usize);
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("load ONNX model {}", path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))
            .context("declare model input")?
            .into_optimized()
            .context("optimize model")?
            .into_runnable()
            .context("plan model")?;
        log::info!(
            "tract backend: loaded {} ({}x{} input)",
            path.display(),
            input_width,
            input_height
        );
        Ok(Self {
            plan,
            input_width,
            input_height,
        })
    }

    fn luma_tensor(&self, luma: &[u8], width: u32, height: u32) -> Result<Tensor> {
        if (width, height) != (self.input_width, self.input_height) {
            return Err(anyhow!(
                "frame is {}x{}, model expects {}x{}",
                width,
                height,
                self.input_width,
                self.input_height
            ));
        }
        let (w, h) = (width as usize, height as usize);
        if luma.len() != w * h {
            return Err(anyhow!("luma plane is {} bytes, expected {}", luma.len(), w * h));
        }
        let image = tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, _, y, x)| {
            f32::from(luma[y * w + x]) / 255.0
        });
        Ok(image.into_tensor())
    }
}

fn best_score(outputs: &TVec<TValue>) -> Result<f32> {
    let scores = outputs
        .first()
        .ok_or_else(|| anyhow!("model returned no outputs"))?
        .to_array_view::<f32>()
        .context("model output is not f32")?;
    let best = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    Ok(if best.is_finite() { best.clamp(0.0, 1.0) } else { 0.0 })
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        capability == DetectionCapability::Classification
    }

    fn detect(&mut self, luma: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let input = self.luma_tensor(luma, width, height)?;
        let outputs = self.plan.run(tvec!(input.into())).context("run model")?;
        let confidence = best_score(&outputs)?;
        Ok(DetectionResult {
            detections: vec![Detection {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
                confidence,
                class: ObjectClass::Person,
            }],
            confidence,
        })
    }
}
