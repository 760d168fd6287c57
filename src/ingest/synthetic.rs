//! Synthetic frame source.
//!
//! `SyntheticSource` renders a static gradient background with a little sensor
//! noise, and periodically moves a bright block through the scene to simulate
//! an object entering the field of view. It is used by the `cascaded` daemon
//! for `stub://` URLs and by soak tests.
//!
//! Rendering is seeded, so two sources with the same config produce the same
//! pixels; only the capture timestamps differ.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameRead, FrameSource};
use crate::{SourceId, Timestamp};

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// `stub://<name>`; the name becomes the source id unless `id` is set.
    pub url: String,
    pub id: Option<String>,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Frames between the start of two simulated events.
    pub event_period: u64,
    /// Frames an event stays in view.
    pub event_frames: u64,
    /// Stop after this many frames (None = unbounded).
    pub max_frames: Option<u64>,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            id: None,
            target_fps: 10,
            width: 64,
            height: 48,
            event_period: 50,
            event_frames: 8,
            max_frames: None,
            seed: 7,
        }
    }
}

/// Seeded synthetic scene.
pub struct SyntheticSource {
    source: SourceId,
    config: SyntheticConfig,
    rng: StdRng,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        let name = super::stub_name(&config.url)
            .ok_or_else(|| anyhow!("synthetic source requires a stub:// url, got {}", config.url))?;
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic source dimensions must be non-zero"));
        }
        if config.target_fps == 0 {
            return Err(anyhow!("synthetic source target_fps must be > 0"));
        }
        let source = SourceId::new(config.id.as_deref().unwrap_or(name));
        let rng = StdRng::seed_from_u64(config.seed);
        log::info!(
            "SyntheticSource: {} ready ({}x{} @ {} fps)",
            config.url,
            config.width,
            config.height,
            config.target_fps
        );
        Ok(Self {
            source,
            config,
            rng,
            frame_count: 0,
            next_due: None,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.config.target_fps as u64)
    }

    /// True while the simulated object is in view for the current frame.
    fn event_active(&self) -> bool {
        let period = self.config.event_period.max(1);
        // Frame 0 is background only, so the first event starts at `period`.
        self.frame_count >= period && self.frame_count % period < self.config.event_frames
    }

    fn render(&mut self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let base = ((x + y) * 255 / (width + height)) as i16;
                let noise: i16 = self.rng.gen_range(-2..=2);
                pixels.push((base + noise).clamp(0, 255) as u8);
            }
        }

        if self.event_active() {
            // Block slides right while the event lasts.
            let period = self.config.event_period.max(1);
            let step = (self.frame_count % period) as usize;
            let block_w = (width / 3).max(1);
            let block_h = (height / 2).max(1);
            let x0 = (step * 2).min(width.saturating_sub(block_w));
            let y0 = height / 4;
            for y in y0..(y0 + block_h).min(height) {
                for x in x0..(x0 + block_w).min(width) {
                    pixels[y * width + x] = 250;
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn source_id(&self) -> &SourceId {
        &self.source
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FrameRead> {
        if let Some(max) = self.config.max_frames {
            if self.frame_count >= max {
                return Ok(FrameRead::EndOfStream);
            }
        }

        let now = Instant::now();
        if let Some(due) = self.next_due {
            if now < due {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(FrameRead::Idle);
                }
                std::thread::sleep(wait);
            }
        }
        self.next_due = Some(Instant::now() + self.frame_interval());

        let pixels = self.render();
        self.frame_count += 1;
        Ok(FrameRead::Frame(Frame::gray(
            self.source.clone(),
            Timestamp::now(),
            self.config.width,
            self.config.height,
            pixels,
        )))
    }
}
