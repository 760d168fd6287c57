//! Change detection and local object detection.
//!
//! `ChangeDetector` is the cheap first pass over every frame. The backends
//! behind `BackendRegistry` are the heavier second opinion that cascade
//! stages consult only after a trigger has been debounced.

mod backend;
pub mod backends;
mod change;
mod registry;
mod result;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{CpuBackend, StubBackend};
pub use change::{ChangeDetector, ChangeDetectorConfig, MotionSample};
pub use registry::BackendRegistry;
pub use result::{Detection, DetectionResult, ObjectClass};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
