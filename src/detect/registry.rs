use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::result::DetectionResult;

use super::backend::{DetectionCapability, DetectorBackend};

type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Detector backends available to local confirmation stages.
///
/// `DetectorBackend::detect` takes `&mut self`, so each backend sits behind
/// its own lock: cascades of different sources share a backend one call at a
/// time. The registry is built once and read-only afterwards.
#[derive(Default)]
pub struct BackendRegistry {
    /// Registration order; earlier entries win capability lookups.
    backends: Vec<(&'static str, SharedBackend)>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. A later backend with the same name replaces the earlier one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name();
        let shared: SharedBackend = Arc::new(Mutex::new(backend));
        match self.backends.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = shared,
            None => self.backends.push((name, shared)),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|(name, _)| *name).collect()
    }

    fn select(&self, name: Option<&str>, capability: DetectionCapability) -> Result<&SharedBackend> {
        if let Some(name) = name {
            return self
                .backends
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, backend)| backend)
                .ok_or_else(|| anyhow!("backend '{}' not registered", name));
        }
        for (name, backend) in &self.backends {
            let guard = backend
                .lock()
                .map_err(|_| anyhow!("backend '{}' lock poisoned", name))?;
            if guard.supports(capability) {
                return Ok(backend);
            }
        }
        Err(anyhow!("no registered backend supports {:?}", capability))
    }

    /// Run `name`, or the first backend supporting `capability` when `name` is None.
    pub fn detect(
        &self,
        name: Option<&str>,
        capability: DetectionCapability,
        luma: &[u8],
        width: u32,
        height: u32,
    ) -> Result<DetectionResult> {
        let backend = self.select(name, capability)?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        if !guard.supports(capability) {
            return Err(anyhow!(
                "backend '{}' does not support {:?}",
                guard.name(),
                capability
            ));
        }
        guard.detect(luma, width, height)
    }
}
