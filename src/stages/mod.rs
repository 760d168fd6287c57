//! Confirmation stage adapters.
//!
//! Stage-specific parsing and error classification live here so the cascade
//! only ever sees the closed `StageResult` type.

mod http;
mod local;
pub mod remote;

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::cascade::{CascadeStage, ConfirmationStage};
use crate::config::{StageKind, StageSettings};
use crate::detect::{BackendRegistry, CpuBackend, DetectionCapability, StubBackend};

pub use local::DetectorStage;
pub use remote::parse_confirmation;

#[cfg(feature = "stage-http")]
pub use http::HttpStage;

/// Build the configured stages in order.
pub fn build_stages(settings: &[StageSettings]) -> Result<Vec<CascadeStage>> {
    settings
        .iter()
        .map(|s| Ok(CascadeStage::new(build_stage(s)?, s.policy.clone())))
        .collect()
}

pub fn build_stage(settings: &StageSettings) -> Result<Arc<dyn ConfirmationStage>> {
    match &settings.kind {
        StageKind::Local {
            backend,
            model_path,
            min_confidence,
            classes,
        } => {
            let mut registry = BackendRegistry::new();
            let capability = match backend.as_str() {
                "cpu" => {
                    registry.register(CpuBackend::default());
                    DetectionCapability::ObjectDetection
                }
                "stub" => {
                    registry.register(StubBackend::new());
                    DetectionCapability::ObjectDetection
                }
                "tract" => {
                    let path = model_path.as_ref().ok_or_else(|| {
                        anyhow!("stage {}: tract backend requires model_path", settings.name)
                    })?;
                    register_tract(&mut registry, path)?;
                    DetectionCapability::Classification
                }
                other => {
                    return Err(anyhow!(
                        "stage {}: unknown backend {:?}",
                        settings.name,
                        other
                    ))
                }
            };
            let stage = DetectorStage::new(settings.name.clone(), Arc::new(registry))
                .with_backend(backend.clone())
                .with_capability(capability)
                .with_min_confidence(*min_confidence)
                .with_classes(classes.clone());
            Ok(Arc::new(stage))
        }
        StageKind::Http {
            url,
            min_score,
            classes,
            auth_token_env,
        } => build_http(&settings.name, url, *min_score, classes, auth_token_env.as_deref()),
    }
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut BackendRegistry, path: &std::path::Path) -> Result<()> {
    // Synthetic and scaled feeds are small; the model input is fixed at load.
    let backend = crate::detect::TractBackend::new(path, 64, 48)?;
    registry.register(backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut BackendRegistry, _path: &std::path::Path) -> Result<()> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}

#[cfg(feature = "stage-http")]
fn build_http(
    name: &str,
    url: &str,
    min_score: f32,
    classes: &[crate::detect::ObjectClass],
    auth_token_env: Option<&str>,
) -> Result<Arc<dyn ConfirmationStage>> {
    let mut stage = HttpStage::new(name, url)
        .with_min_score(min_score)
        .with_classes(classes.to_vec());
    if let Some(var) = auth_token_env {
        let token = std::env::var(var)
            .map_err(|_| anyhow!("stage {}: {} is not set", name, var))?;
        stage = stage.with_auth_token(token);
    }
    Ok(Arc::new(stage))
}

#[cfg(not(feature = "stage-http"))]
fn build_http(
    name: &str,
    _url: &str,
    _min_score: f32,
    _classes: &[crate::detect::ObjectClass],
    _auth_token_env: Option<&str>,
) -> Result<Arc<dyn ConfirmationStage>> {
    Err(anyhow!("stage {}: http stages require the stage-http feature", name))
}
