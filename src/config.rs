use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cascade::{RetryPolicy, StagePolicy, TimeoutPolicy};
use crate::debounce::DebounceConfig;
use crate::detect::{ChangeDetectorConfig, ObjectClass};
use crate::ingest::SyntheticConfig;
use crate::notify::{DispatcherConfig, MqttSinkConfig};
use crate::pipeline::{check_unique_sources, PipelineSettings};
use crate::SourceId;

const DEFAULT_CHANGE_THRESHOLD: f32 = 2.0;
const DEFAULT_CHANGE_SMOOTHING: f32 = 0.5;
const DEFAULT_NOISE_FLOOR: u8 = 12;
const DEFAULT_COOLDOWN_MS: u64 = 5_000;
const DEFAULT_MAX_IN_FLIGHT: usize = 1;
const DEFAULT_STAGE_DEADLINE_MS: u64 = 500;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;
const DEFAULT_SINK_DEADLINE_MS: u64 = 2_000;
const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 64;
const DEFAULT_SOURCE_HEIGHT: u32 = 48;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;
const DEFAULT_DEDUP_CAPACITY: usize = 1_024;
const DEFAULT_DISPATCH_WORKERS: usize = 2;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Deserialize, Default)]
struct CascadeConfigFile {
    change_threshold: Option<f32>,
    change_smoothing: Option<f32>,
    change_noise_floor: Option<u8>,
    debounce_cooldown_ms: Option<u64>,
    max_in_flight_per_source: Option<usize>,
    stages: Option<Vec<StageConfigFile>>,
    sink_retry: Option<SinkRetryConfigFile>,
    sources: Option<Vec<SourceConfigFile>>,
    shutdown_grace_ms: Option<u64>,
    dedup_capacity: Option<usize>,
    dispatch_workers: Option<usize>,
    mqtt: Option<MqttSinkConfig>,
    outcome_log: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct StageConfigFile {
    name: Option<String>,
    kind: Option<String>,
    deadline_ms: Option<u64>,
    on_timeout: Option<String>,
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    // local
    backend: Option<String>,
    model_path: Option<PathBuf>,
    min_confidence: Option<f32>,
    classes: Option<Vec<String>>,
    // http
    url: Option<String>,
    auth_token_env: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkRetryConfigFile {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    id: Option<String>,
    url: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub detector: ChangeDetectorConfig,
    pub debounce: DebounceConfig,
    pub stages: Vec<StageSettings>,
    pub sink_retry: RetryPolicy,
    pub sink_deadline: Duration,
    pub sources: Vec<SourceSettings>,
    pub shutdown_grace: Duration,
    pub dedup_capacity: usize,
    pub dispatch_workers: usize,
    pub mqtt: Option<MqttSinkConfig>,
    pub outcome_log: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub name: String,
    pub kind: StageKind,
    pub policy: StagePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    Local {
        backend: String,
        model_path: Option<PathBuf>,
        min_confidence: f32,
        classes: Vec<ObjectClass>,
    },
    Http {
        url: String,
        min_score: f32,
        classes: Vec<ObjectClass>,
        auth_token_env: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub id: SourceId,
    pub url: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl SourceSettings {
    pub fn synthetic(&self) -> SyntheticConfig {
        SyntheticConfig {
            url: self.url.clone(),
            id: Some(self.id.as_str().to_string()),
            target_fps: self.fps,
            width: self.width,
            height: self.height,
            ..SyntheticConfig::default()
        }
    }
}

impl CascadeConfig {
    /// Load from `CASCADE_CONFIG` (JSON, or TOML by extension), then apply
    /// `CASCADE_*` environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CASCADE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults only, no file or environment.
    pub fn defaults() -> Result<Self> {
        let cfg = Self::from_file(CascadeConfigFile::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CascadeConfigFile) -> Result<Self> {
        let detector = ChangeDetectorConfig {
            smoothing: file.change_smoothing.unwrap_or(DEFAULT_CHANGE_SMOOTHING),
            noise_floor: file.change_noise_floor.unwrap_or(DEFAULT_NOISE_FLOOR),
        };
        let debounce = DebounceConfig {
            threshold: file.change_threshold.unwrap_or(DEFAULT_CHANGE_THRESHOLD),
            cooldown: Duration::from_millis(
                file.debounce_cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS),
            ),
            max_in_flight_per_source: file
                .max_in_flight_per_source
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
        };

        let stages = match file.stages {
            Some(stages) => stages
                .into_iter()
                .enumerate()
                .map(|(i, stage)| stage_from_file(i, stage))
                .collect::<Result<Vec<_>>>()?,
            None => vec![default_stage()],
        };

        let sink = file.sink_retry.unwrap_or_default();
        let sink_retry = RetryPolicy {
            max_attempts: sink.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: Duration::from_millis(
                sink.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                sink.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
        };
        let sink_deadline =
            Duration::from_millis(sink.deadline_ms.unwrap_or(DEFAULT_SINK_DEADLINE_MS));

        let sources = match file.sources {
            Some(sources) => sources
                .into_iter()
                .map(source_from_file)
                .collect::<Result<Vec<_>>>()?,
            None => vec![source_from_url(DEFAULT_SOURCE_URL)?],
        };

        Ok(Self {
            detector,
            debounce,
            stages,
            sink_retry,
            sink_deadline,
            sources,
            shutdown_grace: Duration::from_millis(
                file.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            dedup_capacity: file.dedup_capacity.unwrap_or(DEFAULT_DEDUP_CAPACITY),
            dispatch_workers: file.dispatch_workers.unwrap_or(DEFAULT_DISPATCH_WORKERS),
            mqtt: file.mqtt,
            outcome_log: file.outcome_log,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(threshold) = std::env::var("CASCADE_CHANGE_THRESHOLD") {
            self.debounce.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("CASCADE_CHANGE_THRESHOLD must be a number"))?;
        }
        if let Ok(cooldown) = std::env::var("CASCADE_DEBOUNCE_COOLDOWN_MS") {
            let millis: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("CASCADE_DEBOUNCE_COOLDOWN_MS must be an integer number of milliseconds")
            })?;
            self.debounce.cooldown = Duration::from_millis(millis);
        }
        if let Ok(max) = std::env::var("CASCADE_MAX_IN_FLIGHT") {
            self.debounce.max_in_flight_per_source = max
                .trim()
                .parse()
                .map_err(|_| anyhow!("CASCADE_MAX_IN_FLIGHT must be a positive integer"))?;
        }
        if let Ok(grace) = std::env::var("CASCADE_SHUTDOWN_GRACE_MS") {
            let millis: u64 = grace.trim().parse().map_err(|_| {
                anyhow!("CASCADE_SHUTDOWN_GRACE_MS must be an integer number of milliseconds")
            })?;
            self.shutdown_grace = Duration::from_millis(millis);
        }
        if let Ok(sources) = std::env::var("CASCADE_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.sources = parsed
                    .iter()
                    .map(|url| source_from_url(url))
                    .collect::<Result<Vec<_>>>()?;
            }
        }
        if let Ok(path) = std::env::var("CASCADE_OUTCOME_LOG") {
            if !path.trim().is_empty() {
                self.outcome_log = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.debounce.threshold.is_finite() || self.debounce.threshold < 0.0 {
            return Err(anyhow!("change_threshold must be a non-negative number"));
        }
        if !(self.detector.smoothing > 0.0 && self.detector.smoothing <= 1.0) {
            return Err(anyhow!("change_smoothing must be in (0, 1]"));
        }
        if self.debounce.max_in_flight_per_source == 0 {
            return Err(anyhow!("max_in_flight_per_source must be at least 1"));
        }
        if self.sink_retry.max_attempts == 0 {
            return Err(anyhow!("sink_retry.max_attempts must be at least 1"));
        }
        if self.sink_deadline.is_zero() {
            return Err(anyhow!("sink_retry.deadline_ms must be greater than zero"));
        }
        if self.dispatch_workers == 0 {
            return Err(anyhow!("dispatch_workers must be at least 1"));
        }
        if self.dedup_capacity == 0 {
            return Err(anyhow!("dedup_capacity must be at least 1"));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(anyhow!("duplicate stage name {}", stage.name));
            }
            if stage.policy.deadline.is_zero() {
                return Err(anyhow!("stage {}: deadline_ms must be greater than zero", stage.name));
            }
            if stage.policy.retry.max_attempts == 0 {
                return Err(anyhow!("stage {}: max_attempts must be at least 1", stage.name));
            }
        }

        if self.sources.is_empty() {
            return Err(anyhow!("at least one source is required"));
        }
        let ids: Vec<SourceId> = self.sources.iter().map(|s| s.id.clone()).collect();
        check_unique_sources(&ids)?;
        for source in &self.sources {
            if source.fps == 0 || source.width == 0 || source.height == 0 {
                return Err(anyhow!(
                    "source {}: fps, width and height must be non-zero",
                    source.id
                ));
            }
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            detector: self.detector.clone(),
            debounce: self.debounce.clone(),
            dispatcher: DispatcherConfig {
                retry: self.sink_retry.clone(),
                deadline: self.sink_deadline,
                dedup_capacity: self.dedup_capacity,
            },
            dispatch_workers: self.dispatch_workers,
            ..PipelineSettings::default()
        }
    }
}

fn default_stage() -> StageSettings {
    StageSettings {
        name: "local".to_string(),
        kind: StageKind::Local {
            backend: "cpu".to_string(),
            model_path: None,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            classes: Vec::new(),
        },
        policy: StagePolicy::fail_closed(Duration::from_millis(DEFAULT_STAGE_DEADLINE_MS)),
    }
}

fn stage_from_file(index: usize, file: StageConfigFile) -> Result<StageSettings> {
    let name = file.name.unwrap_or_else(|| format!("stage{}", index));
    let classes: Vec<ObjectClass> = file
        .classes
        .unwrap_or_default()
        .iter()
        .map(|label| ObjectClass::from_label(label))
        .collect();
    let min_confidence = file.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE);

    let kind_name = file.kind.as_deref().unwrap_or("local");
    let kind = match kind_name {
        "local" => StageKind::Local {
            backend: file.backend.unwrap_or_else(|| "cpu".to_string()),
            model_path: file.model_path,
            min_confidence,
            classes,
        },
        "http" => StageKind::Http {
            url: file
                .url
                .ok_or_else(|| anyhow!("stage {}: http stages require a url", name))?,
            min_score: min_confidence,
            classes,
            auth_token_env: file.auth_token_env,
        },
        other => return Err(anyhow!("stage {}: unknown kind {:?}", name, other)),
    };

    // Local stages fail closed by default; remote ones retry.
    let default_timeout = match kind {
        StageKind::Local { .. } => TimeoutPolicy::Reject,
        StageKind::Http { .. } => TimeoutPolicy::Retry,
    };
    let on_timeout = match file.on_timeout.as_deref() {
        None => default_timeout,
        Some("reject") => TimeoutPolicy::Reject,
        Some("retry") => TimeoutPolicy::Retry,
        Some(other) => {
            return Err(anyhow!(
                "stage {}: on_timeout must be \"reject\" or \"retry\", got {:?}",
                name,
                other
            ))
        }
    };

    let policy = StagePolicy {
        deadline: Duration::from_millis(file.deadline_ms.unwrap_or(DEFAULT_STAGE_DEADLINE_MS)),
        on_timeout,
        retry: RetryPolicy {
            max_attempts: file.max_attempts.unwrap_or(match on_timeout {
                TimeoutPolicy::Reject => 1,
                TimeoutPolicy::Retry => DEFAULT_MAX_ATTEMPTS,
            }),
            initial_backoff: Duration::from_millis(
                file.initial_backoff_ms.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                file.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
        },
    };
    Ok(StageSettings { name, kind, policy })
}

fn source_from_file(file: SourceConfigFile) -> Result<SourceSettings> {
    let url = file.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string());
    let mut source = source_from_url(&url)?;
    if let Some(id) = file.id {
        source.id = SourceId::new(id);
    }
    source.fps = file.fps.unwrap_or(source.fps);
    source.width = file.width.unwrap_or(source.width);
    source.height = file.height.unwrap_or(source.height);
    Ok(source)
}

fn source_from_url(url: &str) -> Result<SourceSettings> {
    let name = crate::ingest::stub_name(url).ok_or_else(|| {
        anyhow!(
            "unsupported source url {}; only stub:// sources are built in",
            url
        )
    })?;
    Ok(SourceSettings {
        id: SourceId::new(name),
        url: url.to_string(),
        fps: DEFAULT_SOURCE_FPS,
        width: DEFAULT_SOURCE_WIDTH,
        height: DEFAULT_SOURCE_HEIGHT,
    })
}

fn read_config_file(path: &Path) -> Result<CascadeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
