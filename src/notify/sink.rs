use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::Detection;
use crate::{SourceId, Timestamp, TriggerId};

/// What a sink receives for a confirmed event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Idempotency key. Sinks may see the same id more than once.
    pub trigger_id: TriggerId,
    pub source: SourceId,
    pub detections: Vec<Detection>,
    pub timestamp: Timestamp,
    pub frame_digest: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("retryable delivery error: {0}")]
    Retryable(String),
    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}

/// Downstream consumer of confirmed events.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError>;
}

/// Logs each notification. Never fails.
#[derive(Clone, Debug)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("log")
    }
}

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        let classes: Vec<String> = payload
            .detections
            .iter()
            .map(|d| format!("{:?}", d.class).to_lowercase())
            .collect();
        log::info!(
            "notify sink={} trigger={} source={} at={} detections=[{}] frame={}",
            self.name,
            payload.trigger_id,
            payload.source,
            payload.timestamp.as_millis(),
            classes.join(","),
            payload.frame_digest
        );
        Ok(())
    }
}
