use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::detect::Detection;
use crate::frame::Frame;

/// One confirmation step.
///
/// Implementations must be safe to call concurrently for different triggers
/// and sources. `deadline` is advisory for the stage; the cascade enforces it
/// regardless of whether the stage honors it.
pub trait ConfirmationStage: Send + Sync {
    fn name(&self) -> &str;

    fn confirm(&self, frame: &Frame, deadline: Instant) -> StageResult;
}

/// Closed result of one stage invocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum StageResult {
    Confirmed(Vec<Detection>),
    Rejected(String),
    Failed(StageError),
    TimedOut,
}

impl StageResult {
    pub fn label(&self) -> &'static str {
        match self {
            StageResult::Confirmed(_) => "confirmed",
            StageResult::Rejected(_) => "rejected",
            StageResult::Failed(_) => "failed",
            StageResult::TimedOut => "timed_out",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Network blips, overload, timeouts inside the stage. Retried.
    Transient,
    /// Malformed request, auth failure. Short-circuits the cascade.
    Permanent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{kind:?} stage error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StageErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_serialize_tagged() {
        let json = serde_json::to_value(StageResult::Rejected("empty scene".into())).unwrap();
        assert_eq!(json["result"], "rejected");
        assert_eq!(json["detail"], "empty scene");

        let json = serde_json::to_value(StageResult::Failed(StageError::transient("503"))).unwrap();
        assert_eq!(json["detail"]["kind"], "transient");

        let json = serde_json::to_value(StageResult::TimedOut).unwrap();
        assert_eq!(json["result"], "timed_out");
    }

    #[test]
    fn error_display_names_kind() {
        let err = StageError::permanent("401 unauthorized");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Permanent stage error: 401 unauthorized");
    }
}
