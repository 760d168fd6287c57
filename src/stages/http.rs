#![cfg(feature = "stage-http")]

use std::time::{Duration, Instant};

use crate::cascade::{ConfirmationStage, StageError, StageResult};
use crate::detect::ObjectClass;
use crate::frame::Frame;

use super::remote::parse_confirmation;

/// Authoritative remote confirmation over HTTP.
///
/// POSTs the raw reference frame with its geometry in headers and parses the
/// JSON answer with `parse_confirmation`. The request timeout is whatever is
/// left of the stage deadline.
pub struct HttpStage {
    name: String,
    url: String,
    agent: ureq::Agent,
    min_score: f32,
    classes: Vec<ObjectClass>,
    auth_token: Option<String>,
}

impl HttpStage {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(5))
                .build(),
            min_score: 0.5,
            classes: Vec::new(),
            auth_token: None,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_classes(mut self, classes: Vec<ObjectClass>) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Map an HTTP error status to a stage error.
pub(crate) fn classify_status(code: u16, body: &str) -> StageError {
    let message = format!("HTTP {}: {}", code, body.chars().take(200).collect::<String>());
    match code {
        408 | 429 => StageError::transient(message),
        400..=499 => StageError::permanent(message),
        _ => StageError::transient(message),
    }
}

impl ConfirmationStage for HttpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn confirm(&self, frame: &Frame, deadline: Instant) -> StageResult {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return StageResult::TimedOut;
        }

        let mut request = self
            .agent
            .post(&self.url)
            .timeout(remaining)
            .set("Content-Type", "application/octet-stream")
            .set("X-Frame-Format", &format!("{:?}", frame.format()).to_lowercase())
            .set("X-Frame-Width", &frame.width().to_string())
            .set("X-Frame-Height", &frame.height().to_string())
            .set("X-Frame-Source", frame.source().as_str());
        if let Some(token) = &self.auth_token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }

        match request.send_bytes(frame.pixels()) {
            Ok(response) => match response.into_string() {
                Ok(body) => parse_confirmation(&body, self.min_score, &self.classes),
                Err(e) => StageResult::Failed(StageError::transient(format!("read body: {}", e))),
            },
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                StageResult::Failed(classify_status(code, &body))
            }
            Err(ureq::Error::Transport(transport)) => {
                if Instant::now() >= deadline {
                    StageResult::TimedOut
                } else {
                    StageResult::Failed(StageError::transient(transport.to_string()))
                }
            }
        }
    }
}
