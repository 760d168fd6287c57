//! Cascade Kernel
//!
//! This crate decides whether a captured frame represents a real event worth
//! notifying a human about, by running it through a chain of increasingly
//! expensive and increasingly authoritative checks.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> ChangeDetector -> EventDebouncer -> ConfirmationCascade -> NotificationDispatcher
//! ```
//!
//! The kernel enforces three invariants by construction:
//!
//! 1. **Single Flight**: a source has at most one non-terminal trigger at a time.
//! 2. **Exactly One Outcome**: every trigger reaches exactly one terminal `EventOutcome`,
//!    including triggers abandoned at shutdown.
//! 3. **Bounded Waiting**: every stage invocation and sink delivery runs under a deadline,
//!    and every retry loop has a maximum attempt count.
//!
//! # Module Structure
//!
//! - `frame`: Immutable frames and the `FrameSource` boundary
//! - `ingest`: Scripted and synthetic frame sources
//! - `detect`: Change detection (motion samples) and local detector backends
//! - `debounce`: Threshold + cooldown hysteresis producing triggers
//! - `cascade`: The confirmation state machine, stage policies, in-flight registry
//! - `stages`: Confirmation stage adapters (local detector, remote HTTP)
//! - `notify`: Notification dispatcher, sinks, recently-delivered set
//! - `outcome`: Terminal records and outcome observers
//! - `pipeline`: Per-source workers wiring everything together
//! - `config`: `cascaded` configuration (file, then `CASCADE_*` environment)
//! - `deadline`, `shutdown`: Bounded calls and cooperative cancellation
//! - Core types: SourceId, TriggerId, Timestamp, Trigger

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod cascade;
pub mod config;
pub mod deadline;
pub mod debounce;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod outcome;
pub mod pipeline;
pub mod shutdown;
pub mod stages;

pub use cascade::{
    CascadeStage, CascadeState, ConfirmationCascade, ConfirmationStage, InFlightRegistry,
    InvariantViolation, RetryPolicy, StageError, StageErrorKind, StagePolicy, StageResult,
    TimeoutPolicy,
};
pub use debounce::{DebounceConfig, DebounceDecision, EventDebouncer};
pub use detect::{ChangeDetector, ChangeDetectorConfig, Detection, MotionSample, ObjectClass};
pub use frame::{Frame, FrameError, FrameRead, FrameSource, PixelFormat};
pub use ingest::{ScriptedSource, SyntheticConfig, SyntheticSource};
pub use notify::{
    DeliveryError, DispatchReport, DispatcherConfig, LogSink, NotificationDispatcher,
    NotificationPayload, NotificationSink, SinkStatus,
};
pub use outcome::{
    EventOutcome, FanoutObserver, JsonLinesObserver, LogObserver, OutcomeObserver, StageAttempt,
    Verdict,
};
pub use pipeline::{Pipeline, PipelineHandle, PipelineSettings, ShutdownReport};
pub use shutdown::ShutdownSignal;

// -------------------- Identifiers --------------------

/// Identifier of a frame source (one camera, one stream).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Process-unique trigger identifier. Also the idempotency key for sinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(u64);

impl TriggerId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trg-{:06}", self.0)
    }
}

/// Hands out trigger IDs. Clones share one counter, so a single allocator
/// shared by every source keeps IDs unique for the lifetime of the process
/// and monotonic within each source.
#[derive(Clone, Debug)]
pub struct TriggerIdAllocator {
    next: Arc<AtomicU64>,
}

impl TriggerIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> TriggerId {
        TriggerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TriggerIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------- Time --------------------

/// Capture/creation time in milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }
}

// -------------------- Triggers --------------------

/// A debounced candidate event for one source.
///
/// The trigger carries the single reference frame every cascade stage sees.
/// The frame is shared behind an `Arc` and released when the last stage
/// holding it finishes.
#[derive(Clone, Debug)]
pub struct Trigger {
    pub id: TriggerId,
    pub source: SourceId,
    pub created_at: Timestamp,
    /// Change magnitude of the sample that produced this trigger.
    pub magnitude: f32,
    pub frame: Arc<Frame>,
}
