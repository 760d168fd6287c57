//! The confirmation state machine.
//!
//! ```text
//! Pending -> StageRunning(0) -> StageRunning(1) -> ... -> Confirmed
//!                  |                  |
//!                  +-> Rejected | Failed | TimedOut
//! ```
//!
//! Escalation to the next stage happens only on `Confirmed`.

mod inflight;
mod machine;
mod policy;
mod stage;

pub use inflight::{InFlightGuard, InFlightRegistry, InvariantViolation};
pub use machine::{CascadeStage, CascadeState, ConfirmationCascade};
pub use policy::{RetryPolicy, StagePolicy, TimeoutPolicy};
pub use stage::{ConfirmationStage, StageError, StageErrorKind, StageResult};
