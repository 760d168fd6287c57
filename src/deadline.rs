//! Deadline-bounded invocation of blocking collaborators.
//!
//! Stages and sinks are external code that may block forever. Each call runs
//! on its own thread and the caller waits on a channel in short slices so it
//! can observe both the deadline and process shutdown. A call that never
//! returns leaves a detached thread behind; its late result is dropped.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::shutdown::ShutdownSignal;

const POLL_SLICE: Duration = Duration::from_millis(20);

/// How a bounded invocation ended.
#[derive(Debug)]
pub enum Invocation<T> {
    Completed(T),
    DeadlineExceeded,
    Cancelled,
    /// The worker thread could not be spawned or panicked.
    Crashed(String),
}

/// Run `f` on a worker thread and wait at most until `deadline`.
pub fn run_until<T, F>(name: &str, deadline: Instant, shutdown: &ShutdownSignal, f: F) -> Invocation<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if shutdown.is_triggered() {
        return Invocation::Cancelled;
    }

    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = thread::Builder::new()
        .name(format!("call-{}", name))
        .spawn(move || {
            // The receiver may be gone after a timeout; the result is dropped.
            let _ = tx.send(f());
        });
    if let Err(e) = spawned {
        return Invocation::Crashed(format!("spawn failed: {}", e));
    }

    loop {
        if shutdown.is_triggered() {
            return Invocation::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return Invocation::DeadlineExceeded;
        }
        let slice = (deadline - now).min(POLL_SLICE);
        match rx.recv_timeout(slice) {
            Ok(value) => return Invocation::Completed(value),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Invocation::Crashed(format!("{} panicked", name))
            }
        }
    }
}

/// Convenience wrapper taking a budget instead of an absolute deadline.
pub fn run_with_deadline<T, F>(
    name: &str,
    budget: Duration,
    shutdown: &ShutdownSignal,
    f: F,
) -> Invocation<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    run_until(name, Instant::now() + budget, shutdown, f)
}
