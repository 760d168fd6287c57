//! Frame sources.
//!
//! Real acquisition (RTSP, USB, files) lives outside the kernel and plugs in
//! through `FrameSource`. This module provides the two sources the kernel
//! ships with:
//! - `ScriptedSource`: replays a prepared sequence of frames and read errors
//! - `SyntheticSource`: `stub://` scene with periodic motion, for demos and soak runs

mod scripted;
mod synthetic;

pub use scripted::ScriptedSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Parse a `stub://<name>` URL into its source name.
pub fn stub_name(url: &str) -> Option<&str> {
    url.strip_prefix("stub://").filter(|name| !name.is_empty())
}
