use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::Duration;

use crate::frame::{Frame, FrameRead, FrameSource};
use crate::SourceId;

enum ScriptedRead {
    Frame(Frame),
    Error(String),
}

/// Replays a prepared sequence of frames.
///
/// Once the script is exhausted the source reports `EndOfStream`, or idles
/// for the read timeout on every call when `hold_open` is set.
pub struct ScriptedSource {
    source: SourceId,
    script: VecDeque<ScriptedRead>,
    pace: Duration,
    hold_open: bool,
}

impl ScriptedSource {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            script: VecDeque::new(),
            pace: Duration::ZERO,
            hold_open: false,
        }
    }

    /// Build a source from frames; each frame must belong to `source`.
    pub fn from_frames(source: SourceId, frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut scripted = Self::new(source);
        for frame in frames {
            scripted.push_frame(frame);
        }
        scripted
    }

    pub fn push_frame(&mut self, frame: Frame) -> &mut Self {
        self.script.push_back(ScriptedRead::Frame(frame));
        self
    }

    pub fn push_error(&mut self, message: &str) -> &mut Self {
        self.script.push_back(ScriptedRead::Error(message.to_string()));
        self
    }

    /// Delay before each read (bounded by the read timeout).
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn hold_open(mut self, enabled: bool) -> Self {
        self.hold_open = enabled;
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl FrameSource for ScriptedSource {
    fn source_id(&self) -> &SourceId {
        &self.source
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<FrameRead> {
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace.min(timeout));
        }
        match self.script.pop_front() {
            Some(ScriptedRead::Frame(frame)) => {
                if frame.source() != &self.source {
                    return Err(anyhow!(
                        "scripted frame for {} replayed on source {}",
                        frame.source(),
                        self.source
                    ));
                }
                Ok(FrameRead::Frame(frame))
            }
            Some(ScriptedRead::Error(message)) => Err(anyhow!(message)),
            None if self.hold_open => {
                std::thread::sleep(timeout);
                Ok(FrameRead::Idle)
            }
            None => Ok(FrameRead::EndOfStream),
        }
    }
}
