use thiserror::Error;

use replcheck_transport::{joined_err, joined_out, Frame, SideChannel, TransportError};

/// Frames and output observed before a run stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub frames: Vec<Frame>,
    pub stdout: String,
    pub stderr: String,
}

impl Capture {
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        let mut capture = Self::default();
        capture.record_frames(frames);
        capture
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }

    pub(crate) fn record_frames(&mut self, frames: Vec<Frame>) {
        self.stdout.push_str(&joined_out(&frames));
        self.stderr.push_str(&joined_err(&frames));
        self.frames.extend(frames);
    }

    pub(crate) fn record_side_channel(&mut self, side_channel: SideChannel) {
        self.stdout.push_str(&side_channel.out);
        self.stderr.push_str(&side_channel.err);
        self.frames.extend(side_channel.frames);
    }
}

/// Fatal outcomes of a runner or orchestrated invocation.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: TransportError,
        capture: Capture,
    },
    #[error("target '{target}' is unreachable: {detail}")]
    TargetUnreachable {
        target: String,
        detail: String,
        capture: Capture,
    },
    #[error("result collector was not installed: {detail}")]
    CollectorInstall { detail: String, capture: Capture },
    #[error("failed to reload '{unit}': {detail}")]
    Reload {
        unit: String,
        detail: String,
        capture: Capture,
    },
    #[error("test execution did not start: {detail}")]
    Start { detail: String, capture: Capture },
    #[error("evaluation produced no result: {reason}")]
    Eval { reason: String, capture: Capture },
    #[error("remote evaluation failed: {message}")]
    Remote { message: String, capture: Capture },
    #[error("no result after {timeout_ms}ms ({attempts} polls)")]
    PollTimeout {
        timeout_ms: u64,
        attempts: u32,
        last_raw: Option<String>,
        capture: Capture,
    },
}

impl RunError {
    pub fn capture(&self) -> &Capture {
        match self {
            Self::Transport { capture, .. }
            | Self::TargetUnreachable { capture, .. }
            | Self::CollectorInstall { capture, .. }
            | Self::Reload { capture, .. }
            | Self::Start { capture, .. }
            | Self::Eval { capture, .. }
            | Self::Remote { capture, .. }
            | Self::PollTimeout { capture, .. } => capture,
        }
    }

    pub(crate) fn transport(source: TransportError, mut capture: Capture) -> Self {
        capture.record_frames(source.frames().to_vec());
        Self::Transport { source, capture }
    }
}

impl From<TransportError> for RunError {
    fn from(source: TransportError) -> Self {
        Self::transport(source, Capture::default())
    }
}
