use thiserror::Error;

use crate::message::Frame;

/// Failures raised by the connection and session layers.
///
/// Every variant that can occur mid-call carries the frames received so far.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {address} after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },
    #[error("protocol error: {message}")]
    Protocol { message: String, frames: Vec<Frame> },
    #[error("'{op}' call did not complete within {timeout_ms}ms ({} frames received)", .frames.len())]
    Timeout {
        op: String,
        timeout_ms: u64,
        frames: Vec<Frame>,
    },
    #[error("connection closed by remote ({} frames received)", .frames.len())]
    Closed { frames: Vec<Frame> },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Partial frames observed before the failure.
    pub fn frames(&self) -> &[Frame] {
        match self {
            Self::Protocol { frames, .. } | Self::Timeout { frames, .. } | Self::Closed { frames } => {
                frames
            }
            Self::Connect { .. } | Self::ConnectTimeout { .. } | Self::Io { .. } => &[],
        }
    }

    /// Prepends `earlier` to whatever frames the error already carries.
    pub(crate) fn with_partial_frames(mut self, earlier: Vec<Frame>) -> Self {
        if let Self::Protocol { frames, .. } | Self::Closed { frames } = &mut self {
            let mut combined = earlier;
            combined.append(frames);
            *frames = combined;
        }
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectTimeout { .. })
    }
}
