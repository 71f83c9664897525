use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::bencode::{decode_prefix, encode};
use crate::error::TransportError;
use crate::message::{Frame, Request};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Owns the byte stream to one evaluation server for one invocation.
///
/// Dropping the connection closes the underlying stream.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    buffer: Vec<u8>,
    peer: String,
}

impl Connection<TcpStream> {
    /// Connects to `host:port`, giving up after `timeout`.
    #[tracing::instrument(level = "debug", skip(timeout))]
    pub async fn open(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let address = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                address: address.clone(),
                timeout_ms: duration_ms(timeout),
            })?
            .map_err(|source| TransportError::Connect {
                address: address.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(peer = address.as_str(), "connected to evaluation server");
        Ok(Self::from_stream(stream, address))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        let bytes = encode(&request.to_bencode());
        tracing::debug!(
            peer = self.peer.as_str(),
            op = request.op.as_str(),
            id = request.id.as_str(),
            bytes = bytes.len(),
            "request sent"
        );
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|source| TransportError::io("failed to write request", source))?;
        self.stream
            .flush()
            .await
            .map_err(|source| TransportError::io("failed to flush request", source))
    }

    /// Reads the next frame, or `Ok(None)` if `deadline` passes first.
    ///
    /// Partially received bytes stay buffered for the next read.
    pub async fn read_frame_until(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<Frame>, TransportError> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                return Ok(Some(frame));
            }
            let read = match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await
            {
                Err(_) => return Ok(None),
                Ok(result) => result
                    .map_err(|source| TransportError::io("failed to read from server", source))?,
            };
            if read == 0 {
                return Err(TransportError::Closed { frames: Vec::new() });
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let decoded = decode_prefix(&self.buffer)
            .map_err(|error| TransportError::protocol(format!("malformed frame: {error}")))?;
        let Some((value, consumed)) = decoded else {
            return Ok(None);
        };
        self.buffer.drain(..consumed);
        let frame = Frame::from_bencode(value)
            .ok_or_else(|| TransportError::protocol("frame is not a dictionary"))?;
        tracing::debug!(
            peer = self.peer.as_str(),
            id = frame.id.as_deref().unwrap_or("-"),
            status = ?frame.status,
            has_value = frame.value.is_some(),
            "frame received"
        );
        Ok(Some(frame))
    }

    /// Flushes and shuts down the write side; the stream is dropped afterwards.
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        self.stream
            .shutdown()
            .await
            .map_err(|source| TransportError::io("failed to shut down connection", source))
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
