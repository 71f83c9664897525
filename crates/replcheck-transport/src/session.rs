use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::connection::{duration_ms, Connection};
use crate::error::TransportError;
use crate::message::{DoneMatching, Frame, Request};

pub const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Output the server produced outside any pending call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideChannel {
    pub out: String,
    pub err: String,
    pub frames: Vec<Frame>,
}

impl SideChannel {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn record(&mut self, frame: Frame) {
        if let Some(out) = frame.out.as_deref() {
            self.out.push_str(out);
        }
        if let Some(err) = frame.err.as_deref() {
            self.err.push_str(err);
        }
        self.frames.push(frame);
    }
}

/// Sends a clone request and returns the new session token.
#[tracing::instrument(level = "debug", skip(connection), fields(peer = connection.peer()))]
pub async fn clone_session<S>(
    connection: &mut Connection<S>,
    timeout: Duration,
    done_matching: DoneMatching,
) -> Result<String, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Request::new("clone");
    connection.send(&request).await?;
    let frames = collect_until_done(connection, &request, timeout, done_matching, |_| {}).await?;
    frames
        .iter()
        .find_map(|frame| frame.new_session.clone())
        .or_else(|| frames.iter().find_map(|frame| frame.session.clone()))
        .ok_or_else(|| TransportError::Protocol {
            message: "clone response carried neither 'new-session' nor 'session'".to_string(),
            frames,
        })
}

async fn collect_until_done<S, F>(
    connection: &mut Connection<S>,
    request: &Request,
    timeout: Duration,
    done_matching: DoneMatching,
    mut on_unsolicited: F,
) -> Result<Vec<Frame>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Frame),
{
    let deadline = Instant::now() + timeout;
    let mut frames = Vec::new();
    loop {
        let next = match connection.read_frame_until(deadline).await {
            Ok(next) => next,
            Err(error) => return Err(error.with_partial_frames(frames)),
        };
        let Some(frame) = next else {
            tracing::debug!(
                op = request.op.as_str(),
                id = request.id.as_str(),
                frames = frames.len(),
                "call deadline elapsed"
            );
            return Err(TransportError::Timeout {
                op: request.op.clone(),
                timeout_ms: duration_ms(timeout),
                frames,
            });
        };
        if done_matching == DoneMatching::Correlated && frame.belongs_elsewhere(&request.id) {
            on_unsolicited(frame);
            continue;
        }
        let completes = frame.completes(&request.id, done_matching);
        frames.push(frame);
        if completes {
            return Ok(frames);
        }
    }
}

/// A cloned server session bound to one connection.
///
/// Calls take `&mut self`, so a session never has two requests in flight.
#[derive(Debug)]
pub struct Session<S = TcpStream> {
    id: String,
    connection: Connection<S>,
    done_matching: DoneMatching,
    side_channel: SideChannel,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Clones a fresh session over `connection` and takes ownership of it.
    pub async fn establish(
        mut connection: Connection<S>,
        clone_timeout: Duration,
        done_matching: DoneMatching,
    ) -> Result<Self, TransportError> {
        let id = clone_session(&mut connection, clone_timeout, done_matching).await?;
        tracing::debug!(session = id.as_str(), "session established");
        Ok(Self {
            id,
            connection,
            done_matching,
            side_channel: SideChannel::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Writes one request and collects its frames until the matching "done".
    ///
    /// Frames tagged with another request's id are diverted to the side channel.
    #[tracing::instrument(level = "debug", skip(self, code), fields(session = self.id.as_str()))]
    pub async fn call(
        &mut self,
        op: &str,
        code: Option<&str>,
        ns: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Frame>, TransportError> {
        let mut request = Request::new(op);
        request.session = Some(self.id.clone());
        request.code = code.map(str::to_string);
        request.ns = ns.map(str::to_string);
        self.connection.send(&request).await?;

        let side_channel = &mut self.side_channel;
        collect_until_done(
            &mut self.connection,
            &request,
            timeout,
            self.done_matching,
            |frame| {
                tracing::debug!(
                    id = frame.id.as_deref().unwrap_or("-"),
                    "unsolicited frame captured"
                );
                side_channel.record(frame);
            },
        )
        .await
    }

    pub async fn eval(
        &mut self,
        code: &str,
        timeout: Duration,
    ) -> Result<Vec<Frame>, TransportError> {
        self.call("eval", Some(code), None, timeout).await
    }

    /// Waits until `deadline` for one frame that no call is waiting on.
    ///
    /// The frame is recorded in the side channel and also returned.
    pub async fn read_unsolicited_until(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<Frame>, TransportError> {
        let Some(frame) = self.connection.read_frame_until(deadline).await? else {
            return Ok(None);
        };
        self.side_channel.record(frame.clone());
        Ok(Some(frame))
    }

    /// Returns and clears the accumulated side-channel output.
    pub fn take_side_channel(&mut self) -> SideChannel {
        std::mem::take(&mut self.side_channel)
    }

    /// Asks the server to drop the session, then shuts the connection down.
    pub async fn close(mut self) -> Result<(), TransportError> {
        let mut request = Request::new("close");
        request.session = Some(self.id.clone());
        if let Err(error) = self.connection.send(&request).await {
            tracing::debug!(%error, "session close request not delivered");
        }
        self.connection.shutdown().await
    }
}
