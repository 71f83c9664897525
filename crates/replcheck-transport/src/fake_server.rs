//! Scripted evaluation server for tests.
//!
//! Answers `clone` and `close` itself and hands every other request to a
//! caller-supplied responder that returns the replies to write, in order.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::bencode::{decode_prefix, encode};
use crate::message::{Frame, Request};

pub const FAKE_SESSION_ID: &str = "fake-session";

/// One scripted action taken in response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Frame(Frame),
    Pause(Duration),
    Hangup,
}

impl From<Frame> for ScriptedReply {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

/// Value reply followed by the terminating "done" frame.
pub fn value_reply(request: &Request, value: &str) -> Vec<ScriptedReply> {
    vec![
        Frame::reply(&request.id).with_value(value).into(),
        Frame::reply(&request.id).with_status(&["done"]).into(),
    ]
}

pub struct ScriptedServer {
    address: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start<F>(responder: F) -> std::io::Result<Self>
    where
        F: FnMut(&Request) -> Vec<ScriptedReply> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                serve_connection(socket, responder, recorded).await;
            }
        });
        Ok(Self {
            address,
            requests,
            handle,
        })
    }

    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Every request received so far, including `clone` and `close`.
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection<F>(mut socket: TcpStream, mut responder: F, recorded: Arc<Mutex<Vec<Request>>>)
where
    F: FnMut(&Request) -> Vec<ScriptedReply>,
{
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        while let Ok(Some((value, used))) = decode_prefix(&buffer) {
            buffer.drain(..used);
            let Some(request) = Request::from_bencode(&value) else {
                continue;
            };
            if let Ok(mut requests) = recorded.lock() {
                requests.push(request.clone());
            }
            let replies = match request.op.as_str() {
                "clone" => {
                    let mut reply = Frame::reply(&request.id).with_status(&["done"]);
                    reply.new_session = Some(FAKE_SESSION_ID.to_string());
                    vec![reply.into()]
                }
                "close" => Vec::new(),
                _ => responder(&request),
            };
            for reply in replies {
                match reply {
                    ScriptedReply::Frame(frame) => {
                        if socket.write_all(&encode(&frame.to_bencode())).await.is_err() {
                            return;
                        }
                    }
                    ScriptedReply::Pause(duration) => tokio::time::sleep(duration).await,
                    ScriptedReply::Hangup => return,
                }
            }
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
        }
    }
}
