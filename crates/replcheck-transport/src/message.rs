use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use replcheck_core::current_unix_timestamp_ms;

use crate::bencode::BencodeValue;

pub const STATUS_DONE: &str = "done";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_EVAL_ERROR: &str = "eval-error";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique request id.
pub fn new_request_id() -> String {
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("replcheck-{}-{count}", current_unix_timestamp_ms())
}

/// How a pending call recognizes its terminating "done" frame.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoneMatching {
    /// Only a "done" frame carrying the request's id completes the call.
    #[default]
    Correlated,
    /// Any "done" frame completes the call and every frame is attributed to it.
    Legacy,
}

/// One request written to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: String,
    pub id: String,
    pub session: Option<String>,
    pub code: Option<String>,
    pub ns: Option<String>,
}

impl Request {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            id: new_request_id(),
            session: None,
            code: None,
            ns: None,
        }
    }

    pub fn to_bencode(&self) -> BencodeValue {
        let mut entries = BTreeMap::new();
        entries.insert(b"op".to_vec(), BencodeValue::text(&self.op));
        entries.insert(b"id".to_vec(), BencodeValue::text(&self.id));
        let optional = [
            ("session", &self.session),
            ("code", &self.code),
            ("ns", &self.ns),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                entries.insert(key.as_bytes().to_vec(), BencodeValue::text(value));
            }
        }
        BencodeValue::Dict(entries)
    }

    /// Reads a request back from the wire; used by server-side test doubles.
    pub fn from_bencode(value: &BencodeValue) -> Option<Self> {
        let BencodeValue::Dict(entries) = value else {
            return None;
        };
        let text = |key: &str| entries.get(key.as_bytes()).and_then(BencodeValue::as_text);
        Some(Self {
            op: text("op")?,
            id: text("id").unwrap_or_default(),
            session: text("session"),
            code: text("code"),
            ns: text("ns"),
        })
    }
}

/// One decoded response unit. Byte payloads are already decoded to text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub session: Option<String>,
    pub status: Vec<String>,
    pub value: Option<String>,
    pub out: Option<String>,
    pub err: Option<String>,
    pub ns: Option<String>,
    pub new_session: Option<String>,
    pub ex: Option<String>,
    pub root_ex: Option<String>,
    pub extra: BTreeMap<String, BencodeValue>,
}

impl Frame {
    /// Decodes a frame; `None` when the value is not a dictionary.
    pub fn from_bencode(value: BencodeValue) -> Option<Self> {
        let BencodeValue::Dict(entries) = value else {
            return None;
        };
        let mut frame = Frame::default();
        for (key, item) in entries {
            let key = String::from_utf8_lossy(&key).into_owned();
            match key.as_str() {
                "id" => frame.id = item.as_text(),
                "session" => frame.session = item.as_text(),
                "value" => frame.value = item.as_text(),
                "out" => frame.out = item.as_text(),
                "err" => frame.err = item.as_text(),
                "ns" => frame.ns = item.as_text(),
                "new-session" => frame.new_session = item.as_text(),
                "ex" => frame.ex = item.as_text(),
                "root-ex" => frame.root_ex = item.as_text(),
                "status" => {
                    frame.status = match item {
                        BencodeValue::List(tokens) => {
                            tokens.iter().filter_map(BencodeValue::as_text).collect()
                        }
                        single => single.as_text().into_iter().collect(),
                    }
                }
                _ => {
                    frame.extra.insert(key, item);
                }
            }
        }
        Some(frame)
    }

    pub fn to_bencode(&self) -> BencodeValue {
        let mut entries = BTreeMap::new();
        let optional = [
            ("id", &self.id),
            ("session", &self.session),
            ("value", &self.value),
            ("out", &self.out),
            ("err", &self.err),
            ("ns", &self.ns),
            ("new-session", &self.new_session),
            ("ex", &self.ex),
            ("root-ex", &self.root_ex),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                entries.insert(key.as_bytes().to_vec(), BencodeValue::text(value));
            }
        }
        if !self.status.is_empty() {
            entries.insert(
                b"status".to_vec(),
                BencodeValue::List(self.status.iter().map(BencodeValue::text).collect()),
            );
        }
        for (key, value) in &self.extra {
            entries.insert(key.as_bytes().to_vec(), value.clone());
        }
        BencodeValue::Dict(entries)
    }

    /// Starts a frame answering `request_id`.
    pub fn reply(request_id: &str) -> Self {
        Self {
            id: Some(request_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_out(mut self, out: impl Into<String>) -> Self {
        self.out = Some(out.into());
        self
    }

    pub fn with_err(mut self, err: impl Into<String>) -> Self {
        self.err = Some(err.into());
        self
    }

    pub fn with_status(mut self, tokens: &[&str]) -> Self {
        self.status = tokens.iter().map(|token| token.to_string()).collect();
        self
    }

    pub fn has_status(&self, token: &str) -> bool {
        self.status.iter().any(|status| status == token)
    }

    pub fn is_done(&self) -> bool {
        self.has_status(STATUS_DONE)
    }

    /// True when this frame terminates the call `request_id` under `matching`.
    pub fn completes(&self, request_id: &str, matching: DoneMatching) -> bool {
        if !self.is_done() {
            return false;
        }
        match matching {
            DoneMatching::Correlated => self.id.as_deref() == Some(request_id),
            DoneMatching::Legacy => true,
        }
    }

    /// True when the frame carries an id that belongs to another request.
    pub fn belongs_elsewhere(&self, request_id: &str) -> bool {
        matches!(self.id.as_deref(), Some(id) if id != request_id)
    }
}

/// Last non-null `value` in arrival order.
pub fn last_value(frames: &[Frame]) -> Option<&str> {
    frames.iter().rev().find_map(|frame| frame.value.as_deref())
}

/// Concatenation of every `out` payload in arrival order.
pub fn joined_out(frames: &[Frame]) -> String {
    frames.iter().filter_map(|frame| frame.out.as_deref()).collect()
}

/// Concatenation of every `err` payload in arrival order.
pub fn joined_err(frames: &[Frame]) -> String {
    frames.iter().filter_map(|frame| frame.err.as_deref()).collect()
}

/// Describes an explicit remote failure, if any frame signalled one.
pub fn remote_failure(frames: &[Frame]) -> Option<String> {
    let failed = frames.iter().any(|frame| {
        frame.has_status(STATUS_EVAL_ERROR) || frame.has_status(STATUS_ERROR) || frame.ex.is_some()
    });
    if !failed {
        return None;
    }
    let exception = frames
        .iter()
        .rev()
        .find_map(|frame| frame.root_ex.as_deref().or(frame.ex.as_deref()));
    let err = joined_err(frames);
    let detail = err.trim();
    Some(match (exception, detail.is_empty()) {
        (Some(exception), true) => exception.to_string(),
        (Some(exception), false) => format!("{exception}: {detail}"),
        (None, false) => detail.to_string(),
        (None, true) => "remote reported an evaluation error".to_string(),
    })
}
