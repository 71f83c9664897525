//! Session-aware client transport for bencode evaluation servers.
//!
//! Frames requests onto a TCP stream, decodes response frames, clones a
//! server session and correlates each call with its "done" frame under an
//! explicit deadline.

pub mod bencode;
mod connection;
mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake_server;
mod message;
mod session;

pub use bencode::{BencodeError, BencodeValue};
pub use connection::Connection;
pub use error::TransportError;
pub use message::{
    joined_err, joined_out, last_value, new_request_id, remote_failure, DoneMatching, Frame,
    Request, STATUS_DONE, STATUS_ERROR, STATUS_EVAL_ERROR,
};
pub use session::{
    clone_session, SideChannel, Session, DEFAULT_CALL_TIMEOUT, DEFAULT_CLONE_TIMEOUT,
};
