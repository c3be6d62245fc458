//! Http forward proxy

use thiserror::Error;

pub mod protocol;
pub use protocol::{
    format_reply, format_request, read_header_block, read_reply, read_request, write_reply,
    write_request, BodyFraming, Dispatch, Headers, Reply, Request,
};

pub mod body;
pub use body::{relay_body, relay_chunked, relay_exact};

pub mod tunnel;
pub use tunnel::tunnel;

pub mod handler;
pub use handler::{ConnectionHandler, Outcome};

pub(crate) const MAX_HEADER: usize = 64;
pub(crate) const MAX_HEADER_SIZE: usize = 65535;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended")]
    StreamEnded,
    #[error("malformed stream")]
    MalformedStream,
    #[error("malformed request line {0:?}")]
    MalformedRequest(String),
    #[error("malformed reply")]
    MalformedReply,
    #[error("header too large")]
    HeaderTooLarge,
    #[error("invalid content length {0:?}")]
    InvalidContentLength(String),
    #[error("invalid chunk size {0:?}")]
    InvalidChunkSize(String),
    #[error("truncated body ({received} of {expected} bytes)")]
    TruncatedBody { expected: u64, received: u64 },
}
