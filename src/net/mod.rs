//! Commits sync transport.
//!
//! ```text
//!   SyncClient ──GetCommits──▶ serve() ──read lock──▶ Chain (CommitSource)
//!              ◀──Commits / SyncError──
//! ```
//!
//! One request in flight per connection. A `SyncError` reply leaves the
//! connection usable for the next request.

pub mod message;
pub mod server;

pub use message::{read_message, write_message, Message, SyncRejection, MAX_MESSAGE_SIZE, PROTOCOL_MAGIC};
pub use server::{serve, SyncClient, REQUEST_TIMEOUT};

use thiserror::Error;

use crate::sync::{SyncError, SyncErrorCode};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] postcard::Error),
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request timed out")]
    Timeout,
    #[error("peer refused sync: {code:?} ({reason})")]
    SyncRejected { code: SyncErrorCode, reason: String },
    #[error("invalid commits response: {0}")]
    InvalidResponse(#[from] SyncError),
}
