//! Wire messages and framing.
//!
//! Frame: MAGIC (4) + LENGTH (4, LE) + CHECKSUM (4) + postcard PAYLOAD.
//! The checksum is the first four bytes of SHA3-256 over the payload.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::NetError;
use crate::sync::{CommitsResponse, GetCommits, SyncErrorCode, MAX_LOCATOR_SIZE};
use crate::types::sha3;

pub const PROTOCOL_MAGIC: [u8; 4] = *b"ESPZ";

/// Largest frame accepted before reading the payload
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const MAX_SMALL_MESSAGE: usize = 1024;

/// Negative answer to a `GetCommits`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRejection {
    pub code: SyncErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    GetCommits(GetCommits),
    Commits(CommitsResponse),
    SyncError(SyncRejection),
    Ping(u64),
    Pong(u64),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::GetCommits(_) => "getcommits",
            Message::Commits(_) => "commits",
            Message::SyncError(_) => "syncerror",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }

    pub fn max_size_for_command(cmd: &str) -> usize {
        match cmd {
            "commits" => MAX_MESSAGE_SIZE,
            // tag, locator length, hashes, optional stop hash
            "getcommits" => MAX_LOCATOR_SIZE * 32 + 37,
            _ => MAX_SMALL_MESSAGE,
        }
    }

    fn validate_collection_sizes(&self) -> bool {
        match self {
            Message::GetCommits(request) => request.locator.len() <= MAX_LOCATOR_SIZE,
            _ => true,
        }
    }
}

fn compute_checksum(data: &[u8]) -> [u8; 4] {
    let hash = sha3(data);
    [hash[0], hash[1], hash[2], hash[3]]
}

pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &Message) -> Result<(), NetError> {
    let data = postcard::to_allocvec(msg)?;
    let max_size = Message::max_size_for_command(msg.command());
    if data.len() > max_size {
        return Err(NetError::MessageTooLarge(data.len(), max_size));
    }

    let checksum = compute_checksum(&data);

    writer.write_all(&PROTOCOL_MAGIC).await?;
    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&checksum).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message, NetError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != PROTOCOL_MAGIC {
        return Err(NetError::InvalidMagic);
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    // checked before allocating the payload
    if len > MAX_MESSAGE_SIZE {
        return Err(NetError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut checksum = [0u8; 4];
    reader.read_exact(&mut checksum).await?;

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    if compute_checksum(&data) != checksum {
        return Err(NetError::InvalidChecksum);
    }

    let msg: Message = postcard::from_bytes(&data)?;

    if !msg.validate_collection_sizes() {
        return Err(NetError::Protocol("collection size limit exceeded".into()));
    }

    let max_size = Message::max_size_for_command(msg.command());
    if len > max_size {
        return Err(NetError::MessageTooLarge(len, max_size));
    }

    Ok(msg)
}
