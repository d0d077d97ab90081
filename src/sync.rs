//! Commits sync: catch a peer up on finalization-relevant history.
//!
//! The requester sends a locator of block hashes it has. The server picks the
//! highest one it recognizes and answers with one commit record per block
//! after it: the header plus the block's finalizer transactions, each with a
//! Merkle proof against the header's `tx_root`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::DbError;
use crate::epoch::{checkpoint_height, epoch_of};
use crate::merkle::MerkleProof;
use crate::types::{short_hex, Block, BlockHeader, Epoch, Hash, Height, Transaction};

pub const MAX_LOCATOR_SIZE: usize = 101;
pub const MAX_COMMITS_PER_RESPONSE: usize = 500;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("empty locator")]
    EmptyLocator,
    #[error("locator has {0} hashes")]
    LocatorTooLong(usize),
    #[error("no locator hash recognized")]
    UnknownLocator,
    #[error("commit at height {0} does not link")]
    Unlinked(Height),
    #[error("bad commit proof at height {0}")]
    BadProof(Height),
    #[error("storage: {0}")]
    Db(#[from] DbError),
}

/// Wire form of a server-side `SyncError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorCode {
    EmptyLocator,
    LocatorTooLong,
    UnknownLocator,
    Internal,
}

impl SyncError {
    pub fn code(&self) -> SyncErrorCode {
        match self {
            SyncError::EmptyLocator => SyncErrorCode::EmptyLocator,
            SyncError::LocatorTooLong(_) => SyncErrorCode::LocatorTooLong,
            SyncError::UnknownLocator => SyncErrorCode::UnknownLocator,
            _ => SyncErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCommits {
    pub locator: Vec<Hash>,
    /// Stop after this block instead of the tip
    pub stop: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerCommit {
    pub tx: Transaction,
    pub proof: MerkleProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub header: BlockHeader,
    pub commits: Vec<FinalizerCommit>,
}

impl CommitRecord {
    pub fn from_block(block: &Block) -> Self {
        let tree = block.tx_tree();
        let commits = block
            .transactions
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_finalizer_commit())
            .filter_map(|(i, tx)| {
                tree.proof(i).map(|proof| FinalizerCommit {
                    tx: tx.clone(),
                    proof,
                })
            })
            .collect();
        Self {
            header: block.header.clone(),
            commits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitsStatus {
    TipReached,
    StopReached,
    LengthExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitsResponse {
    pub status: CommitsStatus,
    pub data: Vec<CommitRecord>,
}

impl CommitsResponse {
    pub fn heights(&self) -> Vec<Height> {
        self.data.iter().map(|r| r.header.height).collect()
    }
}

/// Chain view the server answers from
pub trait CommitSource {
    fn active_height_of(&self, hash: &Hash) -> Result<Option<Height>, DbError>;
    fn active_block_at(&self, height: Height) -> Result<Block, DbError>;
    fn tip_height(&self) -> Height;
    fn epoch_length(&self) -> u64;
    fn last_justified_epoch(&self) -> Epoch;
    fn last_finalized_epoch(&self) -> Epoch;
}

// ============================================================================
// SERVER
// ============================================================================

/// Highest locator height on the active chain within justified history
pub fn find_start<S: CommitSource + ?Sized>(source: &S, locator: &[Hash]) -> Result<Height, SyncError> {
    if locator.is_empty() {
        return Err(SyncError::EmptyLocator);
    }
    if locator.len() > MAX_LOCATOR_SIZE {
        return Err(SyncError::LocatorTooLong(locator.len()));
    }

    let justified = source.last_justified_epoch();
    let epoch_length = source.epoch_length();
    let mut best = None;
    for hash in locator {
        let Some(height) = source.active_height_of(hash)? else {
            continue;
        };
        if epoch_of(height, epoch_length) > justified {
            debug!("Locator {} at height {} beyond justified epoch", short_hex(hash), height);
            continue;
        }
        best = best.max(Some(height));
    }
    best.ok_or(SyncError::UnknownLocator)
}

pub fn get_commits<S: CommitSource + ?Sized>(source: &S, request: &GetCommits) -> Result<CommitsResponse, SyncError> {
    get_commits_limited(source, request, MAX_COMMITS_PER_RESPONSE)
}

pub fn get_commits_limited<S: CommitSource + ?Sized>(
    source: &S,
    request: &GetCommits,
    limit: usize,
) -> Result<CommitsResponse, SyncError> {
    let start = find_start(source, &request.locator)?;
    let tip = source.tip_height();

    let mut data = Vec::new();
    let mut status = CommitsStatus::TipReached;
    for height in start + 1..=tip {
        if data.len() >= limit {
            status = CommitsStatus::LengthExceeded;
            break;
        }
        let block = source.active_block_at(height)?;
        let hash = block.hash();
        data.push(CommitRecord::from_block(&block));
        if request.stop == Some(hash) {
            status = CommitsStatus::StopReached;
            break;
        }
    }

    info!(
        "getcommits from height {}: {} records, {:?}",
        start,
        data.len(),
        status
    );
    Ok(CommitsResponse { status, data })
}

// ============================================================================
// CLIENT
// ============================================================================

/// Locator a node sends: last finalized checkpoint, last justified checkpoint, tip
pub fn build_locator<S: CommitSource + ?Sized>(source: &S) -> Result<Vec<Hash>, SyncError> {
    let epoch_length = source.epoch_length();
    let heights = [
        checkpoint_height(source.last_finalized_epoch(), epoch_length),
        checkpoint_height(source.last_justified_epoch(), epoch_length),
        source.tip_height(),
    ];

    let mut locator = Vec::with_capacity(heights.len());
    for height in heights {
        let hash = source.active_block_at(height)?.hash();
        if !locator.contains(&hash) {
            locator.push(hash);
        }
    }
    Ok(locator)
}

/// Check that `response` continues one of `locator`'s blocks and that every
/// carried transaction is proven against its header.
pub fn verify_response(locator: &[Hash], response: &CommitsResponse) -> Result<(), SyncError> {
    let mut prev: Option<Hash> = None;
    for record in &response.data {
        let height = record.header.height;
        let linked = match prev {
            None => locator.contains(&record.header.prev_hash),
            Some(hash) => record.header.prev_hash == hash,
        };
        if !linked {
            return Err(SyncError::Unlinked(height));
        }

        for commit in &record.commits {
            if !commit.tx.is_finalizer_commit()
                || !commit.proof.verify(commit.tx.txid(), record.header.tx_root)
            {
                return Err(SyncError::BadProof(height));
            }
        }
        prev = Some(record.header.hash());
    }
    Ok(())
}
