//! Sled-based storage layer

use sled::transaction::{TransactionError, TransactionResult, Transactional};
use sled::{Batch, Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::slashing::{SlashEvidence, VoteLog, VoteRecord};
use crate::types::{Block, Epoch, Hash, Height, OutPoint, Transaction, Utxo};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("not found")]
    NotFound,
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),
}

const META_TIP: &[u8] = b"tip";
const META_TIP_STATE: &[u8] = b"tip_state";
const META_COMMITMENT: &[u8] = b"commitment";
const META_PARAMS: &[u8] = b"params";

fn tx_error(e: TransactionError<DbError>) -> DbError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => DbError::Sled(e),
    }
}

fn hash_from(bytes: &[u8]) -> Result<Hash, DbError> {
    bytes.try_into().map_err(|_| DbError::Corrupt("hash length"))
}

fn be_u64(bytes: &[u8]) -> Result<u64, DbError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| DbError::Corrupt("u64 key length"))?;
    Ok(u64::from_be_bytes(arr))
}

/// `len (2, BE) | validator` prefix shared by all votes of one validator
fn vote_prefix(validator: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + validator.len() + 8);
    key.extend_from_slice(&(validator.len() as u16).to_be_bytes());
    key.extend_from_slice(validator);
    key
}

fn vote_key(record: &VoteRecord) -> Vec<u8> {
    let vote = record.vote();
    let mut key = vote_prefix(&vote.validator);
    key.extend_from_slice(&vote.target_epoch.to_be_bytes());
    key
}

/// Validator and target epoch back out of a vote key
fn split_vote_key(key: &[u8]) -> Result<(&[u8], Epoch), DbError> {
    let len_bytes: [u8; 2] = key
        .get(..2)
        .and_then(|b| b.try_into().ok())
        .ok_or(DbError::Corrupt("vote key"))?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    let validator = key.get(2..2 + len).ok_or(DbError::Corrupt("vote key"))?;
    let epoch = key.get(2 + len..).ok_or(DbError::Corrupt("vote key"))?;
    Ok((validator, be_u64(epoch)?))
}

/// Everything one connected block changes, written in a single transaction
pub struct BlockUpdate<'a> {
    pub block: &'a Block,
    pub spent: &'a [Utxo],
    pub created: &'a [Utxo],
    /// Serialized finalization state after the block
    pub state: &'a [u8],
    /// Also keep `state` as a per-checkpoint record
    pub checkpoint_record: bool,
    pub commitment: &'a [u8],
    /// Attributable votes the block adds to the vote log
    pub votes: &'a [VoteRecord],
    /// Evidence detected from those votes
    pub evidence: &'a [SlashEvidence],
}

/// Inverse of a `BlockUpdate`
pub struct BlockRevert<'a> {
    pub block: &'a Block,
    pub spent: &'a [Utxo],
    pub created: &'a [Utxo],
    pub prev_state: &'a [u8],
    pub prev_commitment: &'a [u8],
}

#[derive(Clone)]
pub struct Storage {
    db: Db,
    blocks: Tree,
    heights: Tree,
    undo: Tree,
    utxo: Tree,
    states: Tree,
    meta: Tree,
    votes: Tree,
    evidence: Tree,
    mempool: Tree,
    snapshots: Tree,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        let heights = db.open_tree("heights")?;
        let undo = db.open_tree("undo")?;
        let utxo = db.open_tree("utxo")?;
        let states = db.open_tree("states")?;
        let meta = db.open_tree("meta")?;
        let votes = db.open_tree("votes")?;
        let evidence = db.open_tree("evidence")?;
        let mempool = db.open_tree("mempool")?;
        let snapshots = db.open_tree("snapshots")?;
        Ok(Self {
            db,
            blocks,
            heights,
            undo,
            utxo,
            states,
            meta,
            votes,
            evidence,
            mempool,
            snapshots,
        })
    }

    pub fn flush(&self) -> Result<(), DbError> {
        self.db.flush()?;
        Ok(())
    }

    /// Snapshot tree, written by the snapshot engine
    pub fn snapshots_tree(&self) -> Tree {
        self.snapshots.clone()
    }

    // Params

    pub fn params_fingerprint(&self) -> Result<Option<Hash>, DbError> {
        self.meta
            .get(META_PARAMS)?
            .map(|v| hash_from(&v))
            .transpose()
    }

    pub fn put_params_fingerprint(&self, fingerprint: &Hash) -> Result<(), DbError> {
        self.meta.insert(META_PARAMS, &fingerprint[..])?;
        Ok(())
    }

    // Blocks

    pub fn put_block(&self, block: &Block) -> Result<(), DbError> {
        let value = bincode::serialize(block)?;
        self.blocks.insert(block.hash(), value)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Block, DbError> {
        let value = self.blocks.get(hash)?.ok_or(DbError::NotFound)?;
        Ok(bincode::deserialize(&value)?)
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool, DbError> {
        Ok(self.blocks.contains_key(hash)?)
    }

    /// Hash of the active-chain block at `height`
    pub fn hash_at(&self, height: Height) -> Result<Option<Hash>, DbError> {
        self.heights
            .get(height.to_be_bytes())?
            .map(|v| hash_from(&v))
            .transpose()
    }

    pub fn block_at(&self, height: Height) -> Result<Block, DbError> {
        let hash = self.hash_at(height)?.ok_or(DbError::NotFound)?;
        self.get_block(&hash)
    }

    /// Height of `hash` if it is on the active chain
    pub fn active_height_of(&self, hash: &Hash) -> Result<Option<Height>, DbError> {
        let Some(value) = self.blocks.get(hash)? else {
            return Ok(None);
        };
        let block: Block = bincode::deserialize(&value)?;
        let height = block.height();
        Ok((self.hash_at(height)? == Some(*hash)).then_some(height))
    }

    /// Active chain hashes from genesis to tip
    pub fn active_chain(&self) -> Result<Vec<Hash>, DbError> {
        self.heights
            .iter()
            .values()
            .map(|v| -> Result<Hash, DbError> { hash_from(&v?) })
            .collect()
    }

    pub fn tip(&self) -> Result<Option<Hash>, DbError> {
        self.meta.get(META_TIP)?.map(|v| hash_from(&v)).transpose()
    }

    pub fn tip_state(&self) -> Result<Vec<u8>, DbError> {
        Ok(self.meta.get(META_TIP_STATE)?.ok_or(DbError::NotFound)?.to_vec())
    }

    pub fn commitment(&self) -> Result<Vec<u8>, DbError> {
        Ok(self.meta.get(META_COMMITMENT)?.ok_or(DbError::NotFound)?.to_vec())
    }

    /// Newest per-checkpoint state record at or below `height`
    pub fn state_record_at_or_below(&self, height: Height) -> Result<Option<(Height, Vec<u8>)>, DbError> {
        match self.states.range(..=height.to_be_bytes()).next_back() {
            Some(item) => {
                let (key, value) = item?;
                Ok(Some((be_u64(&key)?, value.to_vec())))
            }
            None => Ok(None),
        }
    }

    pub fn undo(&self, hash: &Hash) -> Result<Vec<Utxo>, DbError> {
        let value = self.undo.get(hash)?.ok_or(DbError::NotFound)?;
        Ok(bincode::deserialize(&value)?)
    }

    pub fn connect_block(&self, update: &BlockUpdate) -> Result<(), DbError> {
        self.put_block(update.block)?;

        let hash = update.block.hash();
        let height_key = update.block.height().to_be_bytes();
        let undo = bincode::serialize(update.spent)?;

        let mut utxo_batch = Batch::default();
        for u in update.spent {
            utxo_batch.remove(&u.outpoint.key()[..]);
        }
        for u in update.created {
            utxo_batch.insert(&u.outpoint.key()[..], bincode::serialize(u)?);
        }
        let votes = update
            .votes
            .iter()
            .map(|r| Ok((vote_key(r), bincode::serialize(r)?)))
            .collect::<Result<Vec<_>, DbError>>()?;
        let evidence = update
            .evidence
            .iter()
            .map(|e| Ok((e.validator().clone(), bincode::serialize(e)?)))
            .collect::<Result<Vec<_>, DbError>>()?;

        let trees = (
            &self.utxo,
            &self.heights,
            &self.undo,
            &self.states,
            &self.meta,
            &self.votes,
            &self.evidence,
        );
        let result: TransactionResult<(), DbError> = trees.transaction(
            |(utxo, heights, undo_tree, states, meta, vote_tree, evidence_tree)| {
                utxo.apply_batch(&utxo_batch)?;
                heights.insert(&height_key[..], &hash[..])?;
                undo_tree.insert(&hash[..], undo.as_slice())?;
                if update.checkpoint_record {
                    states.insert(&height_key[..], update.state)?;
                }
                meta.insert(META_TIP, &hash[..])?;
                meta.insert(META_TIP_STATE, update.state)?;
                meta.insert(META_COMMITMENT, update.commitment)?;
                // first record per key wins, as in the mempool path
                for (key, value) in &votes {
                    if vote_tree.get(key.as_slice())?.is_none() {
                        vote_tree.insert(key.as_slice(), value.as_slice())?;
                    }
                }
                for (key, value) in &evidence {
                    if evidence_tree.get(key.as_slice())?.is_none() {
                        evidence_tree.insert(key.as_slice(), value.as_slice())?;
                    }
                }
                Ok(())
            },
        );
        result.map_err(tx_error)
    }

    pub fn disconnect_block(&self, revert: &BlockRevert) -> Result<(), DbError> {
        let hash = revert.block.hash();
        let prev_hash = revert.block.header.prev_hash;
        let height_key = revert.block.height().to_be_bytes();

        let mut utxo_batch = Batch::default();
        for u in revert.created {
            utxo_batch.remove(&u.outpoint.key()[..]);
        }
        for u in revert.spent {
            utxo_batch.insert(&u.outpoint.key()[..], bincode::serialize(u)?);
        }

        let result: TransactionResult<(), DbError> =
            (&self.utxo, &self.heights, &self.undo, &self.states, &self.meta).transaction(
                |(utxo, heights, undo_tree, states, meta)| {
                    utxo.apply_batch(&utxo_batch)?;
                    heights.remove(&height_key[..])?;
                    undo_tree.remove(&hash[..])?;
                    states.remove(&height_key[..])?;
                    meta.insert(META_TIP, &prev_hash[..])?;
                    meta.insert(META_TIP_STATE, revert.prev_state)?;
                    meta.insert(META_COMMITMENT, revert.prev_commitment)?;
                    Ok(())
                },
            );
        result.map_err(tx_error)
    }

    /// Drop everything derived from blocks; blocks themselves stay
    pub fn clear_derived(&self) -> Result<(), DbError> {
        for tree in [
            &self.heights,
            &self.undo,
            &self.utxo,
            &self.states,
            &self.votes,
            &self.evidence,
            &self.snapshots,
        ] {
            tree.clear()?;
        }
        for key in [META_TIP, META_TIP_STATE, META_COMMITMENT] {
            self.meta.remove(key)?;
        }
        Ok(())
    }

    // Vote log upkeep

    /// Drop logged votes for which `keep(validator, target_epoch)` is false
    pub fn prune_votes<F>(&self, keep: F) -> Result<usize, DbError>
    where
        F: Fn(&[u8], Epoch) -> bool,
    {
        let mut batch = Batch::default();
        let mut pruned = 0;
        for key in self.votes.iter().keys() {
            let key = key?;
            let (validator, epoch) = split_vote_key(&key)?;
            if !keep(validator, epoch) {
                batch.remove(key);
                pruned += 1;
            }
        }
        self.votes.apply_batch(batch)?;
        Ok(pruned)
    }

    /// Drop evidence against validators for which `keep` is false
    pub fn prune_evidence<F>(&self, keep: F) -> Result<usize, DbError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut batch = Batch::default();
        let mut pruned = 0;
        for key in self.evidence.iter().keys() {
            let key = key?;
            if !keep(&key) {
                batch.remove(key);
                pruned += 1;
            }
        }
        self.evidence.apply_batch(batch)?;
        Ok(pruned)
    }

    pub fn all_evidence(&self) -> Result<Vec<SlashEvidence>, DbError> {
        self.evidence
            .iter()
            .values()
            .map(|v| -> Result<SlashEvidence, DbError> { Ok(bincode::deserialize(&v?)?) })
            .collect()
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    // UTXO

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, DbError> {
        self.utxo
            .get(outpoint.key())?
            .map(|v| bincode::deserialize(&v).map_err(DbError::from))
            .transpose()
    }

    pub fn all_utxos(&self) -> Result<Vec<Utxo>, DbError> {
        self.utxo
            .iter()
            .values()
            .map(|v| -> Result<Utxo, DbError> { Ok(bincode::deserialize(&v?)?) })
            .collect()
    }

    // Mempool

    pub fn put_mempool_tx(&self, seq: u64, tx: &Transaction) -> Result<(), DbError> {
        self.mempool.insert(seq.to_be_bytes(), bincode::serialize(tx)?)?;
        Ok(())
    }

    pub fn remove_mempool_tx(&self, seq: u64) -> Result<(), DbError> {
        self.mempool.remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Persisted mempool in admission order
    pub fn load_mempool(&self) -> Result<Vec<(u64, Transaction)>, DbError> {
        self.mempool
            .iter()
            .map(|item| -> Result<(u64, Transaction), DbError> {
                let (key, value) = item?;
                Ok((be_u64(&key)?, bincode::deserialize(&value)?))
            })
            .collect()
    }

    pub fn clear_mempool(&self) -> Result<(), DbError> {
        self.mempool.clear()?;
        Ok(())
    }
}

impl VoteLog for Storage {
    fn votes_of(&self, validator: &[u8]) -> Result<Vec<VoteRecord>, DbError> {
        self.votes
            .scan_prefix(vote_prefix(validator))
            .values()
            .map(|v| -> Result<VoteRecord, DbError> { Ok(bincode::deserialize(&v?)?) })
            .collect()
    }

    fn record_vote(&self, record: &VoteRecord) -> Result<(), DbError> {
        let value = bincode::serialize(record)?;
        // first vote per (validator, target_epoch) wins
        let _ = self
            .votes
            .compare_and_swap(vote_key(record), None as Option<&[u8]>, Some(value))?;
        Ok(())
    }

    fn evidence_of(&self, validator: &[u8]) -> Result<Option<SlashEvidence>, DbError> {
        self.evidence
            .get(validator)?
            .map(|v| bincode::deserialize(&v).map_err(DbError::from))
            .transpose()
    }

    fn record_evidence(&self, evidence: &SlashEvidence) -> Result<(), DbError> {
        let value = bincode::serialize(evidence)?;
        let _ = self.evidence.compare_and_swap(
            evidence.validator().as_slice(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        Ok(())
    }
}
