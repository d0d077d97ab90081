//! UTXO snapshots for fast bootstrap.
//!
//! A snapshot is the full UTXO set at some block plus its commitment. They
//! are written off the block-connection path by a writer thread, at most one
//! at a time, each as one atomic sled batch. The retained set is bounded and
//! pruned with a preference for keeping finalized snapshots.
//!
//! Tree layout:
//!
//! ```text
//! 'm' | id (4, BE)                 -> SnapshotMeta
//! 'u' | id (4, BE) | outpoint (36) -> Utxo
//! 'n'                              -> next id (4, BE)
//! ```

use serde::{Deserialize, Serialize};
use sled::{Batch, Tree};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::chain::ChainEvent;
use crate::commitment::UtxoCommitment;
use crate::params::SnapshotParams;
use crate::types::{short_hex, Hash, Height, OutPoint, Utxo};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("snapshot {0} not found")]
    NotFound(u32),
    #[error("snapshot {id} commitment mismatch")]
    CommitmentMismatch { id: u32 },
    #[error("snapshot writer panicked")]
    WriterPanicked,
}

const NEXT_ID_KEY: &[u8] = b"n";

fn meta_key(id: u32) -> Vec<u8> {
    let mut key = vec![b'm'];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn utxo_prefix(id: u32) -> Vec<u8> {
    let mut key = vec![b'u'];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn utxo_key(id: u32, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = utxo_prefix(id);
    key.extend_from_slice(&outpoint.key());
    key
}

/// Snapshot taken after the last block of every interval
pub fn is_snapshot_height(height: Height, interval: u64) -> bool {
    (height + 1) % interval == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: u32,
    pub block_hash: Hash,
    pub height: Height,
    pub stake_modifier: Hash,
    pub commitment_hash: Hash,
    pub utxo_count: u64,
    pub finalized: bool,
}

/// Retained snapshots ordered by height
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotIndex {
    snapshots: Vec<SnapshotMeta>,
    next_id: u32,
}

impl SnapshotIndex {
    pub fn load(tree: &Tree) -> Result<Self, SnapshotError> {
        let mut snapshots: Vec<SnapshotMeta> = tree
            .scan_prefix(b"m")
            .values()
            .map(|v| -> Result<SnapshotMeta, SnapshotError> { Ok(bincode::deserialize(&v?)?) })
            .collect::<Result<_, _>>()?;
        snapshots.sort_by_key(|s| (s.height, s.id));

        let next_id = match tree.get(NEXT_ID_KEY)? {
            Some(v) => {
                let bytes: [u8; 4] = v.as_ref().try_into().unwrap_or_default();
                u32::from_be_bytes(bytes)
            }
            None => 0,
        };
        Ok(Self { snapshots, next_id })
    }

    pub fn snapshots(&self) -> &[SnapshotMeta] {
        &self.snapshots
    }

    pub fn heights(&self) -> Vec<Height> {
        self.snapshots.iter().map(|s| s.height).collect()
    }

    fn insert(&mut self, meta: SnapshotMeta) {
        let pos = self.snapshots.partition_point(|s| s.height <= meta.height);
        self.snapshots.insert(pos, meta);
    }

    /// Index of the next snapshot to drop while over the cap
    fn eviction_candidate(&self, params: &SnapshotParams) -> Option<usize> {
        if self.snapshots.len() <= params.max_snapshots {
            return None;
        }

        let newest_finalized = self
            .snapshots
            .iter()
            .filter(|s| s.finalized)
            .map(|s| s.height)
            .max();
        if let Some(newest) = newest_finalized {
            if let Some(i) = self
                .snapshots
                .iter()
                .position(|s| !s.finalized && s.height < newest)
            {
                return Some(i);
            }
        }

        let finalized = self.snapshots.iter().filter(|s| s.finalized).count();
        if finalized > params.min_finalized {
            return self.snapshots.iter().position(|s| s.finalized);
        }

        self.snapshots
            .iter()
            .position(|s| !s.finalized)
            .or(Some(0))
    }

    /// Add `meta` and evict down to the cap; returns the evicted snapshots
    pub fn insert_and_evict(&mut self, meta: SnapshotMeta, params: &SnapshotParams) -> Vec<SnapshotMeta> {
        self.next_id = self.next_id.max(meta.id + 1);
        self.insert(meta);

        let mut evicted = Vec::new();
        while let Some(i) = self.eviction_candidate(params) {
            evicted.push(self.snapshots.remove(i));
        }
        evicted
    }
}

fn lock(index: &Mutex<SnapshotIndex>) -> MutexGuard<'_, SnapshotIndex> {
    index.lock().unwrap_or_else(|e| e.into_inner())
}

struct SnapshotJob {
    meta: SnapshotMeta,
    utxos: Vec<Utxo>,
    evicted: Vec<SnapshotMeta>,
    next_index: SnapshotIndex,
}

fn remove_snapshot(tree: &Tree, batch: &mut Batch, id: u32) -> Result<(), SnapshotError> {
    batch.remove(meta_key(id));
    for key in tree.scan_prefix(utxo_prefix(id)).keys() {
        batch.remove(key?);
    }
    Ok(())
}

fn write_snapshot(tree: &Tree, job: &SnapshotJob) -> Result<(), SnapshotError> {
    let mut batch = Batch::default();
    for old in &job.evicted {
        remove_snapshot(tree, &mut batch, old.id)?;
    }
    for utxo in &job.utxos {
        batch.insert(utxo_key(job.meta.id, &utxo.outpoint), bincode::serialize(utxo)?);
    }
    batch.insert(meta_key(job.meta.id), bincode::serialize(&job.meta)?);
    batch.insert(NEXT_ID_KEY, job.next_index.next_id.to_be_bytes().to_vec());
    tree.apply_batch(batch)?;
    tree.flush()?;
    Ok(())
}

type SnapshotWriter = fn(&Tree, &SnapshotJob) -> Result<(), SnapshotError>;

pub struct SnapshotEngine {
    tree: Tree,
    params: SnapshotParams,
    index: Arc<Mutex<SnapshotIndex>>,
    inflight: Option<JoinHandle<()>>,
    events: broadcast::Sender<ChainEvent>,
    writer: SnapshotWriter,
}

impl SnapshotEngine {
    pub fn open(
        tree: Tree,
        params: SnapshotParams,
        events: broadcast::Sender<ChainEvent>,
    ) -> Result<Self, SnapshotError> {
        let index = SnapshotIndex::load(&tree)?;
        debug!("Loaded {} snapshots", index.snapshots.len());
        Ok(Self {
            tree,
            params,
            index: Arc::new(Mutex::new(index)),
            inflight: None,
            events,
            writer: write_snapshot,
        })
    }

    pub fn params(&self) -> &SnapshotParams {
        &self.params
    }

    pub fn snapshots(&self) -> Vec<SnapshotMeta> {
        lock(&self.index).snapshots.clone()
    }

    /// Block until no snapshot write is in flight
    pub fn wait_idle(&mut self) -> Result<(), SnapshotError> {
        match self.inflight.take() {
            Some(handle) => handle.join().map_err(|_| SnapshotError::WriterPanicked),
            None => Ok(()),
        }
    }

    /// Start writing a snapshot of `utxos` at the given block.
    ///
    /// Waits for the previous write first, so a slow disk throttles block
    /// connection instead of dropping intervals.
    pub fn create(
        &mut self,
        block_hash: Hash,
        height: Height,
        stake_modifier: Hash,
        commitment: &UtxoCommitment,
        utxos: Vec<Utxo>,
    ) -> Result<(), SnapshotError> {
        self.wait_idle()?;

        let mut next_index = lock(&self.index).clone();
        let meta = SnapshotMeta {
            id: next_index.next_id,
            block_hash,
            height,
            stake_modifier,
            commitment_hash: commitment.hash(&stake_modifier),
            utxo_count: utxos.len() as u64,
            finalized: false,
        };
        let evicted = next_index.insert_and_evict(meta.clone(), &self.params);
        let job = SnapshotJob {
            meta,
            utxos,
            evicted,
            next_index,
        };

        let tree = self.tree.clone();
        let index = Arc::clone(&self.index);
        let events = self.events.clone();
        let writer = self.writer;
        self.inflight = Some(std::thread::spawn(move || {
            match writer(&tree, &job) {
                Ok(()) => {
                    *lock(&index) = job.next_index;
                    for old in &job.evicted {
                        debug!("Evicted snapshot {} at height {}", old.id, old.height);
                    }
                    info!(
                        "Snapshot {} at height {} ({} utxos, {})",
                        job.meta.id,
                        job.meta.height,
                        job.meta.utxo_count,
                        short_hex(&job.meta.commitment_hash)
                    );
                    let _ = events.send(ChainEvent::SnapshotCreated {
                        id: job.meta.id,
                        height: job.meta.height,
                        commitment_hash: job.meta.commitment_hash,
                    });
                }
                Err(e) => {
                    // keep serving the retained set, next interval retries
                    warn!("Snapshot at height {} skipped: {}", job.meta.height, e);
                }
            }
        }));
        Ok(())
    }

    /// Mark snapshots at or below `finalized_height` as finalized.
    ///
    /// `active_hash` answers which block is on the active chain at a height;
    /// snapshots of blocks that are not are dropped.
    pub fn finalize_up_to<F>(&mut self, finalized_height: Height, active_hash: F) -> Result<(), SnapshotError>
    where
        F: Fn(Height) -> Option<Hash>,
    {
        self.wait_idle()?;

        let mut index = lock(&self.index);
        let mut batch = Batch::default();
        let mut changed = false;
        let mut kept = Vec::with_capacity(index.snapshots.len());

        for mut meta in std::mem::take(&mut index.snapshots) {
            if meta.height > finalized_height || meta.finalized {
                kept.push(meta);
                continue;
            }
            changed = true;
            if active_hash(meta.height) == Some(meta.block_hash) {
                meta.finalized = true;
                batch.insert(meta_key(meta.id), bincode::serialize(&meta)?);
                debug!("Snapshot {} at height {} finalized", meta.id, meta.height);
                kept.push(meta);
            } else {
                info!("Dropping snapshot {} of orphaned block at height {}", meta.id, meta.height);
                remove_snapshot(&self.tree, &mut batch, meta.id)?;
            }
        }
        index.snapshots = kept;

        if changed {
            self.tree.apply_batch(batch)?;
        }
        Ok(())
    }

    /// Read a snapshot back and check it against its commitment
    pub fn load_snapshot(&self, id: u32) -> Result<(SnapshotMeta, Vec<Utxo>), SnapshotError> {
        let meta: SnapshotMeta = match self.tree.get(meta_key(id))? {
            Some(v) => bincode::deserialize(&v)?,
            None => return Err(SnapshotError::NotFound(id)),
        };
        let utxos: Vec<Utxo> = self
            .tree
            .scan_prefix(utxo_prefix(id))
            .values()
            .map(|v| -> Result<Utxo, SnapshotError> { Ok(bincode::deserialize(&v?)?) })
            .collect::<Result<_, _>>()?;

        let commitment = UtxoCommitment::from_utxos(&utxos);
        if commitment.hash(&meta.stake_modifier) != meta.commitment_hash {
            return Err(SnapshotError::CommitmentMismatch { id });
        }
        Ok((meta, utxos))
    }
}

impl Drop for SnapshotEngine {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!("Snapshot writer: {}", e);
        }
    }
}
