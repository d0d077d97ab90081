//! Block-connection pipeline.
//!
//! `Chain` owns the single serialized path that mutates consensus state:
//! finalization state, UTXO set and commitment, vote log, mempool and
//! snapshots all move together per connected or disconnected block.
//! Readers share it behind a lock and only ever see fully applied blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::commitment::UtxoCommitment;
use crate::db::{BlockRevert, BlockUpdate, DbError, Storage};
use crate::epoch::is_checkpoint;
use crate::mempool::{self, Mempool, MempoolError};
use crate::params::{ChainParams, ParamsError};
use crate::slashing::{check_and_record, SlashEvidence, StagedVoteLog, VoteRecord};
use crate::snapshot::{is_snapshot_height, SnapshotEngine, SnapshotError, SnapshotMeta};
use crate::state::{FinalizationEvent, FinalizationState, FinalizationStatus, RejectReason};
use crate::sync::CommitSource;
use crate::types::{
    sha3, short_hex, Block, BlockHeader, Dynasty, Epoch, Hash, Height, OutPoint, PublicKey,
    Transaction, Utxo,
};
use crate::validator::ValidatorStatus;

/// Post-states kept in memory for undo without replay
const MAX_RECENT_STATES: u64 = 100;

const EVENT_CAPACITY: usize = 1024;

/// Stake modifier of the genesis block
pub fn genesis_stake_modifier() -> Hash {
    sha3(b"ESPERANZA_GENESIS_STAKE_MODIFIER")
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("storage: {0}")]
    Db(#[from] DbError),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("params: {0}")]
    Params(#[from] ParamsError),
    #[error("data directory was created with different chain parameters")]
    ParamsMismatch,
    #[error("block {height} does not extend the tip")]
    NotOnTip { height: Height },
    #[error("block {height} has a bad transaction root")]
    BadTxRoot { height: Height },
    #[error("block {height} spends a missing output")]
    MissingInput { height: Height },
    #[error("block {height} rejected: {reason}")]
    InvalidBlock { height: Height, reason: RejectReason },
    #[error("block {height} is at or below the last finalized checkpoint")]
    FinalizedBlock { height: Height },
    #[error("finalization state at height {height} does not match replay, reindex required")]
    InconsistentState { height: Height },
}

/// Notifications for collaborators, in the order things happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BlockConnected { hash: Hash, height: Height },
    BlockDisconnected { hash: Hash, height: Height },
    EpochStarted { epoch: Epoch, dynasty: Dynasty },
    Justified { epoch: Epoch, hash: Hash },
    Finalized { epoch: Epoch, hash: Hash },
    ValidatorStatusChanged { validator: PublicKey, status: ValidatorStatus },
    SlashDetected { validator: PublicKey, txid: Hash },
    SnapshotCreated { id: u32, height: Height, commitment_hash: Hash },
}

impl From<FinalizationEvent> for ChainEvent {
    fn from(event: FinalizationEvent) -> Self {
        match event {
            FinalizationEvent::EpochStarted { epoch, dynasty } => ChainEvent::EpochStarted { epoch, dynasty },
            FinalizationEvent::Justified { epoch, hash } => ChainEvent::Justified { epoch, hash },
            FinalizationEvent::Finalized { epoch, hash } => ChainEvent::Finalized { epoch, hash },
            FinalizationEvent::ValidatorStatusChanged { validator, status } => {
                ChainEvent::ValidatorStatusChanged { validator, status }
            }
        }
    }
}

fn encode_state(state: &FinalizationState) -> Result<Vec<u8>, DbError> {
    Ok(bincode::serialize(state)?)
}

fn decode_state(bytes: &[u8]) -> Result<FinalizationState, DbError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Outputs a block leaves in the UTXO set (spent within the block excluded)
fn created_outputs(block: &Block) -> BTreeMap<OutPoint, Utxo> {
    let mut created = BTreeMap::new();
    for tx in &block.transactions {
        for input in &tx.inputs {
            created.remove(input);
        }
        let txid = tx.txid();
        for (i, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, i as u32);
            created.insert(
                outpoint,
                Utxo {
                    outpoint,
                    output: output.clone(),
                    height: block.height(),
                },
            );
        }
    }
    created
}

/// State, recent post-states, commitment and tip header read at open
type Loaded = (
    FinalizationState,
    BTreeMap<Height, FinalizationState>,
    UtxoCommitment,
    BlockHeader,
);

pub struct Chain {
    storage: Storage,
    params: ChainParams,
    state: FinalizationState,
    recent: BTreeMap<Height, FinalizationState>,
    commitment: UtxoCommitment,
    tip: BlockHeader,
    /// Highest finalized checkpoint height seen; undo never goes at or below it
    finalized_floor: Height,
    mempool: Mempool,
    snapshots: SnapshotEngine,
    events: broadcast::Sender<ChainEvent>,
}

impl Chain {
    /// Open the chain in `path`, creating genesis on first use.
    ///
    /// The finalization state is recomputed from the newest checkpoint record
    /// and must match the persisted tip state byte for byte.
    pub fn open<P: AsRef<Path>>(path: P, params: ChainParams) -> Result<Self, ChainError> {
        let storage = open_storage(path.as_ref(), &params)?;
        let mut chain = Self::init(storage, params)?;
        chain.mempool = Mempool::load(&chain.storage, &chain.state)?;
        chain.requeue_evidence()?;
        chain.publish_detected();
        Ok(chain)
    }

    /// Rebuild every derived record from the stored active chain
    pub fn reindex<P: AsRef<Path>>(path: P, params: ChainParams) -> Result<Self, ChainError> {
        let storage = open_storage(path.as_ref(), &params)?;
        let hashes = storage.active_chain()?;
        info!("Reindexing {} blocks", hashes.len().saturating_sub(1));

        let blocks = hashes
            .iter()
            .skip(1)
            .map(|hash| storage.get_block(hash))
            .collect::<Result<Vec<_>, _>>()?;
        let pending = mempool::take_persisted(&storage)?;
        storage.clear_derived()?;

        let mut chain = Self::init(storage, params)?;
        for block in blocks {
            chain.connect_block(block)?;
        }
        chain.mempool.restore(pending, &chain.state, &chain.storage)?;
        chain.requeue_evidence()?;
        chain.publish_detected();
        info!("Reindex complete at height {}", chain.tip.height);
        Ok(chain)
    }

    fn init(storage: Storage, params: ChainParams) -> Result<Self, ChainError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let snapshots = SnapshotEngine::open(storage.snapshots_tree(), params.snapshot.clone(), events.clone())?;

        let (state, recent, commitment, tip) = match storage.tip()? {
            None => Self::create_genesis(&storage, &params)?,
            Some(tip) => Self::restore(&storage, &tip)?,
        };

        Ok(Self {
            storage,
            params,
            finalized_floor: state.last_finalized_height(),
            state,
            recent,
            commitment,
            tip,
            mempool: Mempool::new(),
            snapshots,
            events,
        })
    }

    fn create_genesis(storage: &Storage, params: &ChainParams) -> Result<Loaded, ChainError> {
        let genesis = Block::genesis(genesis_stake_modifier());
        let state = FinalizationState::genesis(params.finalization.clone(), &params.admin, genesis.hash());
        let commitment = UtxoCommitment::empty();

        storage.connect_block(&BlockUpdate {
            block: &genesis,
            spent: &[],
            created: &[],
            state: &encode_state(&state)?,
            checkpoint_record: true,
            commitment: &commitment.to_bytes(),
            votes: &[],
            evidence: &[],
        })?;
        info!("Genesis {} created", hex::encode(genesis.hash()));

        let recent = BTreeMap::from([(0, state.clone())]);
        Ok((state, recent, commitment, genesis.header))
    }

    fn restore(storage: &Storage, tip: &Hash) -> Result<Loaded, ChainError> {
        let header = storage.get_block(tip)?.header;
        let height = header.height;

        let (record_height, record) = storage
            .state_record_at_or_below(height)?
            .ok_or(ChainError::InconsistentState { height })?;
        let mut state = decode_state(&record)?;
        let mut recent = BTreeMap::from([(record_height, state.clone())]);

        for h in record_height + 1..=height {
            let block = storage.block_at(h)?;
            state
                .process_block(&block)
                .map_err(|reason| ChainError::InvalidBlock { height: h, reason })?;
            recent.insert(h, state.clone());
        }

        if encode_state(&state)? != storage.tip_state()? {
            error!(
                "Finalization state at height {} diverges from replay from {}",
                height, record_height
            );
            return Err(ChainError::InconsistentState { height });
        }

        let commitment = UtxoCommitment::from_bytes(&storage.commitment()?)
            .ok_or(DbError::Corrupt("utxo commitment"))?;

        info!(
            "Chain restored at height {} (epoch {}, justified {}, finalized {})",
            height,
            state.current_epoch(),
            state.last_justified_epoch(),
            state.last_finalized_epoch()
        );
        Ok((state, recent, commitment, header))
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn tip(&self) -> &BlockHeader {
        &self.tip
    }

    pub fn state(&self) -> &FinalizationState {
        &self.state
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn finalized_floor(&self) -> Height {
        self.finalized_floor
    }

    pub fn commitment(&self) -> &UtxoCommitment {
        &self.commitment
    }

    /// Published commitment of the UTXO set at the tip
    pub fn commitment_hash(&self) -> Hash {
        self.commitment.hash(&self.tip.stake_modifier)
    }

    pub fn status(&self) -> FinalizationStatus {
        self.state.status()
    }

    pub fn validator_status(&self, pubkey: &[u8]) -> ValidatorStatus {
        self.state.validator_status(pubkey)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn snapshots(&self) -> Vec<SnapshotMeta> {
        self.snapshots.snapshots()
    }

    /// Wait for the in-flight snapshot write, if any
    pub fn wait_for_snapshots(&mut self) -> Result<(), ChainError> {
        Ok(self.snapshots.wait_idle()?)
    }

    pub fn load_snapshot(&self, id: u32) -> Result<(SnapshotMeta, Vec<Utxo>), ChainError> {
        Ok(self.snapshots.load_snapshot(id)?)
    }

    fn emit(&self, event: ChainEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_detected(&mut self) {
        for (txid, evidence) in self.mempool.take_detected() {
            self.emit(ChainEvent::SlashDetected {
                validator: evidence.validator().clone(),
                txid,
            });
        }
    }

    // ========================================================================
    // MEMPOOL
    // ========================================================================

    /// Admit a transaction to the mempool.
    ///
    /// A conflicting vote queues a slash transaction even when the vote
    /// itself is rejected.
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Hash, MempoolError> {
        let result = self.mempool.accept(tx, &self.state, &self.storage);
        self.publish_detected();
        result
    }

    /// Key credited with bounties of slash transactions this node creates
    pub fn set_slash_reporter(&mut self, reporter: PublicKey) {
        info!("Slash bounties go to {}", short_hex(&reporter));
        self.mempool.set_reporter(reporter);
    }

    /// Logged evidence whose slash transaction never made it to the pool
    fn requeue_evidence(&mut self) -> Result<(), ChainError> {
        for evidence in self.storage.all_evidence()? {
            self.queue_slash(evidence)?;
        }
        Ok(())
    }

    fn queue_slash(&mut self, evidence: SlashEvidence) -> Result<(), ChainError> {
        if self.mempool.add_slash(evidence, &self.state, &self.storage)?.is_none() {
            debug!("Slash not queued");
        }
        Ok(())
    }

    /// Drop log entries no acceptable vote can conflict with: votes below the
    /// last finalized epoch and anything from validators that have left
    fn prune_vote_log(&self) {
        let finalized = self.state.last_finalized_epoch();
        let registry = self.state.registry();
        let pruned = self
            .storage
            .prune_votes(|validator, epoch| epoch >= finalized && registry.contains(validator))
            .and_then(|votes| {
                let evidence = self.storage.prune_evidence(|validator| registry.contains(validator))?;
                Ok((votes, evidence))
            });
        match pruned {
            Ok((0, 0)) => {}
            Ok((votes, evidence)) => debug!("Pruned {} votes and {} evidence from the vote log", votes, evidence),
            Err(e) => warn!("Vote log pruning failed: {}", e),
        }
    }

    // ========================================================================
    // CONNECT / DISCONNECT
    // ========================================================================

    /// Spent and created UTXOs of `block` against the current set
    fn utxo_changes(&self, block: &Block) -> Result<(Vec<Utxo>, Vec<Utxo>), ChainError> {
        let height = block.height();
        let mut in_block: BTreeSet<OutPoint> = BTreeSet::new();
        let mut spent: Vec<Utxo> = Vec::new();

        for tx in &block.transactions {
            for input in &tx.inputs {
                if in_block.remove(input) {
                    continue;
                }
                if spent.iter().any(|u| u.outpoint == *input) {
                    warn!("Block {} double spends {}", height, short_hex(&input.txid));
                    return Err(ChainError::MissingInput { height });
                }
                match self.storage.get_utxo(input)? {
                    Some(utxo) => spent.push(utxo),
                    None => {
                        warn!("Block {} spends unknown {}:{}", height, short_hex(&input.txid), input.index);
                        return Err(ChainError::MissingInput { height });
                    }
                }
            }
            let txid = tx.txid();
            for i in 0..tx.outputs.len() {
                in_block.insert(OutPoint::new(txid, i as u32));
            }
        }

        let created = created_outputs(block).into_values().collect();
        Ok((spent, created))
    }

    /// Connect `block` on top of the tip
    pub fn connect_block(&mut self, block: Block) -> Result<Vec<ChainEvent>, ChainError> {
        let height = block.height();
        let hash = block.hash();
        if block.header.prev_hash != self.tip.hash() || height != self.tip.height + 1 {
            return Err(ChainError::NotOnTip { height });
        }
        if !block.has_valid_tx_root() {
            return Err(ChainError::BadTxRoot { height });
        }

        let mut state = self.state.clone();
        let finalization_events = state.process_block(&block).map_err(|reason| {
            warn!("Block {} {} rejected: {}", height, short_hex(&hash), reason);
            ChainError::InvalidBlock { height, reason }
        })?;

        let (spent, created) = self.utxo_changes(&block)?;
        let mut commitment = self.commitment.clone();
        commitment.update(&created, &spent);

        let staged = StagedVoteLog::new(&self.storage);
        for record in block.transactions.iter().filter_map(VoteRecord::from_tx) {
            check_and_record(&staged, &record)?;
        }
        let (votes, detected) = staged.into_parts();

        self.storage.connect_block(&BlockUpdate {
            block: &block,
            spent: &spent,
            created: &created,
            state: &encode_state(&state)?,
            checkpoint_record: is_checkpoint(height, self.params.finalization.epoch_length),
            commitment: &commitment.to_bytes(),
            votes: &votes,
            evidence: &detected,
        })?;

        self.recent.insert(height, state.clone());
        self.finalized_floor = self.finalized_floor.max(state.last_finalized_height());
        self.state = state;
        self.commitment = commitment;
        self.tip = block.header.clone();
        debug!("Connected block {} {}", height, short_hex(&hash));

        self.mempool.remove_for_block(&block, &self.state, &self.storage)?;
        for evidence in detected {
            self.queue_slash(evidence)?;
        }

        let mut events = vec![ChainEvent::BlockConnected { hash, height }];
        let mut finalized = false;
        for event in finalization_events {
            finalized |= matches!(event, FinalizationEvent::Finalized { .. });
            events.push(event.into());
        }
        for (txid, evidence) in self.mempool.take_detected() {
            events.push(ChainEvent::SlashDetected {
                validator: evidence.validator().clone(),
                txid,
            });
        }
        for event in &events {
            self.emit(event.clone());
        }

        if finalized {
            self.finalize_snapshots();
            self.prune_vote_log();
        }
        if is_snapshot_height(height, self.params.snapshot.interval) {
            self.take_snapshot(&block)?;
        }
        self.prune_recent();
        Ok(events)
    }

    fn finalize_snapshots(&mut self) {
        let finalized_height = self.state.last_finalized_height();
        let storage = &self.storage;
        let result = self
            .snapshots
            .finalize_up_to(finalized_height, |h| storage.hash_at(h).ok().flatten());
        if let Err(e) = result {
            warn!("Snapshot finalization at height {}: {}", finalized_height, e);
        }
    }

    fn take_snapshot(&mut self, block: &Block) -> Result<(), ChainError> {
        let utxos = self.storage.all_utxos()?;
        if let Err(e) = self.snapshots.create(
            block.hash(),
            block.height(),
            block.header.stake_modifier,
            &self.commitment,
            utxos,
        ) {
            warn!("Snapshot at height {} skipped: {}", block.height(), e);
        }
        Ok(())
    }

    fn prune_recent(&mut self) {
        let floor = self
            .finalized_floor
            .max(self.tip.height.saturating_sub(MAX_RECENT_STATES));
        self.recent.retain(|&h, _| h >= floor);
    }

    /// Finalization state after the active block at `height`
    fn state_at(&self, height: Height) -> Result<FinalizationState, ChainError> {
        if let Some(state) = self.recent.get(&height) {
            return Ok(state.clone());
        }

        let (record_height, record) = self
            .storage
            .state_record_at_or_below(height)?
            .ok_or(ChainError::InconsistentState { height })?;
        debug!("Replaying state from {} to {}", record_height, height);
        let mut state = decode_state(&record)?;
        for h in record_height + 1..=height {
            let block = self.storage.block_at(h)?;
            state
                .process_block(&block)
                .map_err(|reason| ChainError::InvalidBlock { height: h, reason })?;
        }
        Ok(state)
    }

    /// Undo the tip block; refused at or below the last finalized checkpoint
    pub fn disconnect_tip(&mut self) -> Result<Block, ChainError> {
        let height = self.tip.height;
        if height <= self.finalized_floor {
            return Err(ChainError::FinalizedBlock { height });
        }

        let hash = self.tip.hash();
        let block = self.storage.get_block(&hash)?;
        let prev_state = self.state_at(height - 1)?;
        let prev_header = self.storage.get_block(&block.header.prev_hash)?.header;

        let spent = self.storage.undo(&hash)?;
        let created: Vec<Utxo> = created_outputs(&block).into_values().collect();
        let mut prev_commitment = self.commitment.clone();
        prev_commitment.update(&spent, &created);

        self.storage.disconnect_block(&BlockRevert {
            block: &block,
            spent: &spent,
            created: &created,
            prev_state: &encode_state(&prev_state)?,
            prev_commitment: &prev_commitment.to_bytes(),
        })?;

        self.recent.remove(&height);
        self.state = prev_state;
        self.commitment = prev_commitment;
        self.tip = prev_header;
        info!("Disconnected block {} {}", height, short_hex(&hash));

        self.mempool.readmit(&block, &self.state, &self.storage)?;
        self.publish_detected();
        self.emit(ChainEvent::BlockDisconnected { hash, height });
        Ok(block)
    }
}

fn open_storage(path: &Path, params: &ChainParams) -> Result<Storage, ChainError> {
    params.validate()?;
    let storage = Storage::open(path)?;
    let fingerprint = params.fingerprint();
    match storage.params_fingerprint()? {
        Some(stored) if stored != fingerprint => {
            error!("Chain parameters differ from those {} was created with", path.display());
            return Err(ChainError::ParamsMismatch);
        }
        Some(_) => {}
        None => storage.put_params_fingerprint(&fingerprint)?,
    }
    Ok(storage)
}

impl CommitSource for Chain {
    fn active_height_of(&self, hash: &Hash) -> Result<Option<Height>, DbError> {
        self.storage.active_height_of(hash)
    }

    fn active_block_at(&self, height: Height) -> Result<Block, DbError> {
        self.storage.block_at(height)
    }

    fn tip_height(&self) -> Height {
        self.tip.height
    }

    fn epoch_length(&self) -> u64 {
        self.params.finalization.epoch_length
    }

    fn last_justified_epoch(&self) -> Epoch {
        self.state.last_justified_epoch()
    }

    fn last_finalized_epoch(&self) -> Epoch {
        self.state.last_finalized_epoch()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if let Err(e) = self.snapshots.wait_idle() {
            warn!("Snapshot writer: {}", e);
        }
        if let Err(e) = self.storage.flush() {
            warn!("Flush on close: {}", e);
        }
    }
}
