//! Finalizer transaction pool.
//!
//! Admission runs the consensus checks of `FinalizationState::validate_tx`
//! plus local policy (whitelist, one pending item per validator). Every
//! attributable vote passes the slashing detector first, so a conflicting
//! vote that is itself invalid still produces a slash transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{DbError, Storage};
use crate::slashing::{check_and_record, slash_transaction, SlashEvidence, VoteLog, VoteRecord};
use crate::state::{FinalizationState, RejectReason};
use crate::types::{short_hex, Block, Hash, PublicKey, Transaction, TxPayload, Vote};

#[derive(Error, Debug)]
pub enum MempoolError {
    #[error(transparent)]
    Rejected(#[from] RejectReason),
    #[error("txn-already-known")]
    AlreadyKnown,
    #[error("coinbase")]
    Coinbase,
    #[error("slash-already-pending")]
    SlashPending,
    #[error("storage: {0}")]
    Db(#[from] DbError),
}

impl MempoolError {
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            MempoolError::Rejected(r) => Some(*r),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Mempool {
    entries: BTreeMap<u64, Transaction>,
    by_txid: HashMap<Hash, u64>,
    pending_slashes: HashSet<PublicKey>,
    /// Slash transactions queued since the last `take_detected`
    detected: Vec<(Hash, SlashEvidence)>,
    /// Signer of slash transactions created here
    reporter: Option<PublicKey>,
    next_seq: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload the persisted pool, re-admitting every entry against `state`
    pub fn load(storage: &Storage, state: &FinalizationState) -> Result<Self, DbError> {
        let persisted = take_persisted(storage)?;
        let mut pool = Self::new();
        pool.restore(persisted, state, storage)?;
        Ok(pool)
    }

    /// Re-admit `txs` in order; whatever no longer validates is dropped
    pub fn restore(
        &mut self,
        txs: impl IntoIterator<Item = Transaction>,
        state: &FinalizationState,
        storage: &Storage,
    ) -> Result<(), DbError> {
        for tx in txs {
            let txid = tx.txid();
            match self.accept(tx, state, storage) {
                Ok(_) => {}
                Err(MempoolError::Db(e)) => return Err(e),
                Err(e) => debug!("Dropped {} on reload: {}", short_hex(&txid), e),
            }
        }
        info!("Mempool loaded: {} transactions", self.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.by_txid.contains_key(txid)
    }

    /// Pool contents in admission order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.values().cloned().collect()
    }

    pub fn set_reporter(&mut self, reporter: PublicKey) {
        self.reporter = Some(reporter);
    }

    pub fn has_pending_slash(&self, validator: &[u8]) -> bool {
        self.pending_slashes.contains(validator)
    }

    /// Slash transactions queued since the previous call
    pub fn take_detected(&mut self) -> Vec<(Hash, SlashEvidence)> {
        std::mem::take(&mut self.detected)
    }

    /// Admit `tx`. A vote may queue a slash transaction even when the vote
    /// itself is rejected; see `take_detected`.
    pub fn accept(
        &mut self,
        tx: Transaction,
        state: &FinalizationState,
        storage: &Storage,
    ) -> Result<Hash, MempoolError> {
        let txid = tx.txid();
        match self.check(&tx, &txid, state, storage) {
            Ok(()) => {
                self.insert(tx, storage)?;
                Ok(txid)
            }
            Err(e) => {
                if let MempoolError::Rejected(reason) = &e {
                    warn!("Rejected {} {}: {}", tx.kind().as_str(), hex::encode(txid), reason);
                }
                Err(e)
            }
        }
    }

    fn check(
        &mut self,
        tx: &Transaction,
        txid: &Hash,
        state: &FinalizationState,
        storage: &Storage,
    ) -> Result<(), MempoolError> {
        if self.contains(txid) {
            return Err(MempoolError::AlreadyKnown);
        }

        match &tx.payload {
            TxPayload::Coinbase { .. } => return Err(MempoolError::Coinbase),
            TxPayload::Vote(vote) => {
                if is_loggable(vote, state) {
                    if let Some(record) = VoteRecord::from_tx(tx) {
                        if let Some(evidence) = check_and_record(storage, &record)? {
                            self.add_slash(evidence, state, storage)?;
                        }
                    }
                }
                if self.pending_vote(&vote.validator, vote.target_epoch) {
                    return Err(RejectReason::VoteAlreadyVoted.into());
                }
            }
            TxPayload::Deposit { validator, .. } => {
                if !state.admin().is_whitelisted(validator) {
                    return Err(RejectReason::DepositNotWhitelisted.into());
                }
                if self.pending_deposit(validator) {
                    return Err(RejectReason::DepositDuplicate.into());
                }
            }
            TxPayload::Slash(evidence) => {
                if self.pending_slashes.contains(evidence.validator()) {
                    return Err(MempoolError::SlashPending);
                }
            }
            TxPayload::Logout { validator } => {
                if self.pending_of(validator, |p| matches!(p, TxPayload::Logout { .. })) {
                    return Err(RejectReason::LogoutAlreadyLoggedOut.into());
                }
            }
            TxPayload::Standard | TxPayload::Withdraw { .. } | TxPayload::Admin { .. } => {}
        }

        // a detected slash stays even if the vote itself is rejected
        state.validate_tx(tx)?;

        if let TxPayload::Slash(evidence) = &tx.payload {
            storage.record_evidence(evidence)?;
        }
        Ok(())
    }

    fn pending_of(&self, validator: &[u8], pred: impl Fn(&TxPayload) -> bool) -> bool {
        self.entries.values().any(|tx| {
            pred(&tx.payload)
                && match &tx.payload {
                    TxPayload::Deposit { validator: v, .. }
                    | TxPayload::Logout { validator: v }
                    | TxPayload::Withdraw { validator: v } => v.as_slice() == validator,
                    TxPayload::Vote(vote) => vote.validator.as_slice() == validator,
                    _ => false,
                }
        })
    }

    fn pending_vote(&self, validator: &[u8], target_epoch: u64) -> bool {
        self.pending_of(validator, |p| {
            matches!(p, TxPayload::Vote(v) if v.target_epoch == target_epoch)
        })
    }

    fn pending_deposit(&self, validator: &[u8]) -> bool {
        self.pending_of(validator, |p| matches!(p, TxPayload::Deposit { .. }))
    }

    /// Queue a slash transaction for `evidence`, at most one per validator
    pub fn add_slash(
        &mut self,
        evidence: SlashEvidence,
        state: &FinalizationState,
        storage: &Storage,
    ) -> Result<Option<Hash>, DbError> {
        if self.pending_slashes.contains(evidence.validator()) {
            return Ok(None);
        }
        if let Err(reason) = state.validate_slash(&evidence) {
            debug!(
                "Not slashing {}: {}",
                short_hex(evidence.validator()),
                reason
            );
            return Ok(None);
        }

        let tx = slash_transaction(evidence.clone(), self.reporter.clone());
        let txid = tx.txid();
        info!(
            "Slash transaction {} for validator {}",
            hex::encode(txid),
            short_hex(evidence.validator())
        );
        self.insert(tx, storage)?;
        self.detected.push((txid, evidence));
        Ok(Some(txid))
    }

    fn insert(&mut self, tx: Transaction, storage: &Storage) -> Result<(), DbError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        storage.put_mempool_tx(seq, &tx)?;
        if let TxPayload::Slash(evidence) = &tx.payload {
            self.pending_slashes.insert(evidence.validator().clone());
        }
        self.by_txid.insert(tx.txid(), seq);
        self.entries.insert(seq, tx);
        Ok(())
    }

    fn remove(&mut self, txid: &Hash, storage: &Storage) -> Result<Option<Transaction>, DbError> {
        let Some(seq) = self.by_txid.remove(txid) else {
            return Ok(None);
        };
        storage.remove_mempool_tx(seq)?;
        let tx = self.entries.remove(&seq);
        if let Some(Transaction {
            payload: TxPayload::Slash(evidence),
            ..
        }) = &tx
        {
            self.pending_slashes.remove(evidence.validator());
        }
        Ok(tx)
    }

    /// Drop what `block` included, then whatever the new state invalidates
    pub fn remove_for_block(
        &mut self,
        block: &Block,
        state: &FinalizationState,
        storage: &Storage,
    ) -> Result<(), DbError> {
        for tx in &block.transactions {
            self.remove(&tx.txid(), storage)?;
        }

        let stale: Vec<Hash> = self
            .entries
            .values()
            .filter(|tx| state.validate_tx(tx).is_err())
            .map(Transaction::txid)
            .collect();
        for txid in stale {
            debug!("Evicting stale {}", short_hex(&txid));
            self.remove(&txid, storage)?;
        }
        Ok(())
    }

    /// Return finalizer transactions of a disconnected block to the pool
    pub fn readmit(
        &mut self,
        block: &Block,
        state: &FinalizationState,
        storage: &Storage,
    ) -> Result<(), DbError> {
        for tx in block.transactions.iter().filter(|tx| tx.is_finalizer_commit()) {
            match self.accept(tx.clone(), state, storage) {
                Ok(_) | Err(MempoolError::AlreadyKnown) => {}
                Err(MempoolError::Db(e)) => return Err(e),
                Err(e) => debug!("Not readmitting {}: {}", short_hex(&tx.txid()), e),
            }
        }
        Ok(())
    }
}

/// Votes worth keeping in the vote log: from a known validator, targeting an
/// epoch between the last finalized and the current one
fn is_loggable(vote: &Vote, state: &FinalizationState) -> bool {
    state.registry().contains(&vote.validator)
        && vote.target_epoch >= state.last_finalized_epoch()
        && vote.target_epoch <= state.current_epoch()
}

/// Persisted pool contents, removed from storage for re-admission
pub fn take_persisted(storage: &Storage) -> Result<Vec<Transaction>, DbError> {
    let persisted = storage.load_mempool()?;
    storage.clear_mempool()?;
    Ok(persisted.into_iter().map(|(_, tx)| tx).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{AdminParams, FinalizationParams};
    use crate::types::{Amount, COIN, ZERO_HASH};

    fn temp_storage(name: &str) -> (Storage, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("esperanza_mempool_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        (Storage::open(&dir).unwrap(), dir)
    }

    fn state(admin: &AdminParams) -> FinalizationState {
        FinalizationState::genesis(FinalizationParams::regtest(5), admin, ZERO_HASH)
    }

    fn deposit(id: u8, amount: Amount) -> Transaction {
        Transaction::new(
            TxPayload::Deposit {
                validator: vec![id; 33],
                amount,
            },
            vec![vec![id; 33]],
        )
    }

    #[test]
    fn test_duplicates_and_coinbase_rejected() {
        let (storage, dir) = temp_storage("dup");
        let state = state(&AdminParams::default());
        let mut pool = Mempool::new();

        let tx = deposit(1, 1_500 * COIN);
        let txid = pool.accept(tx.clone(), &state, &storage).unwrap();
        assert!(pool.contains(&txid));
        assert!(matches!(pool.accept(tx, &state, &storage), Err(MempoolError::AlreadyKnown)));

        // a second deposit for the same key, different amount
        let err = pool.accept(deposit(1, 2_000 * COIN), &state, &storage).unwrap_err();
        assert_eq!(err.reason(), Some(RejectReason::DepositDuplicate));

        let err = pool
            .accept(Transaction::coinbase(1, 50, vec![1]), &state, &storage)
            .unwrap_err();
        assert!(matches!(err, MempoolError::Coinbase));
        assert_eq!(pool.len(), 1);

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_whitelist_is_admission_policy() {
        let (storage, dir) = temp_storage("whitelist");
        let admin = AdminParams {
            threshold: 1,
            keys: vec![vec![0xad; 33]],
            permissioned: true,
        };
        let state = state(&admin);
        let mut pool = Mempool::new();

        let err = pool.accept(deposit(2, 1_500 * COIN), &state, &storage).unwrap_err();
        assert_eq!(err.to_string(), "bad-deposit-invalid-esperanza");
        assert!(pool.is_empty());

        // consensus alone does not look at the whitelist
        assert!(state.validate_tx(&deposit(2, 1_500 * COIN)).is_ok());

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_too_small_deposit_reason() {
        let (storage, dir) = temp_storage("small");
        let state = state(&AdminParams::default());
        let mut pool = Mempool::new();
        let err = pool.accept(deposit(3, COIN), &state, &storage).unwrap_err();
        assert_eq!(err.to_string(), "bad-deposit-too-small");

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reload_keeps_order() {
        let (storage, dir) = temp_storage("reload");
        let state = state(&AdminParams::default());
        let mut pool = Mempool::new();
        let a = pool.accept(deposit(4, 1_500 * COIN), &state, &storage).unwrap();
        let b = pool.accept(deposit(5, 1_500 * COIN), &state, &storage).unwrap();
        drop(pool);

        let pool = Mempool::load(&storage, &state).unwrap();
        let txids: Vec<Hash> = pool.transactions().iter().map(Transaction::txid).collect();
        assert_eq!(txids, vec![a, b]);
        assert_eq!(storage.load_mempool().unwrap().len(), 2);

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_included_transactions_removed() {
        let (storage, dir) = temp_storage("included");
        let state = state(&AdminParams::default());
        let mut pool = Mempool::new();
        let tx = deposit(6, 1_500 * COIN);
        pool.accept(tx.clone(), &state, &storage).unwrap();

        let block = Block::child_of(&Block::genesis(ZERO_HASH).header, 1, vec![tx]);
        let mut next = state.clone();
        next.process_block(&block).unwrap();
        pool.remove_for_block(&block, &next, &storage).unwrap();
        assert!(pool.is_empty());
        assert!(storage.load_mempool().unwrap().is_empty());

        // disconnecting the block brings the deposit back
        pool.readmit(&block, &state, &storage).unwrap();
        assert_eq!(pool.len(), 1);

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_votes_from_unknown_keys_not_logged() {
        let (storage, dir) = temp_storage("junk_votes");
        let state = state(&AdminParams::default());
        let mut pool = Mempool::new();

        for id in 100..110u8 {
            let vote = Transaction::vote(Vote {
                validator: vec![id; 33],
                target_hash: [id; 32],
                source_epoch: 0,
                target_epoch: state.current_epoch(),
            });
            let err = pool.accept(vote, &state, &storage).unwrap_err();
            assert_eq!(err.to_string(), "bad-vote-not-by-validator");
        }
        assert!(pool.is_empty());
        assert_eq!(storage.vote_count(), 0);

        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
