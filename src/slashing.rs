//! Slashing detector: double votes and surround votes.
//!
//! Every attributable vote is appended to a vote log keyed by
//! `(validator, target_epoch)`. A new vote is checked against the
//! validator's history before it is recorded, so replaying the same
//! votes after a restart re-derives the same evidence.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

use crate::db::DbError;
use crate::types::{short_hex, Epoch, Hash, PublicKey, Transaction, TxPayload, Vote};

#[derive(Error, Debug)]
#[error("not a vote transaction")]
pub struct NotAVote;

/// A vote together with the transaction that carried it.
///
/// The txid is derived from the transaction, never supplied, and only
/// deserializes from a vote transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Transaction", into = "Transaction")]
pub struct VoteRecord {
    vote: Vote,
    tx: Box<Transaction>,
}

impl VoteRecord {
    pub fn from_tx(tx: &Transaction) -> Option<Self> {
        Self::try_from(tx.clone()).ok()
    }

    pub fn vote(&self) -> &Vote {
        &self.vote
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn txid(&self) -> Hash {
        self.tx.txid()
    }

    /// Signed by the validator it names
    pub fn is_attributed(&self) -> bool {
        self.tx.is_signed_by(&self.vote.validator)
    }
}

impl TryFrom<Transaction> for VoteRecord {
    type Error = NotAVote;

    fn try_from(tx: Transaction) -> Result<Self, NotAVote> {
        match &tx.payload {
            TxPayload::Vote(vote) => Ok(Self {
                vote: vote.clone(),
                tx: Box::new(tx),
            }),
            _ => Err(NotAVote),
        }
    }
}

impl From<VoteRecord> for Transaction {
    fn from(record: VoteRecord) -> Self {
        *record.tx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlashKind {
    DoubleVote,
    SurroundVote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashEvidence {
    pub kind: SlashKind,
    pub first: VoteRecord,
    pub second: VoteRecord,
}

impl SlashEvidence {
    pub fn validator(&self) -> &PublicKey {
        &self.first.vote().validator
    }

    /// Both votes well formed, signed by one validator, distinct, and actually conflicting
    pub fn is_valid(&self) -> bool {
        let (a, b) = (self.first.vote(), self.second.vote());
        a.validator == b.validator
            && self.first.is_attributed()
            && self.second.is_attributed()
            && is_well_formed(a)
            && is_well_formed(b)
            && self.first.txid() != self.second.txid()
            && a != b
            && conflict(a, b) == Some(self.kind)
    }
}

pub fn is_well_formed(vote: &Vote) -> bool {
    !vote.validator.is_empty() && vote.source_epoch < vote.target_epoch
}

/// Slashing condition between two votes of the same validator, if any
pub fn conflict(a: &Vote, b: &Vote) -> Option<SlashKind> {
    if a.validator != b.validator {
        return None;
    }
    if a.target_epoch == b.target_epoch {
        return (a.target_hash != b.target_hash).then_some(SlashKind::DoubleVote);
    }
    let a_surrounds_b = a.source_epoch < b.source_epoch && b.target_epoch < a.target_epoch;
    let b_surrounds_a = b.source_epoch < a.source_epoch && a.target_epoch < b.target_epoch;
    (a_surrounds_b || b_surrounds_a).then_some(SlashKind::SurroundVote)
}

/// Append-only history of votes per validator
pub trait VoteLog {
    fn votes_of(&self, validator: &[u8]) -> Result<Vec<VoteRecord>, DbError>;

    /// Keeps the first vote seen for `(validator, target_epoch)`
    fn record_vote(&self, record: &VoteRecord) -> Result<(), DbError>;

    fn evidence_of(&self, validator: &[u8]) -> Result<Option<SlashEvidence>, DbError>;

    /// Keeps the first evidence seen per validator
    fn record_evidence(&self, evidence: &SlashEvidence) -> Result<(), DbError>;
}

/// Check `record` against the log, then append it.
///
/// Returns evidence the first time a validator is caught. Votes that are not
/// well formed or not signed by their validator are neither checked nor logged.
pub fn check_and_record<L: VoteLog + ?Sized>(
    log: &L,
    record: &VoteRecord,
) -> Result<Option<SlashEvidence>, DbError> {
    if !is_well_formed(record.vote()) || !record.is_attributed() {
        return Ok(None);
    }

    let validator = &record.vote().validator;
    let txid = record.txid();
    let mut found = None;
    for prior in log.votes_of(validator)? {
        if prior.txid() == txid {
            continue;
        }
        if let Some(kind) = conflict(prior.vote(), record.vote()) {
            found = Some(SlashEvidence {
                kind,
                first: prior,
                second: record.clone(),
            });
            break;
        }
    }

    log.record_vote(record)?;

    let Some(evidence) = found else {
        return Ok(None);
    };
    if log.evidence_of(validator)?.is_some() {
        return Ok(None);
    }

    warn!(
        "Slashable {:?} by {}: epochs {}->{} vs {}->{}",
        evidence.kind,
        short_hex(validator),
        evidence.first.vote().source_epoch,
        evidence.first.vote().target_epoch,
        evidence.second.vote().source_epoch,
        evidence.second.vote().target_epoch,
    );
    log.record_evidence(&evidence)?;
    Ok(Some(evidence))
}

/// Slash transaction carrying `evidence`; the bounty goes to `reporter`
pub fn slash_transaction(evidence: SlashEvidence, reporter: Option<PublicKey>) -> Transaction {
    Transaction::new(TxPayload::Slash(evidence), reporter.into_iter().collect())
}

/// Buffers new votes and evidence on top of a persisted log, so that one
/// block's votes are checked against each other and then written in the
/// same storage transaction as the block.
pub struct StagedVoteLog<'a, L: VoteLog + ?Sized> {
    base: &'a L,
    votes: RefCell<Vec<VoteRecord>>,
    evidence: RefCell<Vec<SlashEvidence>>,
}

impl<'a, L: VoteLog + ?Sized> StagedVoteLog<'a, L> {
    pub fn new(base: &'a L) -> Self {
        Self {
            base,
            votes: RefCell::new(Vec::new()),
            evidence: RefCell::new(Vec::new()),
        }
    }

    /// Votes and evidence to persist
    pub fn into_parts(self) -> (Vec<VoteRecord>, Vec<SlashEvidence>) {
        (self.votes.into_inner(), self.evidence.into_inner())
    }
}

impl<L: VoteLog + ?Sized> VoteLog for StagedVoteLog<'_, L> {
    fn votes_of(&self, validator: &[u8]) -> Result<Vec<VoteRecord>, DbError> {
        let mut votes = self.base.votes_of(validator)?;
        votes.extend(
            self.votes
                .borrow()
                .iter()
                .filter(|r| r.vote().validator.as_slice() == validator)
                .cloned(),
        );
        Ok(votes)
    }

    fn record_vote(&self, record: &VoteRecord) -> Result<(), DbError> {
        let vote = record.vote();
        let taken = self
            .votes_of(&vote.validator)?
            .iter()
            .any(|r| r.vote().target_epoch == vote.target_epoch);
        if !taken {
            self.votes.borrow_mut().push(record.clone());
        }
        Ok(())
    }

    fn evidence_of(&self, validator: &[u8]) -> Result<Option<SlashEvidence>, DbError> {
        let staged = self
            .evidence
            .borrow()
            .iter()
            .find(|e| e.validator().as_slice() == validator)
            .cloned();
        match staged {
            Some(evidence) => Ok(Some(evidence)),
            None => self.base.evidence_of(validator),
        }
    }

    fn record_evidence(&self, evidence: &SlashEvidence) -> Result<(), DbError> {
        if self.evidence_of(evidence.validator())?.is_none() {
            self.evidence.borrow_mut().push(evidence.clone());
        }
        Ok(())
    }
}

/// In-memory log for tools and tests
#[derive(Debug, Default)]
pub struct MemoryVoteLog {
    votes: std::sync::Mutex<BTreeMap<(PublicKey, Epoch), VoteRecord>>,
    evidence: std::sync::Mutex<BTreeMap<PublicKey, SlashEvidence>>,
}

impl VoteLog for MemoryVoteLog {
    fn votes_of(&self, validator: &[u8]) -> Result<Vec<VoteRecord>, DbError> {
        let votes = self.votes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(votes
            .iter()
            .filter(|((v, _), _)| v.as_slice() == validator)
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn record_vote(&self, record: &VoteRecord) -> Result<(), DbError> {
        let mut votes = self.votes.lock().unwrap_or_else(|e| e.into_inner());
        votes
            .entry((record.vote().validator.clone(), record.vote().target_epoch))
            .or_insert_with(|| record.clone());
        Ok(())
    }

    fn evidence_of(&self, validator: &[u8]) -> Result<Option<SlashEvidence>, DbError> {
        let evidence = self.evidence.lock().unwrap_or_else(|e| e.into_inner());
        Ok(evidence.get(validator).cloned())
    }

    fn record_evidence(&self, evidence: &SlashEvidence) -> Result<(), DbError> {
        let mut all = self.evidence.lock().unwrap_or_else(|e| e.into_inner());
        all.entry(evidence.validator().clone())
            .or_insert_with(|| evidence.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(source: Epoch, target: Epoch, hash: u8) -> Vote {
        Vote {
            validator: vec![1; 33],
            target_hash: [hash; 32],
            source_epoch: source,
            target_epoch: target,
        }
    }

    fn record(v: Vote) -> VoteRecord {
        let tx = Transaction::vote(v);
        VoteRecord::from_tx(&tx).unwrap()
    }

    #[test]
    fn test_double_vote() {
        assert_eq!(conflict(&vote(3, 4, 1), &vote(3, 4, 2)), Some(SlashKind::DoubleVote));
        assert_eq!(conflict(&vote(2, 4, 1), &vote(3, 4, 2)), Some(SlashKind::DoubleVote));
        assert_eq!(conflict(&vote(3, 4, 1), &vote(3, 4, 1)), None);
    }

    #[test]
    fn test_surround_vote() {
        assert_eq!(conflict(&vote(1, 6, 1), &vote(2, 5, 2)), Some(SlashKind::SurroundVote));
        assert_eq!(conflict(&vote(2, 5, 2), &vote(1, 6, 1)), Some(SlashKind::SurroundVote));
        // shared source is not a strict surround
        assert_eq!(conflict(&vote(1, 6, 1), &vote(1, 5, 2)), None);
        assert_eq!(conflict(&vote(1, 2, 1), &vote(2, 3, 2)), None);
    }

    #[test]
    fn test_different_validators_never_conflict() {
        let mut other = vote(3, 4, 2);
        other.validator = vec![2; 33];
        assert_eq!(conflict(&vote(3, 4, 1), &other), None);
    }

    #[test]
    fn test_detect_once_per_validator() {
        let log = MemoryVoteLog::default();
        assert!(check_and_record(&log, &record(vote(3, 4, 1))).unwrap().is_none());

        let evidence = check_and_record(&log, &record(vote(3, 4, 2))).unwrap().unwrap();
        assert_eq!(evidence.kind, SlashKind::DoubleVote);
        assert!(evidence.is_valid());

        // already caught
        assert!(check_and_record(&log, &record(vote(3, 4, 3))).unwrap().is_none());
        assert!(log.evidence_of(&[1; 33]).unwrap().is_some());
    }

    #[test]
    fn test_replay_rederives_same_evidence() {
        let votes = [record(vote(3, 4, 1)), record(vote(3, 4, 2))];

        let first = MemoryVoteLog::default();
        let a: Vec<_> = votes.iter().filter_map(|r| check_and_record(&first, r).unwrap()).collect();

        let second = MemoryVoteLog::default();
        let b: Vec<_> = votes.iter().filter_map(|r| check_and_record(&second, r).unwrap()).collect();

        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_same_vote_twice_is_not_evidence() {
        let log = MemoryVoteLog::default();
        let r = record(vote(3, 4, 1));
        assert!(check_and_record(&log, &r).unwrap().is_none());
        assert!(check_and_record(&log, &r).unwrap().is_none());
    }

    #[test]
    fn test_forged_evidence_invalid() {
        let evidence = SlashEvidence {
            kind: SlashKind::SurroundVote,
            first: record(vote(3, 4, 1)),
            second: record(vote(3, 4, 2)),
        };
        assert!(!evidence.is_valid());

        let malformed = SlashEvidence {
            kind: SlashKind::DoubleVote,
            first: record(vote(4, 4, 1)),
            second: record(vote(4, 4, 2)),
        };
        assert!(!malformed.is_valid());
    }

    #[test]
    fn test_evidence_needs_validator_signatures() {
        let signed = record(vote(3, 4, 1));
        let third_party = Transaction::new(TxPayload::Vote(vote(3, 4, 2)), vec![vec![0x66; 33]]);
        let unsigned = VoteRecord::from_tx(&third_party).unwrap();
        assert!(!unsigned.is_attributed());

        let evidence = SlashEvidence {
            kind: SlashKind::DoubleVote,
            first: signed.clone(),
            second: unsigned.clone(),
        };
        assert!(!evidence.is_valid());

        // unsigned votes are never logged
        let log = MemoryVoteLog::default();
        assert!(check_and_record(&log, &unsigned).unwrap().is_none());
        assert!(log.votes_of(&[1; 33]).unwrap().is_empty());
        assert!(check_and_record(&log, &signed).unwrap().is_none());
        assert_eq!(log.votes_of(&[1; 33]).unwrap(), vec![signed]);
    }

    #[test]
    fn test_record_only_decodes_from_vote_tx() {
        let r = record(vote(3, 4, 1));
        let bytes = bincode::serialize(&r).unwrap();
        let back: VoteRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.txid(), r.txid());

        let deposit = Transaction::new(
            TxPayload::Deposit {
                validator: vec![1; 33],
                amount: 1,
            },
            vec![vec![1; 33]],
        );
        let bytes = bincode::serialize(&deposit).unwrap();
        assert!(bincode::deserialize::<VoteRecord>(&bytes).is_err());
    }

    #[test]
    fn test_staged_log_checks_within_block() {
        let base = MemoryVoteLog::default();
        check_and_record(&base, &record(vote(1, 2, 1))).unwrap();

        let staged = StagedVoteLog::new(&base);
        assert!(check_and_record(&staged, &record(vote(3, 4, 1))).unwrap().is_none());
        let evidence = check_and_record(&staged, &record(vote(3, 4, 2))).unwrap().unwrap();
        assert_eq!(evidence.kind, SlashKind::DoubleVote);

        // nothing reaches the base log until the parts are written
        assert_eq!(base.votes_of(&[1; 33]).unwrap().len(), 1);
        assert!(base.evidence_of(&[1; 33]).unwrap().is_none());

        let (votes, evidence) = staged.into_parts();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote().target_epoch, 4);
        assert_eq!(evidence.len(), 1);
    }
}
