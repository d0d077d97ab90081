//! Double-vote detection end to end: the slash transaction shows up in the
//! mempool, survives restart and reindex, and slashes once mined.

mod common;

use common::*;
use esperanza::{
    rewards, Block, Chain, ChainEvent, RejectReason, SlashEvidence, SlashKind, Storage,
    Transaction, TxPayload, ValidatorStatus, Vote, VoteRecord, COIN,
};

const L: u64 = 5;

/// Validator 1 deposited at block 1 and voted in block 21
fn chain_with_vote(dir: &std::path::Path) -> (Chain, Vote) {
    let mut chain = Chain::open(dir, regtest(L)).unwrap();
    chain.submit_transaction(deposit_tx(1)).unwrap();
    mine_mempool(&mut chain);
    mine_to(&mut chain, 20);

    let vote = vote_tx(&chain, 1);
    chain.submit_transaction(vote.clone()).unwrap();
    mine_mempool(&mut chain);
    assert_eq!(chain.tip().height, 21);

    let TxPayload::Vote(vote) = vote.payload else {
        unreachable!()
    };
    (chain, vote)
}

fn pending_slashes(chain: &Chain) -> Vec<Transaction> {
    chain
        .mempool()
        .transactions()
        .into_iter()
        .filter(|tx| matches!(tx.payload, TxPayload::Slash(_)))
        .collect()
}

#[test]
fn test_double_vote_creates_slash() {
    let dir = temp_dir("slash_double");
    let (mut chain, vote) = chain_with_vote(&dir);
    let mut events = chain.subscribe();

    let conflicting = Vote {
        target_hash: [0xee; 32],
        ..vote
    };
    let err = chain
        .submit_transaction(Transaction::vote(conflicting))
        .unwrap_err();
    assert_eq!(err.reason(), Some(RejectReason::VoteAlreadyVoted));

    let slashes = pending_slashes(&chain);
    assert_eq!(slashes.len(), 1);
    let slash_txid = slashes[0].txid();
    assert!(chain.mempool().has_pending_slash(&key(1)));

    let event = events.try_recv().unwrap();
    assert_eq!(
        event,
        ChainEvent::SlashDetected {
            validator: key(1),
            txid: slash_txid,
        }
    );

    // restart
    drop(chain);
    let chain = Chain::open(&dir, regtest(L)).unwrap();
    let after_restart: Vec<_> = pending_slashes(&chain).iter().map(Transaction::txid).collect();
    assert_eq!(after_restart, vec![slash_txid]);
    drop(chain);

    // reindex
    let mut chain = Chain::reindex(&dir, regtest(L)).unwrap();
    let after_reindex: Vec<_> = pending_slashes(&chain).iter().map(Transaction::txid).collect();
    assert_eq!(after_reindex, vec![slash_txid]);

    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::IsValidating);
    let deposit = chain.state().registry().get(&key(1)).unwrap().deposit;
    mine_mempool(&mut chain);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::Slashed);
    assert!(chain.state().registry().get(&key(1)).unwrap().deposit < deposit);
    assert!(pending_slashes(&chain).is_empty());

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_one_slash_per_validator() {
    let dir = temp_dir("slash_once");
    let (mut chain, vote) = chain_with_vote(&dir);

    for hash in [0xe1u8, 0xe2, 0xe3] {
        let _ = chain.submit_transaction(Transaction::vote(Vote {
            target_hash: [hash; 32],
            ..vote.clone()
        }));
    }
    assert_eq!(pending_slashes(&chain).len(), 1);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_surround_vote_detected() {
    let dir = temp_dir("slash_surround");
    let (mut chain, vote) = chain_with_vote(&dir);

    // 3 -> 4 is surrounded by 2 -> 5
    let surrounding = Vote {
        source_epoch: 2,
        target_epoch: 5,
        ..vote
    };
    assert!(chain.submit_transaction(Transaction::vote(surrounding)).is_err());
    assert_eq!(pending_slashes(&chain).len(), 1);

    mine_mempool(&mut chain);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::Slashed);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_unsigned_vote_is_not_evidence() {
    let dir = temp_dir("slash_unsigned");
    let (mut chain, vote) = chain_with_vote(&dir);

    let forged = Transaction::new(
        TxPayload::Vote(Vote {
            target_hash: [0xee; 32],
            ..vote
        }),
        vec![key(9)],
    );
    assert!(chain.submit_transaction(forged).is_err());
    assert!(pending_slashes(&chain).is_empty());

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_slash_needs_validator_signed_votes() {
    let dir = temp_dir("slash_forged");
    let (mut chain, vote) = chain_with_vote(&dir);

    // two conflicting votes naming validator 1, signed by a third party
    let fabricated = |target: u8| {
        let tx = Transaction::new(
            TxPayload::Vote(Vote {
                target_hash: [target; 32],
                ..vote.clone()
            }),
            vec![key(0x66)],
        );
        VoteRecord::from_tx(&tx).unwrap()
    };
    let slash = Transaction::new(
        TxPayload::Slash(SlashEvidence {
            kind: SlashKind::DoubleVote,
            first: fabricated(0xe1),
            second: fabricated(0xe2),
        }),
        vec![key(0x66)],
    );

    let err = chain.submit_transaction(slash.clone()).unwrap_err();
    assert_eq!(err.reason(), Some(RejectReason::SlashNotSlashable));
    assert!(pending_slashes(&chain).is_empty());

    let height = chain.tip().height + 1;
    let block = Block::child_of(
        chain.tip(),
        chain.tip().timestamp + 1,
        vec![Transaction::coinbase(height, 50 * COIN, key(0xcb)), slash],
    );
    assert!(chain.connect_block(block).is_err());
    assert_eq!(chain.tip().height, 21);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::IsValidating);
    assert_eq!(chain.state().bounty_of(&key(0x66)), 0);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_slash_bounty_paid_to_reporter() {
    let dir = temp_dir("slash_bounty");
    let (mut chain, vote) = chain_with_vote(&dir);
    chain.set_slash_reporter(key(0x77));

    let conflicting = Vote {
        target_hash: [0xee; 32],
        ..vote
    };
    assert!(chain.submit_transaction(Transaction::vote(conflicting)).is_err());
    let slashes = pending_slashes(&chain);
    assert_eq!(slashes.len(), 1);
    assert_eq!(slashes[0].signers, vec![key(0x77)]);

    let deposit = chain.state().registry().get(&key(1)).unwrap().deposit;
    let bounty = rewards::slash_bounty(chain.state().params(), deposit);
    assert!(bounty > 0);

    mine_mempool(&mut chain);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::Slashed);
    assert_eq!(chain.state().bounty_of(&key(0x77)), bounty);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_block_vote_evidence_survives_lost_mempool() {
    let dir = temp_dir("slash_block_vote");
    let (mut chain, _) = chain_with_vote(&dir);
    mine_to(&mut chain, 25);

    // logged by the mempool, then rejected for its target hash
    let valid = vote_tx(&chain, 1);
    let TxPayload::Vote(vote) = valid.payload.clone() else {
        unreachable!()
    };
    let stray = Transaction::vote(Vote {
        target_hash: [0xee; 32],
        ..vote
    });
    let err = chain.submit_transaction(stray).unwrap_err();
    assert_eq!(err.reason(), Some(RejectReason::VoteWrongTargetHash));
    assert!(pending_slashes(&chain).is_empty());

    // the valid vote in a block conflicts with the logged one
    mine(&mut chain, vec![valid]);
    assert_eq!(pending_slashes(&chain).len(), 1);
    drop(chain);

    // crash before the slash transaction reached the persisted pool
    let storage = Storage::open(&dir).unwrap();
    assert_eq!(storage.all_evidence().unwrap().len(), 1);
    storage.clear_mempool().unwrap();
    drop(storage);

    let mut chain = Chain::open(&dir, regtest(L)).unwrap();
    assert_eq!(pending_slashes(&chain).len(), 1);
    mine_mempool(&mut chain);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::Slashed);

    drop(chain);
    cleanup(&dir);
}
