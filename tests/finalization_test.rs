//! Finalization through the full block pipeline: insta-finalization,
//! vote-driven justification, undo and restart consistency.

mod common;

use common::*;
use esperanza::{Chain, ChainError, ChainEvent, ValidatorStatus};

#[test]
fn test_170_blocks_without_validators() {
    let dir = temp_dir("fin_170");
    let mut chain = Chain::open(&dir, regtest(10)).unwrap();
    mine_to(&mut chain, 170);

    let status = chain.status();
    assert_eq!(status.current_epoch, 17);
    assert_eq!(status.current_dynasty, 16);
    assert_eq!(status.last_justified_epoch, 16);
    assert_eq!(status.last_finalized_epoch, 15);
    assert_eq!(status.active_validators, 0);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_dynasty_never_decreases() {
    let dir = temp_dir("fin_monotonic");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();
    let mut last = chain.status();
    for _ in 0..40 {
        mine(&mut chain, vec![]);
        let status = chain.status();
        assert!(status.current_dynasty >= last.current_dynasty);
        assert!(status.last_finalized_epoch <= status.last_justified_epoch);
        assert!(status.last_justified_epoch <= status.current_epoch);
        last = status;
    }

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_votes_justify_and_finalize() {
    let dir = temp_dir("fin_votes");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();

    chain.submit_transaction(deposit_tx(1)).unwrap();
    mine_mempool(&mut chain);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::PendingStart);

    mine_to(&mut chain, 20);
    assert_eq!(chain.validator_status(&key(1)), ValidatorStatus::IsValidating);
    assert!(chain.state().deposit_exists());
    let status = chain.status();
    assert_eq!((status.current_epoch, status.last_justified_epoch, status.last_finalized_epoch), (4, 3, 2));

    let mut events = chain.subscribe();
    chain.submit_transaction(vote_tx(&chain, 1)).unwrap();
    mine_mempool(&mut chain);

    let status = chain.status();
    assert_eq!(status.last_justified_epoch, 4);
    assert_eq!(status.last_finalized_epoch, 3);
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, ChainEvent::Justified { epoch: 4, .. })));
    assert!(seen.iter().any(|e| matches!(e, ChainEvent::Finalized { epoch: 3, .. })));

    // without a vote the next epoch stays unjustified
    mine_to(&mut chain, 30);
    let status = chain.status();
    assert_eq!(status.current_epoch, 6);
    assert_eq!(status.last_justified_epoch, 4);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_logout_then_withdraw() {
    let dir = temp_dir("fin_logout");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();
    chain.submit_transaction(deposit_tx(2)).unwrap();
    mine_mempool(&mut chain);
    mine_to(&mut chain, 15);
    assert_eq!(chain.validator_status(&key(2)), ValidatorStatus::IsValidating);

    chain.submit_transaction(logout_tx(2)).unwrap();
    mine_mempool(&mut chain);
    assert_eq!(chain.validator_status(&key(2)), ValidatorStatus::PendingLogout);

    let early = chain.submit_transaction(withdraw_tx(2)).unwrap_err();
    assert_eq!(early.to_string(), "bad-withdraw-too-early");

    // keep finalizing with votes until the withdrawal delay has passed
    let mut withdrawn = false;
    for _ in 0..200 {
        if chain.submit_transaction(withdraw_tx(2)).is_ok() {
            mine_mempool(&mut chain);
            withdrawn = true;
            break;
        }
        if chain.state().validator_status(&key(2)) != ValidatorStatus::NotValidating
            && chain.state().deposit_exists()
        {
            let _ = chain.submit_transaction(vote_tx(&chain, 2));
        }
        mine_mempool(&mut chain);
    }
    assert!(withdrawn);
    assert!(chain.state().registry().get(&key(2)).is_none());

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_disconnect_restores_state() {
    let dir = temp_dir("fin_undo");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();
    mine_to(&mut chain, 12);
    let state = chain.state().clone();
    let commitment = chain.commitment().clone();
    let tip = chain.tip().clone();

    chain.submit_transaction(deposit_tx(3)).unwrap();
    mine_mempool(&mut chain);
    mine_to(&mut chain, 16);
    assert!(chain.state().registry().contains(&key(3)));

    for _ in 0..4 {
        chain.disconnect_tip().unwrap();
    }
    assert_eq!(chain.state(), &state);
    assert_eq!(chain.commitment(), &commitment);
    assert_eq!(chain.tip(), &tip);
    assert_eq!(chain.storage().all_utxos().unwrap().len(), 12);
    // the undone deposit is back in the mempool
    assert_eq!(chain.mempool().len(), 1);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_finalized_blocks_cannot_be_disconnected() {
    let dir = temp_dir("fin_floor");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();
    mine_to(&mut chain, 20);
    assert_eq!(chain.finalized_floor(), 10);

    while chain.tip().height > 11 {
        chain.disconnect_tip().unwrap();
    }
    chain.disconnect_tip().unwrap();
    assert!(matches!(
        chain.disconnect_tip(),
        Err(ChainError::FinalizedBlock { height: 10 })
    ));

    // a different branch on top of the floor connects fine
    mine(&mut chain, vec![deposit_tx(4)]);
    assert_eq!(chain.tip().height, 11);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_restart_recovers_identical_state() {
    let dir = temp_dir("fin_restart");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();
    chain.submit_transaction(deposit_tx(5)).unwrap();
    mine_mempool(&mut chain);
    mine_to(&mut chain, 20);
    chain.submit_transaction(vote_tx(&chain, 5)).unwrap();
    mine_mempool(&mut chain);
    mine_to(&mut chain, 23);

    let state = chain.state().clone();
    let commitment_hash = chain.commitment_hash();
    drop(chain);

    let chain = Chain::open(&dir, regtest(5)).unwrap();
    assert_eq!(chain.state(), &state);
    assert_eq!(chain.commitment_hash(), commitment_hash);
    assert_eq!(chain.tip().height, 23);
    drop(chain);

    let chain = Chain::reindex(&dir, regtest(5)).unwrap();
    assert_eq!(chain.state(), &state);
    assert_eq!(chain.commitment_hash(), commitment_hash);
    drop(chain);

    cleanup(&dir);
}

#[test]
fn test_diverged_state_needs_reindex() {
    let dir = temp_dir("fin_diverged");
    let mut chain = Chain::open(&dir, regtest(5)).unwrap();
    mine_to(&mut chain, 13);
    let state = chain.state().clone();
    drop(chain);

    {
        let db = sled::open(&dir).unwrap();
        db.open_tree("meta").unwrap().insert("tip_state", &b"garbage"[..]).unwrap();
        db.flush().unwrap();
    }

    assert!(matches!(
        Chain::open(&dir, regtest(5)),
        Err(ChainError::InconsistentState { height: 13 })
    ));

    let chain = Chain::reindex(&dir, regtest(5)).unwrap();
    assert_eq!(chain.state(), &state);
    drop(chain);
    assert!(Chain::open(&dir, regtest(5)).is_ok());

    cleanup(&dir);
}
