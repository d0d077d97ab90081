//! Shared harness: on-disk regtest chains and finalizer transactions

#![allow(dead_code)]

use esperanza::{
    encode_commands, AdminCommand, Block, Chain, ChainParams, FinalizationParams, PublicKey,
    SnapshotParams, Transaction, TxPayload, Vote, COIN,
};
use std::path::PathBuf;

pub const DEPOSIT: u64 = 1_500 * COIN;

/// Fresh data directory under the system temp dir
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("esperanza_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub fn cleanup(dir: &PathBuf) {
    let _ = std::fs::remove_dir_all(dir);
}

/// Regtest params; snapshots effectively off
pub fn regtest(epoch_length: u64) -> ChainParams {
    ChainParams {
        finalization: FinalizationParams::regtest(epoch_length),
        snapshot: SnapshotParams {
            interval: 1_000_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn key(id: u8) -> PublicKey {
    vec![id; 33]
}

/// Next block with a coinbase followed by `txs`
pub fn mine(chain: &mut Chain, mut txs: Vec<Transaction>) -> Block {
    let height = chain.tip().height + 1;
    txs.insert(0, Transaction::coinbase(height, 50 * COIN, key(0xcb)));
    let block = Block::child_of(chain.tip(), chain.tip().timestamp + 1, txs);
    chain.connect_block(block.clone()).expect("connect block");
    block
}

/// Next block carrying the whole mempool
pub fn mine_mempool(chain: &mut Chain) -> Block {
    let txs = chain.mempool().transactions();
    mine(chain, txs)
}

pub fn mine_to(chain: &mut Chain, height: u64) {
    while chain.tip().height < height {
        mine(chain, vec![]);
    }
}

pub fn deposit_tx(id: u8) -> Transaction {
    Transaction::new(
        TxPayload::Deposit {
            validator: key(id),
            amount: DEPOSIT,
        },
        vec![key(id)],
    )
}

pub fn logout_tx(id: u8) -> Transaction {
    Transaction::new(TxPayload::Logout { validator: key(id) }, vec![key(id)])
}

pub fn withdraw_tx(id: u8) -> Transaction {
    Transaction::new(TxPayload::Withdraw { validator: key(id) }, vec![key(id)])
}

/// Valid vote for the current epoch's checkpoint
pub fn vote_tx(chain: &Chain, id: u8) -> Transaction {
    let state = chain.state();
    let epoch = state.current_epoch();
    Transaction::vote(Vote {
        validator: key(id),
        target_hash: state.checkpoint(epoch).expect("current checkpoint").hash,
        source_epoch: state.expected_source_epoch(),
        target_epoch: epoch,
    })
}

pub fn admin_tx(commands: &[AdminCommand], signers: &[u8]) -> Transaction {
    Transaction::new(
        TxPayload::Admin {
            commands: encode_commands(commands),
        },
        signers.iter().map(|&id| key(id)).collect(),
    )
}
