//! getcommits against a real chain, directly and over TCP.

mod common;

use common::*;
use esperanza::net::serve;
use esperanza::sync::{build_locator, get_commits, verify_response, SyncErrorCode};
use esperanza::{Chain, CommitsStatus, GetCommits, Hash, NetError, SyncClient, SyncError};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

const L: u64 = 5;

/// 14 blocks, with a deposit in block 7
fn fourteen_blocks(dir: &std::path::Path) -> Chain {
    let mut chain = Chain::open(dir, regtest(L)).unwrap();
    mine_to(&mut chain, 6);
    chain.submit_transaction(deposit_tx(1)).unwrap();
    mine_mempool(&mut chain);
    mine_to(&mut chain, 14);
    chain
}

fn hash_at(chain: &Chain, height: u64) -> Hash {
    chain.storage().hash_at(height).unwrap().unwrap()
}

fn request(locator: Vec<Hash>) -> GetCommits {
    GetCommits { locator, stop: None }
}

#[test]
fn test_commits_after_justified_hash() {
    let dir = temp_dir("commits_direct");
    let chain = fourteen_blocks(&dir);
    assert_eq!(chain.status().last_justified_epoch, 1);

    let locator = vec![hash_at(&chain, 5)];
    let response = get_commits(&chain, &request(locator.clone())).unwrap();
    assert_eq!(response.status, CommitsStatus::TipReached);
    assert_eq!(response.heights(), (6..=14).collect::<Vec<_>>());
    verify_response(&locator, &response).unwrap();

    let with_deposit = &response.data[1];
    assert_eq!(with_deposit.header.height, 7);
    assert_eq!(with_deposit.commits.len(), 1);
    assert!(response.data[0].commits.is_empty());

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_unjustified_hash_is_a_sync_error() {
    let dir = temp_dir("commits_error");
    let chain = fourteen_blocks(&dir);

    assert!(matches!(
        get_commits(&chain, &request(vec![hash_at(&chain, 10)])),
        Err(SyncError::UnknownLocator)
    ));

    // the non-checkpoint hash 3 is recognized, 12 is not
    let response = get_commits(&chain, &request(vec![hash_at(&chain, 12), hash_at(&chain, 3)])).unwrap();
    assert_eq!(response.heights().first(), Some(&4));

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_stop_hash() {
    let dir = temp_dir("commits_stop");
    let chain = fourteen_blocks(&dir);
    let response = get_commits(
        &chain,
        &GetCommits {
            locator: vec![hash_at(&chain, 5)],
            stop: Some(hash_at(&chain, 9)),
        },
    )
    .unwrap();
    assert_eq!(response.status, CommitsStatus::StopReached);
    assert_eq!(response.heights(), vec![6, 7, 8, 9]);

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_locator_of_own_chain() {
    let dir = temp_dir("commits_locator");
    let chain = fourteen_blocks(&dir);
    let locator = build_locator(&chain).unwrap();
    // finalized checkpoint 0, justified checkpoint 5, tip 14
    assert_eq!(locator, vec![hash_at(&chain, 0), hash_at(&chain, 5), hash_at(&chain, 14)]);

    drop(chain);
    cleanup(&dir);
}

#[tokio::test]
async fn test_tcp_roundtrip_keeps_connection_after_error() {
    let dir = temp_dir("commits_tcp");
    let chain = fourteen_blocks(&dir);
    let (hash5, hash10) = (hash_at(&chain, 5), hash_at(&chain, 10));
    let chain = Arc::new(RwLock::new(chain));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve(listener, Arc::clone(&chain)));

    let mut client = SyncClient::connect(addr).await.unwrap();
    client.ping(42).await.unwrap();

    let refused = client.get_commits(request(vec![hash10])).await;
    assert!(matches!(
        refused,
        Err(NetError::SyncRejected {
            code: SyncErrorCode::UnknownLocator,
            ..
        })
    ));

    let response = client.get_commits(request(vec![hash5])).await.unwrap();
    assert_eq!(response.heights(), (6..=14).collect::<Vec<_>>());

    server.abort();
    let _ = server.await;
    drop(client);
    drop(chain);
    cleanup(&dir);
}
