//! Permissioned deposits and the admin command lifecycle.

mod common;

use common::*;
use esperanza::{AdminCommand, AdminParams, Chain, ChainParams};

/// Admins 0xa1, 0xa2, 0xa3 with a 2-of-3 threshold
fn permissioned() -> ChainParams {
    let mut params = regtest(5);
    params.admin = AdminParams {
        threshold: 2,
        keys: vec![key(0xa1), key(0xa2), key(0xa3)],
        permissioned: true,
    };
    params
}

#[test]
fn test_whitelist_gates_deposits() {
    let dir = temp_dir("admin_whitelist");
    let mut chain = Chain::open(&dir, permissioned()).unwrap();

    let err = chain.submit_transaction(deposit_tx(1)).unwrap_err();
    assert_eq!(err.to_string(), "bad-deposit-invalid-esperanza");

    chain
        .submit_transaction(admin_tx(&[AdminCommand::Whitelist(vec![key(1)])], &[0xa1, 0xa2]))
        .unwrap();
    mine_mempool(&mut chain);
    assert!(chain.state().admin().whitelist().contains(&key(1)));

    chain.submit_transaction(deposit_tx(1)).unwrap();
    mine_mempool(&mut chain);
    assert!(chain.state().registry().contains(&key(1)));

    chain
        .submit_transaction(admin_tx(&[AdminCommand::Blacklist(vec![key(1)])], &[0xa2, 0xa3]))
        .unwrap();
    mine_mempool(&mut chain);
    assert!(!chain.state().admin().whitelist().contains(&key(1)));

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_threshold_required() {
    let dir = temp_dir("admin_threshold");
    let mut chain = Chain::open(&dir, permissioned()).unwrap();
    let err = chain
        .submit_transaction(admin_tx(&[AdminCommand::Whitelist(vec![key(1)])], &[0xa1]))
        .unwrap_err();
    assert_eq!(err.to_string(), "admin-not-authorized");

    let err = chain
        .submit_transaction(admin_tx(&[AdminCommand::Whitelist(vec![key(1)])], &[0xa1, 0x01]))
        .unwrap_err();
    assert_eq!(err.to_string(), "admin-not-authorized");

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_reset_admins() {
    let dir = temp_dir("admin_reset");
    let mut chain = Chain::open(&dir, permissioned()).unwrap();
    chain
        .submit_transaction(admin_tx(&[AdminCommand::ResetAdmins(vec![key(0xb1)])], &[0xa1, 0xa3]))
        .unwrap();
    mine_mempool(&mut chain);

    let old = chain
        .submit_transaction(admin_tx(&[AdminCommand::Whitelist(vec![key(2)])], &[0xa1, 0xa2]))
        .unwrap_err();
    assert_eq!(old.to_string(), "admin-not-authorized");
    chain
        .submit_transaction(admin_tx(&[AdminCommand::Whitelist(vec![key(2)])], &[0xb1]))
        .unwrap();

    drop(chain);
    cleanup(&dir);
}

#[test]
fn test_end_permissioning_is_terminal() {
    let never_dir = temp_dir("admin_never");
    let mut never = Chain::open(&never_dir, regtest(5)).unwrap();
    let baseline = never
        .submit_transaction(admin_tx(&[AdminCommand::Whitelist(vec![key(1)])], &[0xa1, 0xa2]))
        .unwrap_err()
        .to_string();
    drop(never);
    cleanup(&never_dir);

    let dir = temp_dir("admin_end");
    let mut chain = Chain::open(&dir, permissioned()).unwrap();
    chain
        .submit_transaction(admin_tx(&[AdminCommand::EndPermissioning], &[0xa1, 0xa2]))
        .unwrap();
    mine_mempool(&mut chain);
    assert!(!chain.state().admin().is_permissioned());

    for signers in [&[0xa1u8, 0xa2][..], &[0xa1, 0xa2, 0xa3][..]] {
        for command in [
            AdminCommand::Whitelist(vec![key(1)]),
            AdminCommand::ResetAdmins(vec![key(0xa1)]),
            AdminCommand::EndPermissioning,
        ] {
            let err = chain
                .submit_transaction(admin_tx(&[command], signers))
                .unwrap_err();
            assert_eq!(err.to_string(), baseline);
        }
    }
    assert_eq!(baseline, "admin-not-authorized");

    // anyone may deposit now
    chain.submit_transaction(deposit_tx(7)).unwrap();

    drop(chain);
    cleanup(&dir);
}
