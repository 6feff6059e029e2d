// Persistence - A node restarted on RocksDB resumes exactly where it stopped

use super::common::*;
use crate::consensus::build_engine;
use crate::genesis::{dev_address, ChainConfig};
use crate::node::{BlockChain, ChainError};
use crate::storage::{Database, SharedStorage};
use crate::types::COIN;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open_db(path: &Path) -> SharedStorage {
    Arc::new(Database::open(path).unwrap())
}

/// PoA devnet whose first producer persists to `path`
fn devnet_on_disk(config: &ChainConfig, path: &Path) -> Devnet {
    let chains = vec![
        chain_on(config, 0, open_db(path)),
        chain_for(config, 1),
        chain_for(config, 2),
    ];
    Devnet {
        config: config.clone(),
        chains,
    }
}

#[test]
fn test_restart_resumes_tail_lib_and_state() {
    let dir = TempDir::new().unwrap();
    let config = ChainConfig::devnet_poa();
    let mut devnet = devnet_on_disk(&config, dir.path());

    let tx = signed_transfer(1, dev_address(5), 3 * COIN, 1);
    devnet.submit_everywhere(&tx);
    for offset in (3..=15).step_by(3) {
        devnet.step(T0 + offset);
    }

    let (tail, lib, canonical, receiver) = {
        let chain = &devnet.chains[0];
        assert!(chain.lib().height() >= 1);
        let canonical: Vec<_> = (0..=chain.tail().height())
            .map(|h| chain.get_block_by_height(h).unwrap().hash())
            .collect();
        (
            chain.tail().hash(),
            chain.lib().hash(),
            canonical,
            chain.account_at_tail(&dev_address(5)).unwrap(),
        )
    };
    assert_eq!(receiver.balance, 3 * COIN);

    // Release the RocksDB lock before reopening
    let stopped = std::mem::replace(&mut devnet.chains[0], chain_for(&config, 0));
    drop(stopped);
    devnet.chains[0] = chain_on(&config, 0, open_db(dir.path()));

    let chain = &devnet.chains[0];
    assert_eq!(chain.tail().hash(), tail);
    assert_eq!(chain.lib().hash(), lib);
    assert_eq!(chain.genesis().hash(), devnet.chains[1].genesis().hash());
    for (height, hash) in canonical.iter().enumerate() {
        assert_eq!(chain.get_block_by_height(height as u64).unwrap().hash(), *hash);
    }
    assert_eq!(chain.account_at_tail(&dev_address(5)).unwrap(), receiver);
    assert!(chain.is_included(&tx.hash()).unwrap());
    assert!(chain.tail().has_states());
    assert!(!chain.genesis().has_states());

    // Back in the rotation
    devnet.step(T0 + 18);
    devnet.step(T0 + 21);
    devnet.step(T0 + 24);
    for chain in &devnet.chains {
        assert_eq!(chain.tail().height(), 8);
        assert_eq!(chain.tail().hash(), devnet.chains[0].tail().hash());
    }
}

#[test]
fn test_reopen_with_other_genesis_refused() {
    let dir = TempDir::new().unwrap();
    drop(chain_on(&ChainConfig::devnet_poa(), 0, open_db(dir.path())));

    let other = ChainConfig::devnet_dpos();
    let storage = open_db(dir.path());
    let engine = build_engine(&other.consensus, storage.clone(), None);
    assert!(matches!(
        BlockChain::open(other, storage, engine),
        Err(ChainError::GenesisMismatch { .. })
    ));
}

#[test]
fn test_fresh_directory_sets_up_genesis() {
    let dir = TempDir::new().unwrap();
    let config = ChainConfig::devnet_dpos();

    let first = chain_on(&config, 0, open_db(dir.path()));
    let genesis = first.genesis().hash();
    drop(first);

    let reopened = chain_on(&config, 0, open_db(dir.path()));
    assert_eq!(reopened.genesis().hash(), genesis);
    assert_eq!(reopened.tail().hash(), genesis);
    assert_eq!(reopened.lib().hash(), genesis);
    assert!(reopened.tail().has_states());
}
