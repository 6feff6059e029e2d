// Orphan pruning - Branches that miss the LIB are dropped, their
// transactions go back to the pool exactly once

use super::common::*;
use crate::genesis::{dev_address, ChainConfig};
use crate::node::ChainError;
use crate::types::{Block, Transaction, COIN};

fn carries(block: &Block, tx: &Transaction) -> bool {
    block.transactions.iter().any(|t| t.hash() == tx.hash())
}

#[test]
fn test_orphaned_transactions_return_once() {
    let config = ChainConfig::devnet_dpos();
    let mut main = Devnet::new(config.clone(), 3);
    let mut shadow = Devnet::new(config, 3);

    let tx = signed_transfer(0, dev_address(7), COIN, 1);
    shadow.submit_everywhere(&tx);

    // Two competing height-1 blocks carrying the same transaction
    let (_, s1) = shadow.produce_at(T0 + 3).unwrap();
    let (_, s2) = shadow.produce_at(T0 + 6).unwrap();
    assert_eq!((s1.height(), s2.height()), (1, 1));
    assert!(carries(&s1, &tx) && carries(&s2, &tx));

    let (_, m1) = main.step(T0 + 3);
    main.deliver(0, &s1).unwrap();
    main.deliver(0, &s2).unwrap();
    assert_eq!(main.chains[0].blocks_at_height(1).len(), 3);
    assert!(main.chains[0].tx_pool().is_empty());

    main.step(T0 + 6);
    main.step(T0 + 9);

    let chain = &main.chains[0];
    assert_eq!(chain.lib().hash(), m1.hash());
    assert_eq!(chain.blocks_at_height(1).len(), 1);
    assert_eq!(chain.tx_pool().len(), 1);
    let returned = chain.tx_pool().peek().unwrap();
    assert_eq!(returned.hash(), tx.hash());
    assert_eq!(returned.height, 0);

    // Pruned blocks can no longer attach below the LIB
    assert!(matches!(
        main.deliver(0, &s1),
        Err(ChainError::BelowLib { height: 1, lib_height: 1 })
    ));

    // The returned transaction is picked up by the next block chain 0 makes
    let reincluded = (12..=18)
        .step_by(3)
        .find_map(|offset| produce(&mut main.chains[0], T0 + offset))
        .unwrap();
    assert!(carries(&reincluded, &tx));
}

#[test]
fn test_canonical_transactions_not_returned() {
    let config = ChainConfig::devnet_dpos();
    let mut main = Devnet::new(config.clone(), 3);
    let mut shadow = Devnet::new(config, 3);

    let tx = signed_transfer(0, dev_address(7), COIN, 1);
    main.submit_everywhere(&tx);
    shadow.submit_everywhere(&tx);

    let (_, m1) = main.step(T0 + 3);
    assert!(carries(&m1, &tx));
    for chain in &main.chains {
        assert!(chain.tx_pool().is_empty());
    }

    // Shadow producer of the T0+6 slot still has the transaction pooled
    let (_, s2) = shadow.produce_at(T0 + 6).unwrap();
    assert_eq!(s2.height(), 1);
    assert!(carries(&s2, &tx));
    main.deliver(0, &s2).unwrap();

    main.step(T0 + 6);
    main.step(T0 + 9);

    let chain = &main.chains[0];
    assert_eq!(chain.lib().hash(), m1.hash());
    assert_eq!(chain.blocks_at_height(1).len(), 1);
    assert!(chain.tx_pool().is_empty());
    assert!(chain.is_included(&tx.hash()).unwrap());
}

#[test]
fn test_states_released_below_lib() {
    let mut main = Devnet::new(ChainConfig::devnet_dpos(), 3);
    for offset in [3, 6, 9, 12] {
        main.step(T0 + offset);
    }

    for chain in &main.chains {
        let lib_height = chain.lib().height();
        assert!(lib_height >= 1);
        assert!(chain.lib().has_states());
        assert!(chain.tail().has_states());
        for height in 0..lib_height {
            assert!(!chain.get_block_by_height(height).unwrap().has_states());
        }
    }
}
