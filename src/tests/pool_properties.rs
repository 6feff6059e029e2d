// Pool properties - FIFO order, uniqueness and nonce-gap resolution

use super::common::*;
use crate::genesis::dev_address;
use crate::node::{MempoolConfig, PoolError, TransactionPool};
use crate::types::{Address, Transaction};
use proptest::prelude::*;
use std::collections::HashSet;

fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(32);
    ProptestConfig {
        cases,
        ..ProptestConfig::default()
    }
}

fn unchecked_pool(max_size: usize) -> TransactionPool {
    TransactionPool::with_config(MempoolConfig {
        max_size,
        verify_signatures: false,
    })
}

fn arb_transaction() -> impl Strategy<Value = Transaction> {
    (0u8..4, 1u64..6, 1u128..4).prop_map(|(sender, nonce, amount)| {
        Transaction::transfer(
            Address::from_public_key_bytes([sender; 32]),
            Address::from_public_key_bytes([0xEE; 32]),
            amount,
            nonce,
        )
    })
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn pool_pops_in_arrival_order(txs in proptest::collection::vec(arb_transaction(), 0..40)) {
        let mut pool = unchecked_pool(usize::MAX);
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();

        for tx in txs {
            let fresh = seen.insert(tx.hash());
            match pool.push(tx.clone()) {
                Ok(()) => {
                    prop_assert!(fresh);
                    accepted.push(tx.hash());
                }
                Err(PoolError::AlreadyExists(hash)) => {
                    prop_assert!(!fresh);
                    prop_assert_eq!(hash, tx.hash());
                }
                Err(other) => prop_assert!(false, "unexpected pool error: {}", other),
            }
        }

        prop_assert_eq!(pool.len(), accepted.len());
        let popped: Vec<_> = std::iter::from_fn(|| pool.pop()).map(|tx| tx.hash()).collect();
        prop_assert_eq!(popped, accepted);
        prop_assert!(pool.is_empty());
    }

    #[test]
    fn pool_never_exceeds_capacity(
        txs in proptest::collection::vec(arb_transaction(), 0..40),
        max_size in 1usize..10,
    ) {
        let mut pool = unchecked_pool(max_size);
        for tx in txs {
            let _ = pool.push(tx);
            prop_assert!(pool.len() <= max_size);
        }
        let stats = pool.stats();
        prop_assert_eq!(stats.total_added as usize, pool.len());
    }

    #[test]
    fn removing_included_keeps_relative_order(
        txs in proptest::collection::vec(arb_transaction(), 0..30),
        mask in proptest::collection::vec(any::<bool>(), 30),
    ) {
        let mut pool = unchecked_pool(usize::MAX);
        let mut queued = Vec::new();
        for tx in txs {
            if pool.push(tx.clone()).is_ok() {
                queued.push(tx);
            }
        }

        let included: Vec<Transaction> = queued
            .iter()
            .zip(&mask)
            .filter(|(_, drop)| **drop)
            .map(|(tx, _)| tx.clone())
            .collect();
        let dropped: HashSet<_> = included.iter().map(|tx| tx.hash()).collect();
        pool.remove_included(&included);

        let expected: Vec<_> = queued
            .iter()
            .map(|tx| tx.hash())
            .filter(|hash| !dropped.contains(hash))
            .collect();
        let remaining: Vec<_> = std::iter::from_fn(|| pool.pop()).map(|tx| tx.hash()).collect();
        prop_assert_eq!(remaining, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 8, ..ProptestConfig::default() })]

    /// Whatever order a sender's nonces arrive in, one block takes them all
    #[test]
    fn shuffled_nonces_fill_one_block(
        order in Just((1u64..=6).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let config = easy_pow();
        let mut chain = chain_for(&config, 0);
        for nonce in &order {
            chain
                .submit_transaction(signed_transfer(1, dev_address(8), 1, *nonce))
                .unwrap();
        }

        let block = produce(&mut chain, T0 + 10).unwrap();
        let nonces: Vec<u64> = block.transactions.iter().map(|tx| tx.nonce).collect();
        prop_assert_eq!(nonces, (1u64..=6).collect::<Vec<_>>());
        prop_assert!(chain.tx_pool().is_empty());
        prop_assert_eq!(chain.account_at_tail(&dev_address(1)).unwrap().nonce, 6);
    }
}
