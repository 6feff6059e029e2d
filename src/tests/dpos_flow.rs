// DPoS flow - Elections, stake votes and windowed finality on a devnet

use super::common::*;
use crate::consensus::{ConsensusError, DposConfig, DposState};
use crate::genesis::{dev_address, ChainConfig, ConsensusConfig};
use crate::node::BlockChain;
use crate::types::{Address, PayloadCode, COIN};
use std::collections::HashSet;

fn dpos_state(chain: &BlockChain) -> &DposState {
    chain
        .tail()
        .states()
        .and_then(|s| s.consensus_state.as_dpos())
        .unwrap()
}

fn round_span(config: &ChainConfig) -> u64 {
    match &config.consensus {
        ConsensusConfig::Dpos(c) => c.round_span(),
        _ => panic!("not a dpos config"),
    }
}

// =============================================================================
// FINALITY
// =============================================================================

#[test]
fn test_lib_after_three_distinct_producers() {
    let mut devnet = Devnet::new(ChainConfig::devnet_dpos(), 3);

    let mut producers: HashSet<Address> = HashSet::new();
    let (_, first) = devnet.step(T0 + 3);
    producers.insert(first.coinbase());
    for offset in [6, 9] {
        let (_, block) = devnet.step(T0 + offset);
        producers.insert(block.coinbase());
    }
    assert_eq!(producers.len(), 3);

    for chain in &devnet.chains {
        assert_eq!(chain.tail().height(), 3);
        assert_eq!(chain.lib().hash(), first.hash());
    }
}

#[test]
fn test_lib_waits_for_full_participation() {
    let mut devnet = Devnet::new(ChainConfig::devnet_dpos(), 3);
    devnet.step(T0 + 3);
    devnet.step(T0 + 6);

    for chain in &devnet.chains {
        assert_eq!(chain.lib().height(), 0);
    }
}

// =============================================================================
// ELECTIONS
// =============================================================================

#[test]
fn test_genesis_elects_all_staked_candidates() {
    let devnet = Devnet::new(ChainConfig::devnet_dpos(), 3);
    let state = dpos_state(&devnet.chains[0]);

    let mut miners = state.miner_list().unwrap();
    miners.sort();
    let mut expected: Vec<Address> = (0..3).map(dev_address).collect();
    expected.sort();
    assert_eq!(miners, expected);
    assert_eq!(state.elected_time(), T0);

    // Identical genesis everywhere
    assert_eq!(devnet.chains[0].genesis().hash(), devnet.chains[2].genesis().hash());
}

#[test]
fn test_round_rollover_reelects() {
    let config = ChainConfig::devnet_dpos();
    let span = round_span(&config);
    let mut devnet = Devnet::new(config, 3);

    let mut offset = 3;
    while offset <= span + 3 {
        devnet.step(T0 + offset);
        offset += 3;
    }

    for chain in &devnet.chains {
        assert_eq!(dpos_state(chain).elected_time(), T0 + span);
        assert_eq!(dpos_state(chain).miner_list().unwrap().len(), 3);
    }
}

#[test]
fn test_short_candidate_list_fails_genesis() {
    let mut config = ChainConfig::devnet_dpos();
    config.consensus = ConsensusConfig::Dpos(DposConfig {
        total_miners: 4,
        ..DposConfig::default()
    });
    let storage = crate::storage::MemoryStorage::shared();
    let engine = crate::consensus::build_engine(&config.consensus, storage.clone(), None);

    let result = BlockChain::setup(config, storage, engine);
    assert!(matches!(
        result,
        Err(crate::node::ChainError::Consensus(ConsensusError::InsufficientCandidates {
            needed: 4,
            available: 3
        }))
    ));
}

// =============================================================================
// STAKE VOTES
// =============================================================================

#[test]
fn test_stake_vote_moves_candidate_stake() {
    let mut devnet = Devnet::new(ChainConfig::devnet_dpos(), 3);
    let before = dpos_state(&devnet.chains[0]).candidate_stake(&dev_address(1)).unwrap();

    let vote = signed_payload(0, dev_address(1), 50 * COIN, 1, PayloadCode::VoteStake);
    devnet.submit_everywhere(&vote);
    let (_, block) = devnet.step(T0 + 3);
    assert_eq!(block.transactions.len(), 1);

    for chain in &devnet.chains {
        let state = dpos_state(chain);
        assert_eq!(state.candidate_stake(&dev_address(1)).unwrap(), before + 50 * COIN);
        assert_eq!(state.voter_stake(&dev_address(1), &dev_address(0)).unwrap(), 50 * COIN);

        let voter = chain.account_at_tail(&dev_address(0)).unwrap();
        assert_eq!(voter.staked_to(&dev_address(1)), 50 * COIN);
        assert_eq!(voter.nonce, 1);
        assert!(chain.tx_pool().is_empty());
    }

    let unstake = signed_payload(0, dev_address(1), 20 * COIN, 2, PayloadCode::VoteUnstake);
    devnet.submit_everywhere(&unstake);
    devnet.step(T0 + 6);

    let state = dpos_state(&devnet.chains[1]);
    assert_eq!(state.candidate_stake(&dev_address(1)).unwrap(), before + 30 * COIN);
}

#[test]
fn test_unstake_without_stake_is_dropped() {
    let mut devnet = Devnet::new(ChainConfig::devnet_dpos(), 3);

    let unstake = signed_payload(0, dev_address(1), 10 * COIN, 1, PayloadCode::VoteUnstake);
    devnet.submit_everywhere(&unstake);
    let (producer, block) = devnet.step(T0 + 3);

    assert!(block.transactions.is_empty());
    let chain = &devnet.chains[producer];
    assert!(chain.tx_pool().is_empty());
    assert_eq!(chain.account_at_tail(&dev_address(0)).unwrap().nonce, 0);
}

#[test]
fn test_signer_ballot_unsupported_under_dpos() {
    let mut devnet = Devnet::new(ChainConfig::devnet_dpos(), 3);

    let ballot = signed_payload(0, dev_address(5), 0, 1, PayloadCode::AddSigner);
    devnet.submit_everywhere(&ballot);
    let (_, block) = devnet.step(T0 + 3);
    assert!(block.transactions.is_empty());
}
