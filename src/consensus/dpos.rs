// DPoS - Stake-elected miner rounds
// Principle: the heaviest candidates mine, in a seeded order fixed for the whole round

use super::finality::find_new_lib;
use super::{
    assemble_block, leader_at, load_roots, store_roots, Consensus, ConsensusError, ConsensusState,
    Miner,
};
use crate::genesis::GenesisAccount;
use crate::node::blockchain::BlockChain;
use crate::storage::{AccountState, SharedStorage, Trie, TrieError};
use crate::types::{Address, Balance, Block, Hash, Header, Timestamp, Transaction};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DposConfig {
    /// Slot length in seconds
    pub period: u64,

    /// Full rotations per election
    pub round: u64,

    /// Miners per round
    pub total_miners: usize,
}

impl Default for DposConfig {
    fn default() -> Self {
        Self {
            period: 3,
            round: 10,
            total_miners: 3,
        }
    }
}

impl DposConfig {
    /// Seconds between elections
    pub fn round_span(&self) -> u64 {
        self.period
            .saturating_mul(self.round)
            .saturating_mul(self.total_miners as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DposRoots {
    candidates: Hash,
    miners: Hash,
    voters: Hash,
    miners_hash: Hash,
    elected_time: Timestamp,
}

// =============================================================================
// STATE
// =============================================================================

/// Candidate stakes, elected miner lists and per-voter stakes
#[derive(Debug, Clone)]
pub struct DposState {
    /// candidate -> total stake
    candidates: Trie,
    /// miners_hash -> ordered miner list
    miners: Trie,
    /// candidate ‖ voter -> stake
    voters: Trie,
    miners_hash: Hash,
    elected_time: Timestamp,
}

impl DposState {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            candidates: Trie::new(storage.clone()),
            miners: Trie::new(storage.clone()),
            voters: Trie::new(storage),
            miners_hash: Hash::ZERO,
            elected_time: 0,
        }
    }

    fn from_roots(storage: SharedStorage, roots: &DposRoots) -> Result<Self, ConsensusError> {
        Ok(Self {
            candidates: Trie::from_root(storage.clone(), roots.candidates)?,
            miners: Trie::from_root(storage.clone(), roots.miners)?,
            voters: Trie::from_root(storage, roots.voters)?,
            miners_hash: roots.miners_hash,
            elected_time: roots.elected_time,
        })
    }

    pub fn root_hash(&self) -> Hash {
        Hash::hash_parts(&[
            self.candidates.root_hash().as_bytes(),
            self.miners.root_hash().as_bytes(),
            self.voters.root_hash().as_bytes(),
            self.miners_hash.as_bytes(),
            &self.elected_time.to_le_bytes(),
        ])
    }

    pub fn elected_time(&self) -> Timestamp {
        self.elected_time
    }

    pub fn miners_hash(&self) -> Hash {
        self.miners_hash
    }

    pub fn candidate_stake(&self, candidate: &Address) -> Result<Balance, TrieError> {
        stake_or_zero(self.candidates.get_value(&candidate.to_bytes()))
    }

    pub fn voter_stake(&self, candidate: &Address, voter: &Address) -> Result<Balance, TrieError> {
        stake_or_zero(self.voters.get_value(&vote_key(candidate, voter)))
    }

    /// (candidate, stake) with non-zero stake
    pub fn candidates(&self) -> Result<Vec<(Address, Balance)>, ConsensusError> {
        let mut out = Vec::new();
        for entry in self.candidates.iterate() {
            let (key, value) = entry?;
            let address =
                Address::from_bytes(key).map_err(|e| ConsensusError::Codec(e.to_string()))?;
            let stake: Balance =
                bincode::deserialize(value).map_err(|e| ConsensusError::Codec(e.to_string()))?;
            if stake > 0 {
                out.push((address, stake));
            }
        }
        Ok(out)
    }

    /// Miners of the current round, in rotation order
    pub fn miner_list(&self) -> Result<Vec<Address>, ConsensusError> {
        if self.miners_hash.is_zero() {
            return Err(ConsensusError::NoProducers);
        }
        Ok(self.miners.get_value(self.miners_hash.as_bytes())?)
    }

    /// Top `total_miners` candidates by stake (ties by address), shuffled
    /// with `elected_time` as seed
    pub fn get_new_round_miners(
        &self,
        elected_time: Timestamp,
        total_miners: usize,
    ) -> Result<Vec<Address>, ConsensusError> {
        let mut ranked = self.candidates()?;
        if ranked.len() < total_miners {
            return Err(ConsensusError::InsufficientCandidates {
                needed: total_miners,
                available: ranked.len(),
            });
        }

        ranked.sort_by(|(a_addr, a_stake), (b_addr, b_stake)| {
            b_stake.cmp(a_stake).then_with(|| a_addr.cmp(b_addr))
        });

        let mut miners: Vec<Address> = ranked
            .into_iter()
            .take(total_miners)
            .map(|(address, _)| address)
            .collect();

        let mut rng = StdRng::seed_from_u64(elected_time);
        miners.shuffle(&mut rng);
        Ok(miners)
    }

    fn set_miners(&mut self, miners: &[Address], elected_time: Timestamp) -> Result<(), ConsensusError> {
        let encoded: Vec<[u8; crate::types::ADDRESS_LEN]> = miners.iter().map(|m| m.to_bytes()).collect();
        let parts: Vec<&[u8]> = encoded.iter().map(|b| b.as_slice()).collect();
        let miners_hash = Hash::hash_parts(&parts);

        self.miners.put_value(miners_hash.as_bytes(), &miners.to_vec())?;
        self.miners_hash = miners_hash;
        self.elected_time = elected_time;
        Ok(())
    }

    fn add_candidate_stake(&mut self, candidate: &Address, amount: Balance) -> Result<(), TrieError> {
        let stake = self.candidate_stake(candidate)?.saturating_add(amount);
        self.candidates.put_value(&candidate.to_bytes(), &stake)
    }

    /// Locks `tx.amount` of `tx.from`'s balance as stake for `tx.to`
    pub fn stake(&mut self, tx: &Transaction, accounts: &mut AccountState) -> Result<(), ConsensusError> {
        if tx.amount == 0 {
            return Err(ConsensusError::InvalidVote("zero stake".to_string()));
        }
        let mut voter = accounts.get_account(&tx.from)?;
        voter.stake(tx.to, tx.amount)?;

        self.add_candidate_stake(&tx.to, tx.amount)?;
        let key = vote_key(&tx.to, &tx.from);
        let voted = self.voter_stake(&tx.to, &tx.from)?.saturating_add(tx.amount);
        self.voters.put_value(&key, &voted)?;
        accounts.put_account(&voter)?;
        Ok(())
    }

    /// Releases `tx.amount` of `tx.from`'s stake on `tx.to`
    pub fn unstake(&mut self, tx: &Transaction, accounts: &mut AccountState) -> Result<(), ConsensusError> {
        if tx.amount == 0 {
            return Err(ConsensusError::InvalidVote("zero stake".to_string()));
        }
        let mut voter = accounts.get_account(&tx.from)?;
        voter.unstake(&tx.to, tx.amount)?;

        let key = vote_key(&tx.to, &tx.from);
        let voted = self.voter_stake(&tx.to, &tx.from)?.saturating_sub(tx.amount);
        if voted == 0 {
            self.voters.delete(&key).or_else(ignore_missing)?;
        } else {
            self.voters.put_value(&key, &voted)?;
        }

        let stake = self.candidate_stake(&tx.to)?.saturating_sub(tx.amount);
        if stake == 0 {
            self.candidates.delete(&tx.to.to_bytes()).or_else(ignore_missing)?;
        } else {
            self.candidates.put_value(&tx.to.to_bytes(), &stake)?;
        }

        accounts.put_account(&voter)?;
        Ok(())
    }

    fn commit(&self) -> Result<DposRoots, ConsensusError> {
        Ok(DposRoots {
            candidates: self.candidates.commit()?,
            miners: self.miners.commit()?,
            voters: self.voters.commit()?,
            miners_hash: self.miners_hash,
            elected_time: self.elected_time,
        })
    }
}

fn vote_key(candidate: &Address, voter: &Address) -> Vec<u8> {
    let mut key = candidate.to_bytes().to_vec();
    key.extend_from_slice(&voter.to_bytes());
    key
}

fn ignore_missing(e: TrieError) -> Result<(), TrieError> {
    match e {
        TrieError::NotFound => Ok(()),
        other => Err(other),
    }
}

fn stake_or_zero(stake: Result<Balance, TrieError>) -> Result<Balance, TrieError> {
    match stake {
        Err(TrieError::NotFound) => Ok(0),
        other => other,
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct Dpos {
    config: DposConfig,
    storage: SharedStorage,
    miner: Option<Miner>,
}

impl Dpos {
    pub fn new(config: DposConfig, storage: SharedStorage, miner: Option<Miner>) -> Self {
        Self {
            config,
            storage,
            miner,
        }
    }

    pub fn config(&self) -> &DposConfig {
        &self.config
    }

    fn state_of(block: &Block) -> Option<&DposState> {
        block.states().and_then(|s| s.consensus_state.as_dpos())
    }

    fn check_interval(&self, parent: &Header, time: Timestamp) -> Result<(), ConsensusError> {
        if time < parent.time.saturating_add(self.config.period) {
            return Err(ConsensusError::BlockTooEarly {
                parent_time: parent.time,
                time,
                period: self.config.period,
            });
        }
        Ok(())
    }
}

impl Consensus for Dpos {
    fn name(&self) -> &'static str {
        "dpos"
    }

    fn new_state(&self) -> ConsensusState {
        ConsensusState::Dpos(DposState::new(self.storage.clone()))
    }

    fn make_genesis_block(
        &self,
        block: &mut Block,
        voters: &[GenesisAccount],
    ) -> Result<(), ConsensusError> {
        let time = block.header.time;
        let states = block
            .states_mut()
            .ok_or_else(|| ConsensusError::Chain("genesis block has no states".to_string()))?;

        let mut state = DposState::new(self.storage.clone());
        for voter in voters.iter().filter(|v| v.stake > 0) {
            let mut account = states.account_state.get_or_create(&voter.address)?;
            account.peg_stake(voter.stake)?;
            states.account_state.put_account(&account)?;
            state.add_candidate_stake(&voter.address, voter.stake)?;
        }

        let miners = state.get_new_round_miners(time, self.config.total_miners)?;
        state.set_miners(&miners, time)?;
        info!("🗳️  Genesis miners elected: {}", format_miners(&miners));

        let consensus_hash = state.root_hash();
        states.consensus_state = ConsensusState::Dpos(state);
        block.header.consensus_hash = consensus_hash;
        Ok(())
    }

    /// Rolls the round over once `period · round · total_miners` seconds
    /// have passed since the last election
    fn prepare_state(
        &self,
        state: &mut ConsensusState,
        _parent: &Header,
        time: Timestamp,
    ) -> Result<(), ConsensusError> {
        let ConsensusState::Dpos(state) = state else {
            return Err(ConsensusError::StateKindMismatch);
        };

        if time < state.elected_time.saturating_add(self.config.round_span()) {
            return Ok(());
        }

        match state.get_new_round_miners(time, self.config.total_miners) {
            Ok(miners) => {
                state.set_miners(&miners, time)?;
                info!("🗳️  New round at {}: {}", time, format_miners(&miners));
                Ok(())
            }
            Err(ConsensusError::InsufficientCandidates { needed, available }) => {
                warn!(
                    "⚠️  Election skipped ({} of {} candidates), keeping previous miners",
                    available, needed
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn make_block(
        &self,
        chain: &mut BlockChain,
        now: Timestamp,
    ) -> Result<Option<Block>, ConsensusError> {
        let Some(miner) = self.miner.as_ref() else {
            return Ok(None);
        };

        let tail = chain.tail();
        if self.check_interval(&tail.header, now).is_err() {
            return Ok(None);
        }

        let mut prospective = tail
            .states()
            .map(|s| s.consensus_state.clone())
            .ok_or(ConsensusError::StateKindMismatch)?;
        self.prepare_state(&mut prospective, &tail.header, now)?;
        let miners = prospective
            .as_dpos()
            .ok_or(ConsensusError::StateKindMismatch)?
            .miner_list()?;

        let leader = leader_at(&miners, self.config.period, now).ok_or(ConsensusError::NoProducers)?;
        if leader != miner.address {
            return Ok(None);
        }

        assemble_block(chain, self, miner, now, 0).map(Some)
    }

    /// Turn is judged against the block's own miner list (after any
    /// round rollover it triggered)
    fn verify(&self, chain: &BlockChain, block: &Block) -> Result<(), ConsensusError> {
        let parent = chain
            .get_block_by_hash(&block.parent_hash())
            .ok_or_else(|| ConsensusError::Chain(format!("parent {} not found", block.parent_hash())))?;
        self.check_interval(&parent.header, block.header.time)?;

        let miners = Self::state_of(block)
            .ok_or(ConsensusError::StateKindMismatch)?
            .miner_list()?;
        let expected = leader_at(&miners, self.config.period, block.header.time)
            .ok_or(ConsensusError::NoProducers)?;
        if expected != block.coinbase() {
            return Err(ConsensusError::WrongTurn {
                expected,
                got: block.coinbase(),
            });
        }
        Ok(())
    }

    fn save_state(&self, block: &Block) -> Result<(), ConsensusError> {
        let state = Self::state_of(block).ok_or(ConsensusError::StateKindMismatch)?;
        let roots = state.commit()?;
        store_roots(&self.storage, &block.header, &roots)
    }

    fn load_state(&self, header: &Header) -> Result<ConsensusState, ConsensusError> {
        let roots: DposRoots = load_roots(&self.storage, &header.consensus_hash)?;
        let state = DposState::from_roots(self.storage.clone(), &roots)?;
        if state.root_hash() != header.consensus_hash {
            return Err(ConsensusError::StateNotFound(header.consensus_hash));
        }
        Ok(ConsensusState::Dpos(state))
    }

    /// Full participation: every miner of the round must appear in one window
    fn update_lib(&self, chain: &BlockChain) -> Option<Hash> {
        let tail = chain.tail();
        find_new_lib(
            chain.ancestors(tail.hash()),
            chain.lib(),
            self.config.total_miners,
            self.config.total_miners,
            |_| true,
        )
    }
}

fn format_miners(miners: &[Address]) -> String {
    miners
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
