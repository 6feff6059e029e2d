// PoA - Rotating authority set, amended by majority vote
// Principle: a signer joins or leaves only when more than half of the current set agrees

use super::finality::{find_new_lib, two_thirds_quorum};
use super::{
    assemble_block, assemble_block_with, leader_at, load_roots, store_roots, Consensus,
    ConsensusError, ConsensusState, Miner,
};
use crate::genesis::GenesisAccount;
use crate::node::blockchain::BlockChain;
use crate::storage::{SharedStorage, Trie};
use crate::types::{Address, Block, BlockNumber, Hash, Header, PayloadCode, Timestamp, Transaction, ADDRESS_LEN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Minimum signer count for finality to be meaningful
pub const MIN_FINALITY_SIGNERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoaConfig {
    /// Slot length in seconds
    pub period: u64,
}

impl Default for PoaConfig {
    fn default() -> Self {
        Self { period: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Ballot {
    Add,
    Remove,
}

/// Signer-set membership recorded at each height where it changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSnapshot {
    pub signers_root: Hash,
    pub signer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoaRoots {
    snapshot: Hash,
    voters: Hash,
    signers: Hash,
}

// =============================================================================
// STATE
// =============================================================================

/// Three tries: snapshots (height -> membership), open ballots
/// (candidate ‖ voter -> ballot) and the signer set itself
#[derive(Debug, Clone)]
pub struct PoaState {
    snapshot: Trie,
    voters: Trie,
    signers: Trie,
    /// Signers that already voted in the block being built (not committed)
    voted: BTreeSet<Address>,
}

impl PoaState {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            snapshot: Trie::new(storage.clone()),
            voters: Trie::new(storage.clone()),
            signers: Trie::new(storage),
            voted: BTreeSet::new(),
        }
    }

    fn from_roots(storage: SharedStorage, roots: &PoaRoots) -> Result<Self, ConsensusError> {
        Ok(Self {
            snapshot: Trie::from_root(storage.clone(), roots.snapshot)?,
            voters: Trie::from_root(storage.clone(), roots.voters)?,
            signers: Trie::from_root(storage, roots.signers)?,
            voted: BTreeSet::new(),
        })
    }

    pub fn root_hash(&self) -> Hash {
        Hash::hash_parts(&[
            self.snapshot.root_hash().as_bytes(),
            self.voters.root_hash().as_bytes(),
            self.signers.root_hash().as_bytes(),
        ])
    }

    /// Signers in address order (the rotation order)
    pub fn signers(&self) -> Result<Vec<Address>, ConsensusError> {
        self.signers
            .iterate()
            .map(|entry| {
                let (key, _) = entry?;
                Address::from_bytes(key).map_err(|e| ConsensusError::Codec(e.to_string()))
            })
            .collect()
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    pub fn is_signer(&self, address: &Address) -> Result<bool, ConsensusError> {
        Ok(self.signers.contains(&address.to_bytes())?)
    }

    pub fn snapshot_at(&self, height: BlockNumber) -> Option<SignerSnapshot> {
        self.snapshot.get_value(&height.to_be_bytes()).ok()
    }

    /// Number of signers currently backing `ballot` for `candidate`
    fn tally(&self, candidate: &Address, ballot: Ballot) -> Result<usize, ConsensusError> {
        let prefix = candidate.to_bytes();
        let mut votes = 0;
        for entry in self.voters.iterate_prefix(&prefix) {
            let (key, value) = entry?;
            let voter = Address::from_bytes(&key[ADDRESS_LEN..])
                .map_err(|e| ConsensusError::Codec(e.to_string()))?;
            let cast: Ballot =
                bincode::deserialize(value).map_err(|e| ConsensusError::Codec(e.to_string()))?;
            if cast == ballot && self.is_signer(&voter)? {
                votes += 1;
            }
        }
        Ok(votes)
    }

    fn add_signer(&mut self, address: &Address) -> Result<(), ConsensusError> {
        self.signers.put(&address.to_bytes(), vec![1])?;
        Ok(())
    }

    fn record_snapshot(&mut self, height: BlockNumber) -> Result<(), ConsensusError> {
        let snapshot = SignerSnapshot {
            signers_root: self.signers.root_hash(),
            signer_count: self.signer_count() as u32,
        };
        self.snapshot.put_value(&height.to_be_bytes(), &snapshot)?;
        Ok(())
    }

    /// Drops every open ballot about `candidate`
    fn purge_votes_for(&mut self, candidate: &Address) -> Result<(), ConsensusError> {
        let prefix = candidate.to_bytes();
        let keys = self
            .voters
            .iterate_prefix(&prefix)
            .map(|entry| entry.map(|(key, _)| key.to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        for key in keys {
            self.voters.delete(&key)?;
        }
        Ok(())
    }

    /// Drops every open ballot cast by `voter`
    fn purge_votes_by(&mut self, voter: &Address) -> Result<(), ConsensusError> {
        let voter_bytes = voter.to_bytes();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for entry in self.voters.iterate() {
            let (key, _) = entry?;
            if key[ADDRESS_LEN..] == voter_bytes[..] {
                keys.push(key.to_vec());
            }
        }
        for key in keys {
            self.voters.delete(&key)?;
        }
        Ok(())
    }

    /// Resets per-block bookkeeping
    fn begin_block(&mut self) {
        self.voted.clear();
    }

    /// Casts `tx.from`'s ballot about `tx.to`; flips membership on majority
    ///
    /// All checks run before anything is written.
    pub fn vote(&mut self, tx: &Transaction, height: BlockNumber) -> Result<(), ConsensusError> {
        let voter = tx.from;
        let candidate = tx.to;

        let ballot = match tx.payload.code {
            PayloadCode::AddSigner => Ballot::Add,
            PayloadCode::RemoveSigner => Ballot::Remove,
            code => return Err(ConsensusError::UnsupportedPayload(code)),
        };
        if !self.is_signer(&voter)? {
            return Err(ConsensusError::NotSigner(voter));
        }
        if self.voted.contains(&voter) {
            return Err(ConsensusError::AlreadyVoted(voter));
        }
        let candidate_is_signer = self.is_signer(&candidate)?;
        match ballot {
            Ballot::Add if candidate_is_signer => {
                return Err(ConsensusError::InvalidVote(format!("{} is already a signer", candidate)));
            }
            Ballot::Remove if !candidate_is_signer => {
                return Err(ConsensusError::InvalidVote(format!("{} is not a signer", candidate)));
            }
            Ballot::Remove if self.signer_count() == 1 => {
                return Err(ConsensusError::InvalidVote("cannot remove the last signer".to_string()));
            }
            _ => {}
        }

        let mut key = candidate.to_bytes().to_vec();
        key.extend_from_slice(&voter.to_bytes());
        self.voters.put_value(&key, &ballot)?;
        self.voted.insert(voter);

        let votes = self.tally(&candidate, ballot)?;
        if votes <= self.signer_count() / 2 {
            debug!("🗳️  {:?} vote for {} ({}/{})", ballot, candidate, votes, self.signer_count());
            return Ok(());
        }

        match ballot {
            Ballot::Add => {
                self.add_signer(&candidate)?;
                info!("➕ Signer {} admitted at #{}", candidate, height);
            }
            Ballot::Remove => {
                self.signers.delete(&candidate.to_bytes())?;
                self.purge_votes_by(&candidate)?;
                info!("➖ Signer {} removed at #{}", candidate, height);
            }
        }
        self.purge_votes_for(&candidate)?;
        self.record_snapshot(height)
    }

    fn commit(&self) -> Result<PoaRoots, ConsensusError> {
        Ok(PoaRoots {
            snapshot: self.snapshot.commit()?,
            voters: self.voters.commit()?,
            signers: self.signers.commit()?,
        })
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct Poa {
    config: PoaConfig,
    storage: SharedStorage,
    miner: Option<Miner>,
}

impl Poa {
    pub fn new(config: PoaConfig, storage: SharedStorage, miner: Option<Miner>) -> Self {
        Self {
            config,
            storage,
            miner,
        }
    }

    fn state_of(block: &Block) -> Option<&PoaState> {
        block.states().and_then(|s| s.consensus_state.as_poa())
    }

    fn signer_count_of(block: &Block) -> Option<usize> {
        Self::state_of(block).map(|s| s.signer_count())
    }

    /// Slot owner at the block's time under the block's own signer set
    fn slot_owner(&self, block: &Block) -> Result<Address, ConsensusError> {
        let signers = Self::state_of(block)
            .ok_or(ConsensusError::StateKindMismatch)?
            .signers()?;
        leader_at(&signers, self.config.period, block.header.time).ok_or(ConsensusError::NoProducers)
    }
}

fn is_ballot(tx: &Transaction) -> bool {
    matches!(
        tx.payload.code,
        PayloadCode::AddSigner | PayloadCode::RemoveSigner
    )
}

impl Consensus for Poa {
    fn name(&self) -> &'static str {
        "poa"
    }

    fn new_state(&self) -> ConsensusState {
        ConsensusState::Poa(PoaState::new(self.storage.clone()))
    }

    fn make_genesis_block(
        &self,
        block: &mut Block,
        voters: &[GenesisAccount],
    ) -> Result<(), ConsensusError> {
        let mut state = PoaState::new(self.storage.clone());
        for voter in voters.iter().filter(|v| v.signer) {
            state.add_signer(&voter.address)?;
        }
        if state.signer_count() == 0 {
            return Err(ConsensusError::NoProducers);
        }
        state.record_snapshot(block.height())?;

        block.header.consensus_hash = state.root_hash();
        let states = block
            .states_mut()
            .ok_or_else(|| ConsensusError::Chain("genesis block has no states".to_string()))?;
        states.consensus_state = ConsensusState::Poa(state);
        Ok(())
    }

    fn prepare_state(
        &self,
        state: &mut ConsensusState,
        _parent: &Header,
        _time: Timestamp,
    ) -> Result<(), ConsensusError> {
        match state {
            ConsensusState::Poa(state) => {
                state.begin_block();
                Ok(())
            }
            _ => Err(ConsensusError::StateKindMismatch),
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
        if now < tail.header.time.saturating_add(self.config.period) {
            return Ok(None);
        }
        let signers = Self::state_of(tail)
            .ok_or(ConsensusError::StateKindMismatch)?
            .signers()?;
        let leader = leader_at(&signers, self.config.period, now).ok_or(ConsensusError::NoProducers)?;
        if leader != miner.address {
            return Ok(None);
        }

        let block = assemble_block(chain, self, miner, now, 0)?;
        if self.slot_owner(&block)? == miner.address {
            return Ok(Some(block));
        }

        // The ballots hand this slot to another signer; they wait for a later block
        debug!("🗳️  Deferring ballots at #{}: they would move slot {} away", block.height(), now);
        chain.return_transactions(block.transactions);
        assemble_block_with(chain, self, miner, now, 0, |tx| !is_ballot(tx)).map(Some)
    }

    /// Turn is judged against the block's own signer set, so a block whose
    /// ballots change the set must still land on its producer's slot.
    fn verify(&self, chain: &BlockChain, block: &Block) -> Result<(), ConsensusError> {
        let parent = chain
            .get_block_by_hash(&block.parent_hash())
            .ok_or_else(|| ConsensusError::Chain(format!("parent {} not found", block.parent_hash())))?;

        let earliest = parent.header.time.saturating_add(self.config.period);
        if block.header.time < earliest {
            return Err(ConsensusError::BlockTooEarly {
                parent_time: parent.header.time,
                time: block.header.time,
                period: self.config.period,
            });
        }

        let expected = self.slot_owner(block)?;
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
        let roots: PoaRoots = load_roots(&self.storage, &header.consensus_hash)?;
        let state = PoaState::from_roots(self.storage.clone(), &roots)?;
        if state.root_hash() != header.consensus_hash {
            return Err(ConsensusError::StateNotFound(header.consensus_hash));
        }
        Ok(ConsensusState::Poa(state))
    }

    fn update_lib(&self, chain: &BlockChain) -> Option<Hash> {
        let tail = chain.tail();
        let signer_count = Self::signer_count_of(tail)?;
        if signer_count < MIN_FINALITY_SIGNERS {
            return None;
        }

        find_new_lib(
            chain.ancestors(tail.hash()),
            chain.lib(),
            signer_count,
            two_thirds_quorum(signer_count),
            |block| Self::signer_count_of(block) == Some(signer_count),
        )
    }
}
