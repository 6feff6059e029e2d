// Consensus - Pluggable block production, validation and finality
// Principle: the chain core never knows which engine is running

pub mod finality;
pub mod poa;
pub mod dpos;
pub mod pow;

pub use dpos::{Dpos, DposConfig, DposState};
pub use poa::{Poa, PoaConfig, PoaState};
pub use pow::{Pow, PowConfig};

use crate::genesis::{ConsensusConfig, GenesisAccount};
use crate::node::blockchain::{BlockChain, TipHeight};
use crate::storage::{AccountState, SharedStorage, StorageError, TrieError, WriteOp};
use crate::types::{
    AccountError, Address, Block, BlockNumber, Hash, Header, PayloadCode, Timestamp, Transaction,
};
use crate::wallet::Wallet;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

const PREFIX_CONSENSUS_ROOTS: &[u8] = b"consensus_roots:";
const PREFIX_CONSENSUS_BY_NUMBER: &[u8] = b"consensus_by_num:";

// =============================================================================
// ENGINE CONTRACT
// =============================================================================

/// Consensus engine
///
/// Engines are stateless apart from configuration and their miner identity;
/// everything that evolves with the chain lives in `ConsensusState`, carried
/// per block.
pub trait Consensus: Send + Sync {
    fn name(&self) -> &'static str;

    /// Empty engine state
    fn new_state(&self) -> ConsensusState;

    /// Seeds engine state into the genesis block and sets its consensus hash
    fn make_genesis_block(
        &self,
        block: &mut Block,
        voters: &[GenesisAccount],
    ) -> Result<(), ConsensusError>;

    /// Engine bookkeeping that precedes transaction execution for a block
    /// built at `time` on top of `parent`
    fn prepare_state(
        &self,
        state: &mut ConsensusState,
        parent: &Header,
        time: Timestamp,
    ) -> Result<(), ConsensusError>;

    /// Builds a block on the tail when this node is entitled to at `now`
    ///
    /// `Ok(None)` means not our turn (or nothing to do yet).
    fn make_block(
        &self,
        chain: &mut BlockChain,
        now: Timestamp,
    ) -> Result<Option<Block>, ConsensusError>;

    /// Final sealing step, run outside the chain lock
    ///
    /// Returns `None` when sealing was abandoned because the published chain
    /// height reached the block's height.
    fn seal_block(&self, block: Block, _tip_height: &TipHeight) -> Option<Block> {
        Some(block)
    }

    /// Engine rules for a block whose states are already built
    fn verify(&self, chain: &BlockChain, block: &Block) -> Result<(), ConsensusError>;

    /// Persists the block's engine state under its consensus hash
    fn save_state(&self, block: &Block) -> Result<(), ConsensusError>;

    /// Reopens the engine state a header commits to
    fn load_state(&self, header: &Header) -> Result<ConsensusState, ConsensusError>;

    /// New last irreversible block, if it advanced
    fn update_lib(&self, chain: &BlockChain) -> Option<Hash>;

    /// How far below the tail canonical blocks keep in-memory states
    ///
    /// `None` keeps them from the LIB up, which suits engines whose LIB
    /// follows the tail.
    fn state_retention_depth(&self) -> Option<u64> {
        None
    }
}

/// Builds the configured engine
pub fn build_engine(
    config: &ConsensusConfig,
    storage: SharedStorage,
    miner: Option<Miner>,
) -> Arc<dyn Consensus> {
    match config {
        ConsensusConfig::Poa(c) => Arc::new(Poa::new(c.clone(), storage, miner)),
        ConsensusConfig::Dpos(c) => Arc::new(Dpos::new(c.clone(), storage, miner)),
        ConsensusConfig::Pow(c) => Arc::new(Pow::new(c.clone(), miner)),
    }
}

// =============================================================================
// ENGINE STATE
// =============================================================================

#[derive(Debug, Clone)]
pub enum ConsensusState {
    Poa(PoaState),
    Dpos(DposState),
    Pow,
}

impl ConsensusState {
    pub fn root_hash(&self) -> Hash {
        match self {
            ConsensusState::Poa(state) => state.root_hash(),
            ConsensusState::Dpos(state) => state.root_hash(),
            ConsensusState::Pow => Hash::ZERO,
        }
    }

    /// Applies an engine payload; transfers never reach this point
    ///
    /// Either every effect lands or none does.
    pub fn execute_transaction(
        &mut self,
        tx: &Transaction,
        height: BlockNumber,
        accounts: &mut AccountState,
    ) -> Result<(), ConsensusError> {
        match (self, tx.payload.code) {
            (ConsensusState::Dpos(state), PayloadCode::VoteStake) => state.stake(tx, accounts),
            (ConsensusState::Dpos(state), PayloadCode::VoteUnstake) => state.unstake(tx, accounts),
            (ConsensusState::Poa(state), PayloadCode::AddSigner)
            | (ConsensusState::Poa(state), PayloadCode::RemoveSigner) => state.vote(tx, height),
            (_, code) => Err(ConsensusError::UnsupportedPayload(code)),
        }
    }

    pub fn as_poa(&self) -> Option<&PoaState> {
        match self {
            ConsensusState::Poa(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_dpos(&self) -> Option<&DposState> {
        match self {
            ConsensusState::Dpos(state) => Some(state),
            _ => None,
        }
    }
}

// =============================================================================
// MINER IDENTITY
// =============================================================================

/// Local producer identity: coinbase address plus the wallet holding its key
#[derive(Clone)]
pub struct Miner {
    pub address: Address,
    pub wallet: Arc<dyn Wallet>,
}

impl Miner {
    pub fn new(address: Address, wallet: Arc<dyn Wallet>) -> Self {
        Self { address, wallet }
    }

    pub fn sign_header(&self, header: &mut Header) -> Result<(), ConsensusError> {
        header.signature = self
            .wallet
            .sign_hash(&self.address, &header.signing_hash())
            .map_err(|e| ConsensusError::Wallet(e.to_string()))?;
        Ok(())
    }
}

// =============================================================================
// SHARED HELPERS
// =============================================================================

/// Slot owner at `time` for a rotating producer list
pub(crate) fn leader_at(producers: &[Address], period: u64, time: Timestamp) -> Option<Address> {
    if producers.is_empty() || period == 0 {
        return None;
    }
    let n = producers.len() as u64;
    let index = (time % (n * period)) / period;
    producers.get(index as usize).copied()
}

/// Tail block -> prepared states -> reward + pool transactions -> sealed, signed block
pub(crate) fn assemble_block(
    chain: &mut BlockChain,
    engine: &dyn Consensus,
    miner: &Miner,
    now: Timestamp,
    difficulty: u64,
) -> Result<Block, ConsensusError> {
    assemble_block_with(chain, engine, miner, now, difficulty, |_| true)
}

/// `assemble_block` drawing only the pool transactions `admit` accepts
pub(crate) fn assemble_block_with(
    chain: &mut BlockChain,
    engine: &dyn Consensus,
    miner: &Miner,
    now: Timestamp,
    difficulty: u64,
    admit: impl Fn(&Transaction) -> bool,
) -> Result<Block, ConsensusError> {
    let parent = chain.tail().header.clone();
    let mut block = chain
        .new_block_from_tail()
        .map_err(|e| ConsensusError::Chain(e.to_string()))?;

    block.header.time = now;
    block.header.coinbase = miner.address;
    block.header.difficulty = difficulty;

    let states = block
        .states_mut()
        .ok_or_else(|| ConsensusError::Chain("new block has no states".to_string()))?;
    engine.prepare_state(&mut states.consensus_state, &parent, now)?;

    chain
        .fill_block_with(&mut block, admit)
        .map_err(|e| ConsensusError::Chain(e.to_string()))?;

    block.seal();
    miner.sign_header(&mut block.header)?;
    Ok(block)
}

/// Records the engine's trie roots under the block's consensus hash
pub(crate) fn store_roots<T: Serialize>(
    storage: &SharedStorage,
    header: &Header,
    roots: &T,
) -> Result<(), ConsensusError> {
    let value = bincode::serialize(roots).map_err(|e| ConsensusError::Codec(e.to_string()))?;

    let mut by_number = PREFIX_CONSENSUS_BY_NUMBER.to_vec();
    by_number.extend_from_slice(&header.height.to_be_bytes());

    storage.write_batch(vec![
        WriteOp::Put {
            key: roots_key(&header.consensus_hash),
            value,
        },
        WriteOp::Put {
            key: by_number,
            value: header.consensus_hash.as_bytes().to_vec(),
        },
    ])?;
    Ok(())
}

pub(crate) fn load_roots<T: DeserializeOwned>(
    storage: &SharedStorage,
    consensus_hash: &Hash,
) -> Result<T, ConsensusError> {
    let bytes = match storage.get(&roots_key(consensus_hash)) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound) => return Err(ConsensusError::StateNotFound(*consensus_hash)),
        Err(e) => return Err(e.into()),
    };
    bincode::deserialize(&bytes).map_err(|e| ConsensusError::Codec(e.to_string()))
}

fn roots_key(consensus_hash: &Hash) -> Vec<u8> {
    let mut key = PREFIX_CONSENSUS_ROOTS.to_vec();
    key.extend_from_slice(consensus_hash.as_bytes());
    key
}

// =============================================================================
// ERRORS
// =============================================================================

/// Consensus errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("Wrong turn: expected producer {expected}, got {got}")]
    WrongTurn { expected: Address, got: Address },

    #[error("Block too early: parent at {parent_time}, block at {time}, period {period}s")]
    BlockTooEarly {
        parent_time: Timestamp,
        time: Timestamp,
        period: u64,
    },

    #[error("Not enough candidates: need {needed}, have {available}")]
    InsufficientCandidates { needed: usize, available: usize },

    #[error("Difficulty mismatch: expected {expected}, got {got}")]
    DifficultyMismatch { expected: u64, got: u64 },

    #[error("Proof of work does not meet the difficulty target")]
    InvalidProof,

    #[error("Insufficient stake: staked {staked}, requested {requested}")]
    InsufficientStake { staked: u128, requested: u128 },

    #[error("Account error: {0}")]
    Account(AccountError),

    #[error("{0} is not an authorized signer")]
    NotSigner(Address),

    #[error("{0} already voted in this block")]
    AlreadyVoted(Address),

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    #[error("Empty producer set")]
    NoProducers,

    #[error("Payload {0:?} not supported by this engine")]
    UnsupportedPayload(PayloadCode),

    #[error("Consensus state belongs to another engine")]
    StateKindMismatch,

    #[error("No consensus state recorded for {0}")]
    StateNotFound(Hash),

    #[error("Trie error: {0}")]
    Trie(#[from] TrieError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Encoding error: {0}")]
    Codec(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Chain error: {0}")]
    Chain(String),
}

impl From<AccountError> for ConsensusError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::InsufficientStake { staked, requested } => {
                ConsensusError::InsufficientStake { staked, requested }
            }
            other => ConsensusError::Account(other),
        }
    }
}
