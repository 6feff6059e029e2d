// PoW - Homestead-style difficulty and hash search
use super::{assemble_block, Consensus, ConsensusError, ConsensusState, Miner};
use crate::genesis::GenesisAccount;
use crate::node::blockchain::{BlockChain, TipHeight};
use crate::types::{Block, BlockNumber, Hash, Header, Timestamp};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Blocks per difficulty-bomb period
pub const EXP_DIFF_PERIOD: BlockNumber = 100_000;

/// Parent difficulty is adjusted in steps of `parent / DIFFICULTY_BOUND_DIVISOR`
pub const DIFFICULTY_BOUND_DIVISOR: u64 = 2048;

/// Seconds per adjustment step
pub const DURATION_LIMIT: u64 = 10;

/// Canonical blocks deeper than this below the tail drop their in-memory states
pub const STATE_RETENTION_DEPTH: u64 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowConfig {
    pub genesis_difficulty: u64,
    pub minimum_difficulty: u64,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            genesis_difficulty: 1 << 12,
            minimum_difficulty: 1 << 10,
        }
    }
}

/// Difficulty for a block at `time` on top of `parent`
///
/// `parent + parent/2048 · max(1 - elapsed/10, -99)`, floored at the
/// minimum, plus the exponential bomb once past the second period.
pub fn calc_difficulty(time: Timestamp, parent: &Header, minimum_difficulty: u64) -> u64 {
    let parent_difficulty = parent.difficulty as i128;
    let elapsed = time.saturating_sub(parent.time) as i128;
    let adjustment = (1 - elapsed / DURATION_LIMIT as i128).max(-99);

    let mut difficulty =
        parent_difficulty + (parent_difficulty / DIFFICULTY_BOUND_DIVISOR as i128) * adjustment;
    difficulty = difficulty.max(minimum_difficulty as i128);

    let period_count = (parent.height + 1) / EXP_DIFF_PERIOD;
    if period_count > 1 {
        let exponent = (period_count - 2).min(100) as u32;
        difficulty = difficulty.saturating_add(1i128 << exponent);
    }

    difficulty.clamp(1, u64::MAX as i128) as u64
}

/// `2^256 / difficulty`
pub fn target_for(difficulty: u64) -> BigUint {
    (BigUint::from(1u8) << 256usize) / BigUint::from(difficulty.max(1))
}

fn proof_value(hash: &Hash, nonce: u64) -> BigUint {
    let digest = Hash::hash_parts(&[hash.as_bytes(), &nonce.to_le_bytes()]);
    BigUint::from_bytes_be(digest.as_bytes())
}

/// `blake3(hash ‖ nonce)` read as a big-endian integer is within the target
pub fn check_proof(header: &Header) -> bool {
    if header.difficulty == 0 {
        return false;
    }
    proof_value(&header.hash, header.nonce) <= target_for(header.difficulty)
}

pub struct Pow {
    config: PowConfig,
    miner: Option<Miner>,
}

impl Pow {
    pub fn new(config: PowConfig, miner: Option<Miner>) -> Self {
        Self { config, miner }
    }
}

impl Consensus for Pow {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn new_state(&self) -> ConsensusState {
        ConsensusState::Pow
    }

    fn make_genesis_block(
        &self,
        block: &mut Block,
        _voters: &[GenesisAccount],
    ) -> Result<(), ConsensusError> {
        block.header.difficulty = self.config.genesis_difficulty;
        block.header.consensus_hash = Hash::ZERO;
        if let Some(states) = block.states_mut() {
            states.consensus_state = ConsensusState::Pow;
        }
        Ok(())
    }

    fn prepare_state(
        &self,
        state: &mut ConsensusState,
        _parent: &Header,
        _time: Timestamp,
    ) -> Result<(), ConsensusError> {
        match state {
            ConsensusState::Pow => Ok(()),
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

        let tail = &chain.tail().header;
        if now <= tail.time {
            return Ok(None);
        }
        let difficulty = calc_difficulty(now, tail, self.config.minimum_difficulty);

        assemble_block(chain, self, miner, now, difficulty).map(Some)
    }

    /// Searches nonces from a random start until the proof holds, giving up
    /// as soon as the published chain height reaches the block's height
    fn seal_block(&self, mut block: Block, tip_height: &TipHeight) -> Option<Block> {
        let target = target_for(block.header.difficulty);
        let mut nonce: u64 = rand::random();
        let mut attempts: u64 = 0;

        loop {
            if tip_height.load(Ordering::Acquire) >= block.height() {
                debug!(
                    "⛏️  Abandoned #{} after {} attempts: chain moved on",
                    block.height(),
                    attempts
                );
                return None;
            }

            if proof_value(&block.header.hash, nonce) <= target {
                block.header.nonce = nonce;
                info!(
                    "⛏️  Sealed #{} ({}) after {} attempts",
                    block.height(),
                    block.hash(),
                    attempts + 1
                );
                return Some(block);
            }

            nonce = nonce.wrapping_add(1);
            attempts += 1;
        }
    }

    fn verify(&self, chain: &BlockChain, block: &Block) -> Result<(), ConsensusError> {
        let parent = chain
            .get_block_by_hash(&block.parent_hash())
            .ok_or_else(|| ConsensusError::Chain(format!("parent {} not found", block.parent_hash())))?;

        let expected = calc_difficulty(
            block.header.time,
            &parent.header,
            self.config.minimum_difficulty,
        );
        if block.header.difficulty != expected {
            return Err(ConsensusError::DifficultyMismatch {
                expected,
                got: block.header.difficulty,
            });
        }
        if !check_proof(&block.header) {
            return Err(ConsensusError::InvalidProof);
        }
        Ok(())
    }

    fn save_state(&self, _block: &Block) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn load_state(&self, _header: &Header) -> Result<ConsensusState, ConsensusError> {
        Ok(ConsensusState::Pow)
    }

    fn update_lib(&self, _chain: &BlockChain) -> Option<Hash> {
        None
    }

    fn state_retention_depth(&self) -> Option<u64> {
        Some(STATE_RETENTION_DEPTH)
    }
}
