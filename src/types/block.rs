// Block - Linked, hash-committed, signed records
use super::account::Address;
use super::primitives::{BlockNumber, Hash, Timestamp};
use super::signature::{domain_separate, Signature64, DOMAIN_BLOCK_HEADER};
use super::transaction::Transaction;
use crate::storage::state::BlockStates;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: Hash,

    pub height: BlockNumber,

    pub time: Timestamp,

    /// Producer, credited with the block reward
    pub coinbase: Address,

    /// Root of the account state after execution
    pub account_hash: Hash,

    /// Root of the transaction state after execution
    pub transaction_hash: Hash,

    /// Commitment over the engine-specific state
    pub consensus_hash: Hash,

    /// PoW only (zero otherwise)
    pub difficulty: u64,

    /// PoW only, bound by the proof rather than by `hash`
    pub nonce: u64,

    pub hash: Hash,

    /// Coinbase signature over `hash`
    pub signature: Signature64,
}

impl Header {
    /// Content hash; excludes `nonce`, `hash` and `signature`
    pub fn calc_hash(&self) -> Hash {
        Hash::hash_parts(&[
            self.parent_hash.as_bytes(),
            &self.height.to_le_bytes(),
            &self.time.to_le_bytes(),
            &self.coinbase.to_bytes(),
            self.account_hash.as_bytes(),
            self.transaction_hash.as_bytes(),
            self.consensus_hash.as_bytes(),
            &self.difficulty.to_le_bytes(),
        ])
    }

    /// Digest the coinbase signs (domain-separated hash)
    pub fn signing_hash(&self) -> Hash {
        Hash::hash(&domain_separate(DOMAIN_BLOCK_HEADER, self.hash.as_bytes()))
    }

    pub fn sign(&mut self, key: &SigningKey) {
        let signature = key.sign(self.signing_hash().as_bytes());
        self.signature = Signature64::from(signature.to_bytes());
    }

    /// Checks the coinbase signature over the stored hash
    pub fn verify_signature(&self) -> bool {
        self.coinbase
            .verify(self.signing_hash().as_bytes(), self.signature.as_bytes())
    }
}

/// Full block
///
/// `states` holds the account, transaction and consensus views rooted at this
/// block. They never travel on the wire; a received block gets them by
/// replaying its transactions on top of its parent's states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,

    pub transactions: Vec<Transaction>,

    #[serde(skip)]
    states: Option<BlockStates>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            states: None,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn height(&self) -> BlockNumber {
        self.header.height
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn coinbase(&self) -> Address {
        self.header.coinbase
    }

    pub fn states(&self) -> Option<&BlockStates> {
        self.states.as_ref()
    }

    pub fn states_mut(&mut self) -> Option<&mut BlockStates> {
        self.states.as_mut()
    }

    pub fn set_states(&mut self, states: BlockStates) {
        self.states = Some(states);
    }

    pub fn has_states(&self) -> bool {
        self.states.is_some()
    }

    /// Drops the state handles (released history keeps header and body only)
    pub fn clear_states(&mut self) {
        self.states = None;
    }

    /// Header-and-body copy without state handles, for the wire
    pub fn detached(&self) -> Block {
        Block::new(self.header.clone(), self.transactions.clone())
    }

    /// Writes the three state roots into the header, then the header hash
    ///
    /// Roots must be final before the hash is taken; nothing may touch the
    /// states after sealing.
    pub fn seal(&mut self) {
        if let Some(states) = &self.states {
            self.header.account_hash = states.account_state.root_hash();
            self.header.transaction_hash = states.transaction_state.root_hash();
            self.header.consensus_hash = states.consensus_state.root_hash();
        }
        self.header.hash = self.header.calc_hash();
    }

    /// Recomputed roots match what the header commits to
    pub fn roots_match(&self) -> bool {
        match &self.states {
            Some(states) => {
                states.account_state.root_hash() == self.header.account_hash
                    && states.transaction_state.root_hash() == self.header.transaction_hash
                    && states.consensus_state.root_hash() == self.header.consensus_hash
            }
            None => false,
        }
    }
}
