// Test harness - Multi-producer devnets driven by explicit timestamps
use crate::consensus::{build_engine, Miner};
use crate::genesis::{dev_address, dev_key, ChainConfig, ConsensusConfig, GENESIS_TIMESTAMP};
use crate::consensus::PowConfig;
use crate::node::{BlockChain, ChainError};
use crate::storage::{MemoryStorage, SharedStorage};
use crate::types::{Address, Balance, Block, Nonce, Payload, PayloadCode, Timestamp, Transaction};
use crate::wallet::KeyStore;
use std::sync::Arc;

pub const T0: Timestamp = GENESIS_TIMESTAMP;

pub fn miner(index: u32) -> Miner {
    let wallet = KeyStore::new();
    let address = wallet.insert(dev_key(index)).unwrap();
    Miner::new(address, Arc::new(wallet))
}

/// Chain for producer `index` on fresh in-memory storage
pub fn chain_for(config: &ChainConfig, index: u32) -> BlockChain {
    chain_on(config, index, MemoryStorage::shared())
}

pub fn chain_on(config: &ChainConfig, index: u32, storage: SharedStorage) -> BlockChain {
    let engine = build_engine(&config.consensus, storage.clone(), Some(miner(index)));
    BlockChain::open(config.clone(), storage, engine).unwrap()
}

/// PoW preset whose proofs are found on the first nonce
pub fn easy_pow() -> ChainConfig {
    let mut config = ChainConfig::devnet_pow();
    config.consensus = ConsensusConfig::Pow(PowConfig {
        genesis_difficulty: 1,
        minimum_difficulty: 1,
    });
    config
}

/// Asks the engine for a block at `now`; seals and inserts it locally
pub fn produce(chain: &mut BlockChain, now: Timestamp) -> Option<Block> {
    let engine = chain.consensus();
    let block = engine.make_block(chain, now).unwrap()?;
    let block = engine.seal_block(block, &chain.tip_height())?;
    let wire = block.detached();
    chain.put_block_by_coinbase(block).unwrap();
    Some(wire)
}

pub fn signed_transfer(from: u32, to: Address, amount: Balance, nonce: Nonce) -> Transaction {
    let mut tx = Transaction::transfer(dev_address(from), to, amount, nonce);
    tx.sign(&dev_key(from)).unwrap();
    tx
}

pub fn signed_payload(from: u32, to: Address, amount: Balance, nonce: Nonce, code: PayloadCode) -> Transaction {
    let mut tx = Transaction::new(dev_address(from), to, amount, nonce, Payload::new(code));
    tx.sign(&dev_key(from)).unwrap();
    tx
}

/// Producers `0..n`, each with its own chain and storage
pub struct Devnet {
    pub config: ChainConfig,
    pub chains: Vec<BlockChain>,
}

impl Devnet {
    pub fn new(config: ChainConfig, producers: u32) -> Self {
        let chains = (0..producers).map(|i| chain_for(&config, i)).collect();
        Self { config, chains }
    }

    /// First producer entitled at `now` builds a block; nothing is gossiped
    pub fn produce_at(&mut self, now: Timestamp) -> Option<(usize, Block)> {
        self.chains
            .iter_mut()
            .enumerate()
            .find_map(|(i, chain)| produce(chain, now).map(|block| (i, block)))
    }

    pub fn deliver(&mut self, to: usize, block: &Block) -> Result<(), ChainError> {
        self.chains[to].put_block_if_parent_exists(block.clone())
    }

    /// Delivers to every chain but the producer
    pub fn gossip(&mut self, from: usize, block: &Block) {
        for to in 0..self.chains.len() {
            if to != from {
                self.deliver(to, block).unwrap();
            }
        }
    }

    /// Produce at `now` and gossip; panics if nobody is entitled
    pub fn step(&mut self, now: Timestamp) -> (usize, Block) {
        let (producer, block) = self
            .produce_at(now)
            .unwrap_or_else(|| panic!("no producer at {}", now));
        self.gossip(producer, &block);
        (producer, block)
    }

    pub fn submit_everywhere(&mut self, tx: &Transaction) {
        for chain in &mut self.chains {
            chain.submit_transaction(tx.clone()).unwrap();
        }
    }
}
