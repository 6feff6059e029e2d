// BlockChain - Block index, canonical tail, LIB and transaction execution
// Principle: height picks the tail, the engine's finality rule bounds how far it can move

use crate::consensus::{Consensus, ConsensusError};
use crate::genesis::ChainConfig;
use crate::node::mempool::{MempoolConfig, PoolError, TransactionPool};
use crate::storage::{
    AccountState, BlockStates, ChainStore, ChainStoreError, SharedStorage, StorageError,
    TransactionState, TrieError,
};
use crate::types::{
    now_secs, AccountError, Address, Block, BlockNumber, Hash, Header, Nonce, PayloadCode,
    Signature64, Transaction, TransactionError,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Published tail height, readable without the chain lock
pub type TipHeight = Arc<AtomicU64>;

pub struct BlockChain {
    config: ChainConfig,
    store: ChainStore,
    consensus: Arc<dyn Consensus>,

    // genesis, lib and tail are never pruned
    genesis: Hash,
    lib: Hash,
    tail: Hash,

    /// Every tracked block
    blocks: HashMap<Hash, Block>,

    /// All tracked blocks per height, forks included
    by_height: BTreeMap<BlockNumber, BTreeSet<Hash>>,

    /// Canonical height index (path from genesis to tail)
    canonical: BTreeMap<BlockNumber, Hash>,

    tx_pool: TransactionPool,
    tip_height: TipHeight,

    /// Tail height seen by the previous missing-block check
    last_checked_height: Option<BlockNumber>,

    /// Blocks below this height hold no in-memory states
    released_below: BlockNumber,
}

impl BlockChain {
    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// Fresh chain: genesis becomes tail and LIB
    pub fn setup(
        config: ChainConfig,
        storage: SharedStorage,
        consensus: Arc<dyn Consensus>,
    ) -> Result<Self, ChainError> {
        let store = ChainStore::new(storage.clone());
        let genesis = build_genesis(&config, &storage, consensus.as_ref())?;
        let hash = genesis.hash();

        consensus.save_state(&genesis)?;
        if let Some(states) = genesis.states() {
            states.commit()?;
        }
        store.store_block(&genesis)?;
        store.set_canonical(&[(0, hash)])?;
        store.set_genesis(&hash)?;
        store.set_lib(&hash)?;
        store.set_tail(&hash)?;

        info!("🌟 Genesis {} ({} engine, {} accounts)", hash, consensus.name(), config.accounts.len());

        let mut chain = Self::empty(config, store, consensus, hash);
        chain.track(genesis);
        chain.canonical.insert(0, hash);
        Ok(chain)
    }

    /// Reopens a persisted chain, or sets up a new one on empty storage
    pub fn open(
        config: ChainConfig,
        storage: SharedStorage,
        consensus: Arc<dyn Consensus>,
    ) -> Result<Self, ChainError> {
        let store = ChainStore::new(storage.clone());
        let Some(tail_hash) = store.tail()? else {
            return Self::setup(config, storage, consensus);
        };

        let stored_genesis = store
            .genesis()?
            .ok_or_else(|| ChainError::CorruptedState("genesis pointer missing".to_string()))?;
        let configured = build_genesis(&config, &storage, consensus.as_ref())?.hash();
        if configured != stored_genesis {
            return Err(ChainError::GenesisMismatch {
                stored: stored_genesis,
                configured,
            });
        }
        let lib_hash = store
            .lib()?
            .ok_or_else(|| ChainError::CorruptedState("lib pointer missing".to_string()))?;

        let tail_height = store.load_block(&tail_hash)?.height();
        let lib_height = store.load_block(&lib_hash)?.height();

        let mut chain = Self::empty(config, store, consensus, stored_genesis);
        chain.lib = lib_hash;
        chain.tail = tail_hash;
        let floor = match chain.consensus.state_retention_depth() {
            Some(depth) => lib_height.max(tail_height.saturating_sub(depth)),
            None => lib_height,
        };
        chain.released_below = floor;

        for height in 0..=tail_height {
            let hash = chain.store.canonical_hash(height)?;
            let mut block = chain.store.load_block(&hash)?;
            if height >= floor {
                let states = chain.load_states(&block.header)?;
                block.set_states(states);
            }
            chain.canonical.insert(height, hash);
            chain.track(block);
        }

        chain.tip_height.store(tail_height, Ordering::Release);
        info!(
            "📂 Loaded chain: tail #{} ({}), lib #{}",
            tail_height, tail_hash, lib_height
        );
        Ok(chain)
    }

    /// Replaces the (empty) default pool with a configured one
    pub fn with_mempool(mut self, config: MempoolConfig) -> Self {
        self.tx_pool = TransactionPool::with_config(config);
        self
    }

    fn empty(
        config: ChainConfig,
        store: ChainStore,
        consensus: Arc<dyn Consensus>,
        genesis: Hash,
    ) -> Self {
        Self {
            config,
            store,
            consensus,
            genesis,
            lib: genesis,
            tail: genesis,
            blocks: HashMap::new(),
            by_height: BTreeMap::new(),
            canonical: BTreeMap::new(),
            tx_pool: TransactionPool::default(),
            tip_height: Arc::new(AtomicU64::new(0)),
            last_checked_height: None,
            released_below: 0,
        }
    }

    /// Reopens the three state views a header commits to; any failure is fatal
    fn load_states(&self, header: &Header) -> Result<BlockStates, ChainError> {
        let corrupted = |what: &str, e: String| {
            ChainError::CorruptedState(format!("{} of #{} ({}): {}", what, header.height, header.hash, e))
        };
        let storage = self.store.storage().clone();

        let account_state = AccountState::from_root(storage.clone(), header.account_hash)
            .map_err(|e| corrupted("account state", e.to_string()))?;
        let transaction_state = TransactionState::from_root(storage, header.transaction_hash)
            .map_err(|e| corrupted("transaction state", e.to_string()))?;
        let consensus_state = self
            .consensus
            .load_state(header)
            .map_err(|e| corrupted("consensus state", e.to_string()))?;

        Ok(BlockStates {
            account_state,
            transaction_state,
            consensus_state,
        })
    }

    fn track(&mut self, block: Block) {
        self.by_height
            .entry(block.height())
            .or_default()
            .insert(block.hash());
        self.blocks.insert(block.hash(), block);
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn genesis(&self) -> &Block {
        &self.blocks[&self.genesis]
    }

    pub fn tail(&self) -> &Block {
        &self.blocks[&self.tail]
    }

    pub fn lib(&self) -> &Block {
        &self.blocks[&self.lib]
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn consensus(&self) -> Arc<dyn Consensus> {
        self.consensus.clone()
    }

    pub fn tip_height(&self) -> TipHeight {
        self.tip_height.clone()
    }

    pub fn tx_pool(&self) -> &TransactionPool {
        &self.tx_pool
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    /// Canonical block at `height`
    pub fn get_block_by_height(&self, height: BlockNumber) -> Option<&Block> {
        self.canonical
            .get(&height)
            .and_then(|hash| self.blocks.get(hash))
    }

    /// Tracked blocks at `height`, forks included
    pub fn blocks_at_height(&self, height: BlockNumber) -> Vec<&Block> {
        self.by_height
            .get(&height)
            .map(|hashes| hashes.iter().filter_map(|h| self.blocks.get(h)).collect())
            .unwrap_or_default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn has_parent_in_block_chain(&self, block: &Block) -> bool {
        self.blocks.contains_key(&block.parent_hash())
    }

    /// `from` and its ancestors, newest first
    pub fn ancestors(&self, from: Hash) -> Ancestors<'_> {
        Ancestors {
            chain: self,
            next: Some(from),
        }
    }

    /// Balance/nonce view at the tail
    pub fn account_at_tail(&self, address: &Address) -> Option<crate::types::Account> {
        self.tail()
            .states()
            .and_then(|s| s.account_state.get_account(address).ok())
    }

    /// Whether the canonical branch already executed `hash`
    pub fn is_included(&self, hash: &Hash) -> Result<bool, ChainError> {
        let tail = self.tail();
        let states = tail.states().ok_or(ChainError::StatesMissing(tail.hash()))?;
        Ok(states.transaction_state.contains(hash)?)
    }

    fn descends_from_lib(&self, hash: Hash) -> bool {
        let lib_height = self.lib().height();
        self.ancestors(hash)
            .find(|block| block.height() <= lib_height)
            .map(|block| block.hash() == self.lib)
            .unwrap_or(false)
    }

    // =========================================================================
    // TRANSACTIONS
    // =========================================================================

    /// Queues a transaction that is not yet on the canonical branch
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Hash, ChainError> {
        let hash = tx.hash();
        if self.is_included(&hash)? {
            return Err(ChainError::TransactionIncluded(hash));
        }
        self.tx_pool.push(tx)?;
        Ok(hash)
    }

    /// Puts transactions of an abandoned block back into the pool
    pub fn return_transactions(&mut self, txs: Vec<Transaction>) {
        for mut tx in txs {
            match self.is_included(&tx.hash()) {
                Ok(false) if !self.tx_pool.contains(&tx.hash()) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!("Could not check inclusion of {}: {}", tx.hash(), e);
                    continue;
                }
            }
            tx.height = 0;
            if let Err(e) = self.tx_pool.push(tx) {
                warn!("Could not return transaction to pool: {}", e);
            }
        }
    }

    // =========================================================================
    // BLOCK ASSEMBLY
    // =========================================================================

    /// Child of the tail carrying a copy of the tail's states
    pub fn new_block_from_tail(&self) -> Result<Block, ChainError> {
        let tail = self
            .blocks
            .get(&self.tail)
            .ok_or(ChainError::TailNotSet)?;
        let states = tail
            .states()
            .cloned()
            .ok_or(ChainError::StatesMissing(tail.hash()))?;

        let header = Header {
            parent_hash: tail.hash(),
            height: tail.height() + 1,
            time: tail.header.time,
            coinbase: tail.coinbase(),
            account_hash: Hash::ZERO,
            transaction_hash: Hash::ZERO,
            consensus_hash: Hash::ZERO,
            difficulty: 0,
            nonce: 0,
            hash: Hash::ZERO,
            signature: Signature64::zero(),
        };
        let mut block = Block::new(header, Vec::new());
        block.set_states(states);
        Ok(block)
    }

    /// Credits the block reward to the coinbase
    pub fn reward_for_coinbase(&self, block: &mut Block) -> Result<(), ChainError> {
        let coinbase = block.coinbase();
        let hash = block.hash();
        let states = block.states_mut().ok_or(ChainError::StatesMissing(hash))?;

        let mut account = states.account_state.get_or_create(&coinbase)?;
        account.credit(self.config.block_reward);
        states.account_state.put_account(&account)?;
        Ok(())
    }

    /// Rewards the coinbase, then drains the pool into the block
    ///
    /// A transaction whose nonce is exactly next for its sender runs at once
    /// and unlocks any deferred successors; higher nonces wait in a per-sender
    /// queue; stale nonces and unknown senders are dropped. Deferred
    /// transactions still blocked by a gap go back to the pool.
    pub fn fill_block(&mut self, block: &mut Block) -> Result<(), ChainError> {
        self.fill_block_with(block, |_| true)
    }

    /// `fill_block` over the pool transactions `admit` accepts; the rest
    /// stay queued
    pub fn fill_block_with(
        &mut self,
        block: &mut Block,
        admit: impl Fn(&Transaction) -> bool,
    ) -> Result<(), ChainError> {
        self.reward_for_coinbase(block)?;

        let height = block.height();
        let hash = block.hash();
        let states = block.states_mut().ok_or(ChainError::StatesMissing(hash))?;

        let mut included: Vec<Transaction> = Vec::new();
        let mut deferred: BTreeMap<Address, BTreeMap<Nonce, Transaction>> = BTreeMap::new();
        let mut requeue: Vec<Transaction> = Vec::new();

        let pending = self.tx_pool.len();
        for _ in 0..pending {
            let Some(tx) = self.tx_pool.pop() else {
                break;
            };
            if !admit(&tx) {
                requeue.push(tx);
                continue;
            }

            let expected = match states.account_state.get_account(&tx.from) {
                Ok(account) => account.nonce + 1,
                Err(TrieError::NotFound) => {
                    warn!("Dropping {}: unknown sender {}", tx.hash(), tx.from);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if tx.nonce < expected {
                warn!("Dropping {}: stale nonce {} (expected {})", tx.hash(), tx.nonce, expected);
                continue;
            }
            if tx.nonce > expected {
                let queue = deferred.entry(tx.from).or_default();
                if let Some(displaced) = queue.insert(tx.nonce, tx) {
                    requeue.push(displaced);
                }
                continue;
            }

            let sender = tx.from;
            match apply_transaction(states, &tx, height, included.len() as u32) {
                Ok(()) => included.push(stamped(tx, height)),
                Err(e) => {
                    warn!("Dropping {}: {}", tx.hash(), e);
                    continue;
                }
            }

            // Replay successors that were waiting on this nonce
            while let Some(queue) = deferred.get_mut(&sender) {
                let next = match states.account_state.get_account(&sender) {
                    Ok(account) => account.nonce + 1,
                    Err(_) => break,
                };
                let Some(tx) = queue.remove(&next) else {
                    break;
                };
                match apply_transaction(states, &tx, height, included.len() as u32) {
                    Ok(()) => included.push(stamped(tx, height)),
                    Err(e) => {
                        warn!("Dropping {}: {}", tx.hash(), e);
                        break;
                    }
                }
            }
        }

        requeue.extend(deferred.into_values().flat_map(|queue| queue.into_values()));
        for tx in requeue {
            if let Err(e) = self.tx_pool.push(tx) {
                debug!("Deferred transaction not re-queued: {}", e);
            }
        }

        block.transactions = included;
        Ok(())
    }

    /// Replays a block's listed transactions in order on its states
    ///
    /// A transaction that fails is dropped from the block; the roots check
    /// that follows then rejects the block.
    pub fn execute_transaction(&self, block: &mut Block) -> Result<(), ChainError> {
        let height = block.height();
        let hash = block.hash();
        let listed = std::mem::take(&mut block.transactions);
        let states = block.states_mut().ok_or(ChainError::StatesMissing(hash))?;

        let mut kept = Vec::with_capacity(listed.len());
        for tx in listed {
            match apply_transaction(states, &tx, height, kept.len() as u32) {
                Ok(()) => kept.push(stamped(tx, height)),
                Err(e) => warn!("Block #{} ({}): dropping {}: {}", height, hash, tx.hash(), e),
            }
        }

        block.transactions = kept;
        Ok(())
    }

    // =========================================================================
    // BLOCK INSERTION
    // =========================================================================

    /// Inserts a block this node assembled (states already built)
    pub fn put_block_by_coinbase(&mut self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Err(ChainError::AlreadyExists(hash));
        }
        if !self.blocks.contains_key(&block.parent_hash()) {
            return Err(ChainError::ParentNotFound {
                parent: block.parent_hash(),
                height: block.height(),
            });
        }
        let lib_height = self.lib().height();
        if block.height() <= lib_height || !self.descends_from_lib(block.parent_hash()) {
            return Err(ChainError::BelowLib {
                height: block.height(),
                lib_height,
            });
        }
        if !block.roots_match() {
            return Err(ChainError::StateRootMismatch(hash));
        }

        self.persist_states(&block)?;
        self.insert_block(block)
    }

    /// Validates, executes and inserts a block received from the network
    pub fn put_block_if_parent_exists(&mut self, mut block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        if block.header.calc_hash() != hash {
            return Err(ChainError::InvalidHash(hash));
        }
        if self.blocks.contains_key(&hash) {
            return Err(ChainError::AlreadyExists(hash));
        }

        let parent = self
            .blocks
            .get(&block.parent_hash())
            .ok_or(ChainError::ParentNotFound {
                parent: block.parent_hash(),
                height: block.height(),
            })?;

        if block.height() != parent.height() + 1 {
            return Err(ChainError::InvalidHeight {
                expected: parent.height() + 1,
                got: block.height(),
            });
        }
        let lib_height = self.lib().height();
        if block.height() <= lib_height || !self.descends_from_lib(parent.hash()) {
            return Err(ChainError::BelowLib {
                height: block.height(),
                lib_height,
            });
        }
        if block.header.time <= parent.header.time {
            return Err(ChainError::InvalidTimestamp {
                parent: parent.header.time,
                got: block.header.time,
            });
        }
        let now = now_secs();
        if block.header.time > now.saturating_add(self.config.max_future_drift) {
            return Err(ChainError::FutureBlock {
                time: block.header.time,
                now,
            });
        }
        if !block.header.verify_signature() {
            return Err(ChainError::InvalidSignature(hash));
        }

        let parent_header = parent.header.clone();
        let mut states = match parent.states() {
            Some(states) => states.clone(),
            None => self.load_states(&parent_header)?,
        };

        self.consensus
            .prepare_state(&mut states.consensus_state, &parent_header, block.header.time)?;
        block.set_states(states);
        self.reward_for_coinbase(&mut block)?;
        self.execute_transaction(&mut block)?;

        if !block.roots_match() {
            return Err(ChainError::StateRootMismatch(hash));
        }
        self.consensus.verify(self, &block)?;

        self.persist_states(&block)?;
        self.insert_block(block)
    }

    fn persist_states(&self, block: &Block) -> Result<(), ChainError> {
        self.consensus.save_state(block)?;
        if let Some(states) = block.states() {
            states.commit()?;
        }
        Ok(())
    }

    /// Index update, tail move, LIB update and pruning for an accepted block
    fn insert_block(&mut self, block: Block) -> Result<(), ChainError> {
        self.store.store_block(&block)?;

        let hash = block.hash();
        let height = block.height();
        let tx_count = block.transactions.len();
        self.tx_pool.remove_included(&block.transactions);
        self.track(block);

        // Ties keep the existing tail (first seen wins)
        if height > self.tail().height() {
            self.tail = hash;
            self.store.set_tail(&hash)?;
            self.rebuild_block_height(hash)?;
            self.tip_height.store(height, Ordering::Release);
            info!("📥 Imported block #{} ({}) [{} txs]", height, hash, tx_count);
        } else {
            debug!(
                "🍴 Side block #{} ({}) tracked, tail stays at #{}",
                height,
                hash,
                self.tail().height()
            );
        }

        if let Some(new_lib) = self.consensus.update_lib(self) {
            self.set_lib(new_lib)?;
            self.remove_orphan_block()?;
        }

        if height < self.released_below {
            if let Some(block) = self.blocks.get_mut(&hash) {
                block.clear_states();
            }
        }
        self.release_states_below(self.retention_floor());
        Ok(())
    }

    fn set_lib(&mut self, hash: Hash) -> Result<(), ChainError> {
        let Some(block) = self.blocks.get(&hash) else {
            return Ok(());
        };
        let height = block.height();
        if height <= self.lib().height() {
            return Ok(());
        }

        self.lib = hash;
        self.store.set_lib(&hash)?;
        info!("🔒 LIB advanced to #{} ({})", height, hash);
        Ok(())
    }

    /// Rewrites the canonical index from `new_tail` back to the first
    /// height that already agrees
    pub fn rebuild_block_height(&mut self, new_tail: Hash) -> Result<(), ChainError> {
        let mut changed: Vec<(BlockNumber, Hash)> = Vec::new();
        let mut cursor = Some(new_tail);

        while let Some(hash) = cursor {
            let Some(block) = self.blocks.get(&hash) else {
                break;
            };
            let height = block.height();
            if self.canonical.get(&height) == Some(&hash) {
                break;
            }
            changed.push((height, hash));
            cursor = (height > 0).then(|| block.parent_hash());
        }

        let tail_height = self.blocks.get(&new_tail).map(|b| b.height()).unwrap_or(0);
        let stale: Vec<BlockNumber> = self
            .canonical
            .range(tail_height + 1..)
            .map(|(h, _)| *h)
            .collect();
        for height in stale {
            self.canonical.remove(&height);
        }

        for (height, hash) in &changed {
            self.canonical.insert(*height, *hash);
        }
        self.store.set_canonical(&changed)?;

        if changed.len() > 1 {
            info!("🔀 Reorg: {} heights rewritten, tail #{} ({})", changed.len(), tail_height, new_tail);
        }
        Ok(())
    }

    /// Drops every block whose ancestry does not pass through the LIB
    ///
    /// Transactions of dropped blocks that the canonical branch does not
    /// contain go back to the pool, each at most once. Canonical blocks
    /// below the LIB keep header and body.
    pub fn remove_orphan_block(&mut self) -> Result<usize, ChainError> {
        let lib_height = self.lib().height();

        let mut keep: HashSet<Hash> = self
            .canonical
            .range(..=lib_height)
            .map(|(_, hash)| *hash)
            .collect();
        for hashes in self.by_height.range(lib_height + 1..).map(|(_, h)| h) {
            for hash in hashes {
                let descends = self
                    .blocks
                    .get(hash)
                    .map(|b| keep.contains(&b.parent_hash()))
                    .unwrap_or(false);
                if descends {
                    keep.insert(*hash);
                }
            }
        }

        let orphans: Vec<(BlockNumber, Hash)> = self
            .by_height
            .iter()
            .flat_map(|(height, hashes)| hashes.iter().map(move |h| (*height, *h)))
            .filter(|(_, hash)| !keep.contains(hash))
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }

        let mut removed: Vec<Block> = Vec::with_capacity(orphans.len());
        for (height, hash) in &orphans {
            if let Some(hashes) = self.by_height.get_mut(height) {
                hashes.remove(hash);
                if hashes.is_empty() {
                    self.by_height.remove(height);
                }
            }
            if let Some(block) = self.blocks.remove(hash) {
                removed.push(block);
            }
        }

        let mut seen: HashSet<Hash> = HashSet::new();
        let mut to_return: Vec<Transaction> = Vec::new();
        for tx in removed.iter().flat_map(|b| b.transactions.iter()) {
            let hash = tx.hash();
            let on_chain = self.is_included(&hash)?;
            if !on_chain && !self.tx_pool.contains(&hash) && seen.insert(hash) {
                to_return.push(tx.clone());
            }
        }

        let returned = to_return.len();
        for mut tx in to_return {
            tx.height = 0;
            if let Err(e) = self.tx_pool.push(tx) {
                warn!("Could not return orphaned transaction to pool: {}", e);
            }
        }

        info!(
            "🧹 Pruned {} orphan blocks, {} transactions back to pool",
            removed.len(),
            returned
        );
        Ok(removed.len())
    }

    /// Lowest height whose blocks keep their states in memory
    ///
    /// Engines without a retention depth keep everything from the LIB up;
    /// the rest also release states deeper than that depth below the tail.
    fn retention_floor(&self) -> BlockNumber {
        let lib_height = self.lib().height();
        match self.consensus.state_retention_depth() {
            Some(depth) => lib_height.max(self.tail().height().saturating_sub(depth)),
            None => lib_height,
        }
    }

    /// Drops in-memory states of every tracked block below `floor`
    ///
    /// A fork that later builds on one of these blocks reopens its states
    /// from storage.
    fn release_states_below(&mut self, floor: BlockNumber) {
        if floor <= self.released_below {
            return;
        }
        let released: Vec<Hash> = self
            .by_height
            .range(self.released_below..floor)
            .flat_map(|(_, hashes)| hashes.iter().copied())
            .collect();
        for hash in &released {
            if let Some(block) = self.blocks.get_mut(hash) {
                block.clear_states();
            }
        }
        debug!("Released states of {} blocks below #{}", released.len(), floor);
        self.released_below = floor;
    }

    // =========================================================================
    // SYNC
    // =========================================================================

    /// Height to ask peers for when the tail has not moved since last check
    pub fn request_missing_block(&mut self) -> Option<BlockNumber> {
        let height = self.tail().height();
        if self.last_checked_height == Some(height) {
            Some(height + 1)
        } else {
            self.last_checked_height = Some(height);
            None
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Walks parent links from a starting block
pub struct Ancestors<'a> {
    chain: &'a BlockChain,
    next: Option<Hash>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<&'a Block> {
        let hash = self.next?;
        let block = self.chain.blocks.get(&hash)?;
        self.next = (block.height() > 0).then(|| block.parent_hash());
        Some(block)
    }
}

fn build_genesis(
    config: &ChainConfig,
    storage: &SharedStorage,
    consensus: &dyn Consensus,
) -> Result<Block, ChainError> {
    let header = Header {
        parent_hash: Hash::ZERO,
        height: 0,
        time: config.genesis_time,
        coinbase: Address::from_public_key_bytes([0; 32]),
        account_hash: Hash::ZERO,
        transaction_hash: Hash::ZERO,
        consensus_hash: Hash::ZERO,
        difficulty: 0,
        nonce: 0,
        hash: Hash::ZERO,
        signature: Signature64::zero(),
    };

    let mut account_state = AccountState::new(storage.clone());
    for seed in &config.accounts {
        let mut account = account_state.get_or_create(&seed.address)?;
        account.credit(seed.balance);
        account_state.put_account(&account)?;
    }

    let mut block = Block::new(header, Vec::new());
    block.set_states(BlockStates {
        account_state,
        transaction_state: TransactionState::new(storage.clone()),
        consensus_state: consensus.new_state(),
    });
    consensus.make_genesis_block(&mut block, &config.accounts)?;
    block.seal();
    Ok(block)
}

fn stamped(mut tx: Transaction, height: BlockNumber) -> Transaction {
    tx.height = height;
    tx
}

/// Executes one transaction against a block's states
///
/// Every check runs before the first write, so a rejected transaction leaves
/// the states untouched.
fn apply_transaction(
    states: &mut BlockStates,
    tx: &Transaction,
    height: BlockNumber,
    index: u32,
) -> Result<(), ExecutionError> {
    tx.verify()?;
    let hash = tx.hash();
    if states.transaction_state.contains(&hash)? {
        return Err(ExecutionError::Duplicate(hash));
    }

    let mut sender = match states.account_state.get_account(&tx.from) {
        Ok(account) => account,
        Err(TrieError::NotFound) => return Err(ExecutionError::UnknownSender(tx.from)),
        Err(e) => return Err(e.into()),
    };
    let expected = sender.nonce + 1;
    if tx.nonce != expected {
        return Err(ExecutionError::NonceMismatch {
            expected,
            got: tx.nonce,
        });
    }

    match tx.payload.code {
        PayloadCode::Transfer => {
            sender.debit(tx.amount)?;
            sender.nonce = tx.nonce;
            states.account_state.put_account(&sender)?;

            let mut receiver = states.account_state.get_or_create(&tx.to)?;
            receiver.credit(tx.amount);
            states.account_state.put_account(&receiver)?;
        }
        _ => {
            states
                .consensus_state
                .execute_transaction(tx, height, &mut states.account_state)?;
            let mut sender = states.account_state.get_account(&tx.from)?;
            sender.nonce = tx.nonce;
            states.account_state.put_account(&sender)?;
        }
    }

    states
        .transaction_state
        .put_transaction(&stamped(tx.clone(), height), index)?;
    Ok(())
}

// =============================================================================
// ERRORS
// =============================================================================

/// Why a single transaction was not executed
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Invalid(#[from] TransactionError),

    #[error("Transaction {0} already executed on this branch")]
    Duplicate(Hash),

    #[error("Unknown sender {0}")]
    UnknownSender(Address),

    #[error("Nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: Nonce, got: Nonce },

    #[error("{0}")]
    Account(#[from] AccountError),

    #[error("{0}")]
    Consensus(#[from] ConsensusError),

    #[error("{0}")]
    Trie(#[from] TrieError),
}

/// Chain errors
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Parent {parent} of block #{height} not found")]
    ParentNotFound { parent: Hash, height: BlockNumber },

    #[error("Block {0} already known")]
    AlreadyExists(Hash),

    #[error("Block #{height} does not extend the irreversible block at #{lib_height}")]
    BelowLib {
        height: BlockNumber,
        lib_height: BlockNumber,
    },

    #[error("Block hash {0} does not match its header")]
    InvalidHash(Hash),

    #[error("Invalid height: expected {expected}, got {got}")]
    InvalidHeight {
        expected: BlockNumber,
        got: BlockNumber,
    },

    #[error("Timestamp not after parent: parent={parent}, block={got}")]
    InvalidTimestamp { parent: u64, got: u64 },

    #[error("Block time {time} too far ahead of local clock {now}")]
    FutureBlock { time: u64, now: u64 },

    #[error("Invalid coinbase signature on block {0}")]
    InvalidSignature(Hash),

    #[error("State roots of block {0} do not match its header")]
    StateRootMismatch(Hash),

    #[error("Block {0} has no states attached")]
    StatesMissing(Hash),

    #[error("Tail not set")]
    TailNotSet,

    #[error("Corrupted state: {0}")]
    CorruptedState(String),

    #[error("Stored genesis {stored} differs from configured genesis {configured}")]
    GenesisMismatch { stored: Hash, configured: Hash },

    #[error("Transaction {0} already included")]
    TransactionIncluded(Hash),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Trie error: {0}")]
    Trie(#[from] TrieError),

    #[error("Chain store error: {0}")]
    Store(#[from] ChainStoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}
