// Service - Node event loop: block import, relay, mining and catch-up
use crate::consensus::{Consensus, ConsensusError};
use crate::network::{Inbox, InboundMessage, Network, NetworkError, NetworkMessage, PeerId};
use crate::node::blockchain::{BlockChain, ChainError, TipHeight};
use crate::types::{now_secs, Block, BlockNumber, Hash, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Blocks waiting for a parent, across all parents
pub const MAX_PENDING_BLOCKS: usize = 256;

/// Loop intervals
#[derive(Debug, Clone)]
pub struct NodeIntervals {
    /// How often the engine is asked for a block
    pub mine: Duration,

    /// How often a stalled tail triggers a missing-block request
    pub sync: Duration,
}

impl Default for NodeIntervals {
    fn default() -> Self {
        Self {
            mine: Duration::from_secs(1),
            sync: Duration::from_secs(5),
        }
    }
}

/// Result of feeding one block to the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Accepted; includes any buffered descendants it unlocked
    Imported { connected: usize },

    /// Parent unknown; buffered and parent requested
    Pending,

    /// Already known
    Known,
}

pub struct Node {
    chain: Arc<Mutex<BlockChain>>,
    consensus: Arc<dyn Consensus>,
    network: Arc<dyn Network>,
    tip_height: TipHeight,

    /// Blocks keyed by the parent hash they are waiting for
    pending: Mutex<HashMap<Hash, Vec<Block>>>,
}

impl Node {
    pub fn new(chain: BlockChain, network: Arc<dyn Network>) -> Self {
        let consensus = chain.consensus();
        let tip_height = chain.tip_height();
        Self {
            chain: Arc::new(Mutex::new(chain)),
            consensus,
            network,
            tip_height,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> Arc<Mutex<BlockChain>> {
        self.chain.clone()
    }

    pub fn peer_id(&self) -> &PeerId {
        self.network.local_peer()
    }

    pub fn tip_height(&self) -> BlockNumber {
        self.tip_height.load(std::sync::atomic::Ordering::Acquire)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.values().map(Vec::len).sum()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    pub async fn handle_message(&self, inbound: InboundMessage) -> Result<(), NodeError> {
        let InboundMessage { from, message } = inbound;
        debug!("📨 {} from {}", message.kind(), from);

        match message {
            NetworkMessage::NewBlock(block) | NetworkMessage::MissingBlockResponse(block) => {
                self.import_block(block, Some(&from)).await?;
            }
            NetworkMessage::MissingBlockRequest(height) => {
                let block = {
                    let chain = self.chain.lock().await;
                    chain.get_block_by_height(height).map(Block::detached)
                };
                match block {
                    Some(block) => self
                        .network
                        .send_to(&from, &NetworkMessage::MissingBlockResponse(block))?,
                    None => debug!("No canonical block #{} for {}", height, from),
                }
            }
            NetworkMessage::NewTransaction(tx) => {
                self.accept_transaction(tx).await?;
            }
        }
        Ok(())
    }

    /// Executes and inserts a block, relaying it and anything it unlocks
    pub async fn import_block(
        &self,
        block: Block,
        from: Option<&PeerId>,
    ) -> Result<ImportOutcome, NodeError> {
        let mut chain = self.chain.lock().await;
        let hash = block.hash();

        match chain.put_block_if_parent_exists(block.clone()) {
            Ok(()) => {}
            Err(ChainError::AlreadyExists(_)) => return Ok(ImportOutcome::Known),
            Err(ChainError::ParentNotFound { parent, height }) => {
                drop(chain);
                self.buffer_block(parent, block).await;
                self.request_block(height.saturating_sub(1), from)?;
                return Ok(ImportOutcome::Pending);
            }
            Err(e) => return Err(e.into()),
        }
        self.network.broadcast(&NetworkMessage::NewBlock(block))?;

        // Connect buffered descendants
        let mut connected = 0;
        let mut parents = vec![hash];
        let mut pending = self.pending.lock().await;
        while let Some(parent) = parents.pop() {
            let Some(children) = pending.remove(&parent) else {
                continue;
            };
            for child in children {
                let child_hash = child.hash();
                match chain.put_block_if_parent_exists(child.clone()) {
                    Ok(()) => {
                        connected += 1;
                        parents.push(child_hash);
                        self.network.broadcast(&NetworkMessage::NewBlock(child))?;
                    }
                    Err(e) => debug!("Buffered block {} rejected: {}", child_hash, e),
                }
            }
        }

        if connected > 0 {
            info!("🔗 Connected {} buffered blocks after {}", connected, hash);
        }
        Ok(ImportOutcome::Imported { connected })
    }

    async fn buffer_block(&self, parent: Hash, block: Block) {
        let mut pending = self.pending.lock().await;
        let buffered: usize = pending.values().map(Vec::len).sum();
        if buffered >= MAX_PENDING_BLOCKS {
            warn!("Pending block buffer full, dropping {}", block.hash());
            return;
        }
        let waiting = pending.entry(parent).or_default();
        if waiting.iter().all(|b| b.hash() != block.hash()) {
            waiting.push(block);
        }
    }

    fn request_block(&self, height: BlockNumber, from: Option<&PeerId>) -> Result<(), NodeError> {
        let request = NetworkMessage::MissingBlockRequest(height);
        match from {
            Some(peer) => self.network.send_to(peer, &request)?,
            None => match self.network.send_to_random(&request) {
                Ok(_) | Err(NetworkError::NoPeers) => {}
                Err(e) => return Err(e.into()),
            },
        }
        debug!("🔍 Requested block #{}", height);
        Ok(())
    }

    async fn accept_transaction(&self, tx: Transaction) -> Result<(), NodeError> {
        let result = self.chain.lock().await.submit_transaction(tx.clone());
        match result {
            Ok(_) => {
                self.network.broadcast(&NetworkMessage::NewTransaction(tx))?;
                Ok(())
            }
            // Already known: stop the flood here
            Err(ChainError::Pool(_)) | Err(ChainError::TransactionIncluded(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // LOCAL ACTIONS
    // =========================================================================

    /// Queues a locally created transaction and gossips it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash, NodeError> {
        let hash = self.chain.lock().await.submit_transaction(tx.clone())?;
        self.network.broadcast(&NetworkMessage::NewTransaction(tx))?;
        info!("💸 Submitted transaction {}", hash);
        Ok(hash)
    }

    /// One production attempt at `now`
    ///
    /// Sealing runs without the chain lock. If it is abandoned or the block
    /// cannot be inserted, its transactions go back to the pool.
    pub async fn mine_once(&self, now: u64) -> Result<Option<Hash>, NodeError> {
        let block = {
            let mut chain = self.chain.lock().await;
            self.consensus.make_block(&mut *chain, now)?
        };
        let Some(block) = block else {
            return Ok(None);
        };

        let transactions = block.transactions.clone();
        let consensus = self.consensus.clone();
        let tip_height = self.tip_height.clone();
        let sealed = tokio::task::spawn_blocking(move || consensus.seal_block(block, &tip_height))
            .await
            .map_err(|e| NodeError::Task(e.to_string()))?;

        let mut chain = self.chain.lock().await;
        let Some(block) = sealed else {
            chain.return_transactions(transactions);
            return Ok(None);
        };

        let hash = block.hash();
        let wire = block.detached();
        if let Err(e) = chain.put_block_by_coinbase(block) {
            chain.return_transactions(transactions);
            return Err(e.into());
        }
        drop(chain);

        info!("⛏️  Produced block #{} ({})", wire.height(), hash);
        self.network.broadcast(&NetworkMessage::NewBlock(wire))?;
        Ok(Some(hash))
    }

    /// Asks a random peer for the next block when the tail has stalled
    pub async fn check_missing_block(&self) -> Result<Option<BlockNumber>, NodeError> {
        let missing = self.chain.lock().await.request_missing_block();
        let Some(height) = missing else {
            return Ok(None);
        };
        match self
            .network
            .send_to_random(&NetworkMessage::MissingBlockRequest(height))
        {
            Ok(peer) => debug!("🔍 Asked {} for block #{}", peer, height),
            Err(NetworkError::NoPeers) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(height))
    }

    // =========================================================================
    // TASKS
    // =========================================================================

    /// Spawns the inbound, mining and sync loops
    pub fn spawn(self: Arc<Self>, mut inbox: Inbox, intervals: NodeIntervals) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                if let Err(e) = node.handle_message(inbound).await {
                    debug!("Message handling failed: {}", e);
                }
            }
            info!("📴 Inbox closed for {}", node.peer_id());
        }));

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(intervals.mine);
            loop {
                ticker.tick().await;
                match node.mine_once(now_secs()).await {
                    Ok(_) => {}
                    Err(NodeError::Consensus(e)) => warn!("Block production failed: {}", e),
                    Err(e) => error!("Block production failed: {}", e),
                }
            }
        }));

        let node = self;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(intervals.sync);
            loop {
                ticker.tick().await;
                if let Err(e) = node.check_missing_block().await {
                    debug!("Missing block request failed: {}", e);
                }
            }
        }));

        handles
    }
}

/// Node errors
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Task error: {0}")]
    Task(String),
}
