// Local transport - In-process hub connecting nodes over tokio channels
//
// Every message is bincode-encoded on send and decoded on receive, so the
// hub exercises the same codec a socket transport would.
use super::{InboundMessage, Network, NetworkError, NetworkMessage, PeerId};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Frame = (PeerId, Vec<u8>);
type PeerTable = HashMap<PeerId, mpsc::UnboundedSender<Frame>>;

/// Shared switchboard; cheap to clone
#[derive(Clone, Default)]
pub struct LocalHub {
    peers: Arc<RwLock<PeerTable>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer and returns its outbound handle and inbox
    pub fn join(&self, id: impl Into<PeerId>) -> Result<(LocalNetwork, Inbox), NetworkError> {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut peers = self.peers.write().map_err(|_| NetworkError::LockPoisoned)?;
        if peers.contains_key(&id) {
            return Err(NetworkError::DuplicatePeer(id));
        }
        peers.insert(id.clone(), tx);
        debug!("🔗 Peer {} joined local hub ({} peers)", id, peers.len());

        let network = LocalNetwork {
            id,
            hub: self.clone(),
        };
        Ok((network, Inbox { rx }))
    }

    /// Drops a peer; its inbox ends once drained
    pub fn leave(&self, id: &PeerId) -> Result<(), NetworkError> {
        let mut peers = self.peers.write().map_err(|_| NetworkError::LockPoisoned)?;
        peers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| NetworkError::UnknownPeer(id.clone()))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, bytes: Vec<u8>) -> Result<(), NetworkError> {
        let peers = self.peers.read().map_err(|_| NetworkError::LockPoisoned)?;
        let sender = peers
            .get(to)
            .ok_or_else(|| NetworkError::UnknownPeer(to.clone()))?;
        sender
            .send((from.clone(), bytes))
            .map_err(|_| NetworkError::Disconnected(to.clone()))
    }
}

/// One peer's view of the hub
#[derive(Clone)]
pub struct LocalNetwork {
    id: PeerId,
    hub: LocalHub,
}

impl Network for LocalNetwork {
    fn local_peer(&self) -> &PeerId {
        &self.id
    }

    fn peers(&self) -> Vec<PeerId> {
        self.hub
            .peers
            .read()
            .map(|peers| peers.keys().filter(|p| **p != self.id).cloned().collect())
            .unwrap_or_default()
    }

    fn broadcast(&self, message: &NetworkMessage) -> Result<(), NetworkError> {
        let bytes = message.encode()?;
        for peer in self.peers() {
            // A dropped inbox must not stop the rest of the fan-out
            if let Err(e) = self.hub.deliver(&self.id, &peer, bytes.clone()) {
                debug!("Broadcast {} to {} failed: {}", message.kind(), peer, e);
            }
        }
        Ok(())
    }

    fn send_to(&self, peer: &PeerId, message: &NetworkMessage) -> Result<(), NetworkError> {
        let bytes = message.encode()?;
        self.hub.deliver(&self.id, peer, bytes)
    }

    fn send_to_random(&self, message: &NetworkMessage) -> Result<PeerId, NetworkError> {
        let peers = self.peers();
        let peer = peers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(NetworkError::NoPeers)?;
        self.send_to(&peer, message)?;
        Ok(peer)
    }
}

/// Inbound side of a local peer
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Inbox {
    /// Next decodable message; undecodable frames are logged and skipped
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        loop {
            let (from, bytes) = self.rx.recv().await?;
            match NetworkMessage::decode(&bytes) {
                Ok(message) => return Some(InboundMessage { from, message }),
                Err(e) => warn!("Dropping frame from {}: {}", from, e),
            }
        }
    }

    /// Non-blocking variant for tests and drain loops
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        while let Ok((from, bytes)) = self.rx.try_recv() {
            match NetworkMessage::decode(&bytes) {
                Ok(message) => return Some(InboundMessage { from, message }),
                Err(e) => warn!("Dropping frame from {}: {}", from, e),
            }
        }
        None
    }
}
