// Network - Message transport between nodes
// Principle: the node only sees broadcast / send_to / send_to_random

pub mod local;
pub mod protocol;

pub use local::{Inbox, LocalHub, LocalNetwork};
pub use protocol::{NetworkMessage, ProtocolError, MAX_NETWORK_MESSAGE_SIZE};

pub type PeerId = String;

/// Outbound side of a transport
///
/// Sends are fire-and-forget; delivery is not confirmed.
pub trait Network: Send + Sync {
    fn local_peer(&self) -> &PeerId;

    /// Connected peers, excluding ourselves
    fn peers(&self) -> Vec<PeerId>;

    fn broadcast(&self, message: &NetworkMessage) -> Result<(), NetworkError>;

    fn send_to(&self, peer: &PeerId, message: &NetworkMessage) -> Result<(), NetworkError>;

    /// Sends to one peer picked at random, returns who got it
    fn send_to_random(&self, message: &NetworkMessage) -> Result<PeerId, NetworkError>;
}

/// A decoded message and its sender
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: PeerId,
    pub message: NetworkMessage,
}

/// Network errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("No connected peers")]
    NoPeers,

    #[error("Peer {0} disconnected")]
    Disconnected(PeerId),

    #[error("Peer id {0} already taken")]
    DuplicatePeer(PeerId),

    #[error("Peer table lock poisoned")]
    LockPoisoned,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
