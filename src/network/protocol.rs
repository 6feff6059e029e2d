// Protocol - Wire messages between nodes
use crate::types::{Block, BlockNumber, Transaction};
use serde::{Deserialize, Serialize};

/// Upper bound accepted by `decode`
pub const MAX_NETWORK_MESSAGE_SIZE: usize = 2 * 1024 * 1024; // 2 MB

/// Error type for protocol operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

/// Network messages
///
/// Blocks travel detached; receivers rebuild states by execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// Freshly produced or relayed block
    NewBlock(Block),

    /// Ask a peer for its canonical block at a height
    MissingBlockRequest(BlockNumber),

    /// Answer to `MissingBlockRequest`
    MissingBlockResponse(Block),

    /// Transaction gossip
    NewTransaction(Transaction),
}

impl NetworkMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode_with_limit(bytes, MAX_NETWORK_MESSAGE_SIZE)
    }

    /// Decode with a caller-chosen size limit
    pub fn decode_with_limit(bytes: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_size {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: max_size,
            });
        }

        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::NewBlock(_) => "new_block",
            NetworkMessage::MissingBlockRequest(_) => "missing_block_request",
            NetworkMessage::MissingBlockResponse(_) => "missing_block_response",
            NetworkMessage::NewTransaction(_) => "new_transaction",
        }
    }
}
