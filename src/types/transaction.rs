// Transaction - Signed value transfers and consensus payloads
use super::account::Address;
use super::primitives::{Balance, BlockNumber, Hash, Nonce};
use super::signature::{domain_separate, Signature64, DOMAIN_TRANSACTION};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

/// What a transaction asks the ledger to do
///
/// Engine-specific codes use `to` as the candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadCode {
    /// Move `amount` from `from` to `to`
    Transfer,
    /// Lock `amount` as stake for candidate `to` (DPoS)
    VoteStake,
    /// Release `amount` of stake from candidate `to` (DPoS)
    VoteUnstake,
    /// Ballot to admit `to` into the signer set (PoA)
    AddSigner,
    /// Ballot to evict `to` from the signer set (PoA)
    RemoveSigner,
}

impl PayloadCode {
    fn tag(&self) -> u8 {
        match self {
            PayloadCode::Transfer => 0,
            PayloadCode::VoteStake => 1,
            PayloadCode::VoteUnstake => 2,
            PayloadCode::AddSigner => 3,
            PayloadCode::RemoveSigner => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub code: PayloadCode,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(code: PayloadCode) -> Self {
        Self { code, data: Vec::new() }
    }

    pub fn transfer() -> Self {
        Self::new(PayloadCode::Transfer)
    }
}

/// Signed transaction
///
/// `hash` commits to every field except `height` and `signature`. It is
/// computed once at construction; `height` is stamped at inclusion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    hash: Hash,
    pub from: Address,
    pub to: Address,
    pub amount: Balance,
    pub nonce: Nonce,
    pub height: BlockNumber,
    pub payload: Payload,
    pub signature: Signature64,
}

impl Transaction {
    pub fn new(from: Address, to: Address, amount: Balance, nonce: Nonce, payload: Payload) -> Self {
        let mut tx = Self {
            hash: Hash::ZERO,
            from,
            to,
            amount,
            nonce,
            height: 0,
            payload,
            signature: Signature64::zero(),
        };
        tx.hash = tx.calc_hash();
        tx
    }

    pub fn transfer(from: Address, to: Address, amount: Balance, nonce: Nonce) -> Self {
        Self::new(from, to, amount, nonce, Payload::transfer())
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Recomputes the content hash from the immutable fields
    pub fn calc_hash(&self) -> Hash {
        let data_len = (self.payload.data.len() as u64).to_le_bytes();
        Hash::hash_parts(&[
            &self.from.to_bytes(),
            &self.to.to_bytes(),
            &self.amount.to_le_bytes(),
            &self.nonce.to_le_bytes(),
            &[self.payload.code.tag()],
            &data_len,
            &self.payload.data,
        ])
    }

    /// Digest the sender signs (domain-separated hash)
    pub fn signing_hash(&self) -> Hash {
        Hash::hash(&domain_separate(DOMAIN_TRANSACTION, self.hash.as_bytes()))
    }

    /// Attaches a signature produced elsewhere (wallet)
    pub fn set_signature(&mut self, signature: Signature64) {
        self.signature = signature;
    }

    /// Signs with the sender's key
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), TransactionError> {
        if Address::from_public_key(&key.verifying_key()) != self.from {
            return Err(TransactionError::KeyMismatch);
        }
        let signature = key.sign(self.signing_hash().as_bytes());
        self.signature = Signature64::from(signature.to_bytes());
        Ok(())
    }

    /// Checks the hash commitment and the sender's signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.calc_hash() != self.hash {
            return Err(TransactionError::InvalidHash);
        }
        if !self.from.verify(self.signing_hash().as_bytes(), self.signature.as_bytes()) {
            return Err(TransactionError::InvalidSignature);
        }
        Ok(())
    }
}

/// Transaction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("Transaction hash does not match its content")]
    InvalidHash,

    #[error("Invalid transaction signature")]
    InvalidSignature,

    #[error("Signing key does not belong to the sender")]
    KeyMismatch,
}
