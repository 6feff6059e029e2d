// Account - Addresses and the balance/stake ledger entry
use super::primitives::{Balance, Hash, Nonce};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Length of the checksum suffix appended to the public key
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Full encoded address length (public key + checksum)
pub const ADDRESS_LEN: usize = 32 + ADDRESS_CHECKSUM_LEN;

/// Address = Ed25519 public key followed by a Blake3 checksum
///
/// The public key is embedded so signatures can be checked against `from`
/// without a separate key registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    public_key: [u8; 32],
    checksum: [u8; ADDRESS_CHECKSUM_LEN],
}

impl Address {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self::from_public_key_bytes(key.to_bytes())
    }

    pub fn from_public_key_bytes(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            checksum: Self::compute_checksum(&public_key),
        }
    }

    /// Decode and validate an encoded address
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDRESS_LEN {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[..32]);
        let mut checksum = [0u8; ADDRESS_CHECKSUM_LEN];
        checksum.copy_from_slice(&bytes[32..]);

        if checksum != Self::compute_checksum(&public_key) {
            return Err(AddressError::InvalidChecksum);
        }
        Ok(Self { public_key, checksum })
    }

    fn compute_checksum(public_key: &[u8; 32]) -> [u8; ADDRESS_CHECKSUM_LEN] {
        let digest = Hash::hash(public_key);
        let mut checksum = [0u8; ADDRESS_CHECKSUM_LEN];
        checksum.copy_from_slice(&digest.as_bytes()[..ADDRESS_CHECKSUM_LEN]);
        checksum
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        out[..32].copy_from_slice(&self.public_key);
        out[32..].copy_from_slice(&self.checksum);
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    /// Verifies an Ed25519 signature made by this address's key
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let public_key = match VerifyingKey::from_bytes(&self.public_key) {
            Ok(pk) => pk,
            Err(_) => return false,
        };

        let sig = Signature::from_bytes(signature);

        public_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.public_key[..8]))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| AddressError::InvalidHex(e.to_string()))?;
        Address::from_bytes(&bytes)
    }
}

// Hex string in JSON configs, raw bytes on the wire
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Address::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Address::from_bytes(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

/// Address decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid address length: {0} bytes")]
    InvalidLength(usize),

    #[error("Address checksum mismatch")]
    InvalidChecksum,

    #[error("Invalid address hex: {0}")]
    InvalidHex(String),
}

/// Ledger entry for one address
///
/// Staking does not move funds out of `balance`; it locks them. The spendable
/// part is `balance - max(total_staking, total_pegged_stake)` and every
/// mutation that could lower it is checked first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,

    pub balance: Balance,

    /// Nonce of the last executed transaction
    pub nonce: Nonce,

    /// Stake delegated to each candidate
    pub staking: BTreeMap<Address, Balance>,

    /// Stake locked at genesis, never withdrawable
    pub total_pegged_stake: Balance,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            staking: BTreeMap::new(),
            total_pegged_stake: 0,
        }
    }

    pub fn total_staking(&self) -> Balance {
        self.staking
            .values()
            .fold(0, |acc: Balance, v| acc.saturating_add(*v))
    }

    fn locked(&self) -> Balance {
        self.total_staking().max(self.total_pegged_stake)
    }

    pub fn available_balance(&self) -> Balance {
        self.balance.saturating_sub(self.locked())
    }

    pub fn staked_to(&self, candidate: &Address) -> Balance {
        self.staking.get(candidate).copied().unwrap_or(0)
    }

    pub fn credit(&mut self, amount: Balance) {
        self.balance = self.balance.saturating_add(amount);
    }

    pub fn debit(&mut self, amount: Balance) -> Result<(), AccountError> {
        let available = self.available_balance();
        if available < amount {
            return Err(AccountError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    /// Locks `amount` of the balance as stake for `candidate`
    pub fn stake(&mut self, candidate: Address, amount: Balance) -> Result<(), AccountError> {
        let new_total = self.total_staking().saturating_add(amount);
        if new_total.max(self.total_pegged_stake) > self.balance {
            return Err(AccountError::InsufficientBalance {
                available: self.available_balance(),
                requested: amount,
            });
        }
        let entry = self.staking.entry(candidate).or_insert(0);
        *entry = entry.saturating_add(amount);
        Ok(())
    }

    pub fn unstake(&mut self, candidate: &Address, amount: Balance) -> Result<(), AccountError> {
        let current = self.staked_to(candidate);
        if current < amount {
            return Err(AccountError::InsufficientStake {
                staked: current,
                requested: amount,
            });
        }
        if current == amount {
            self.staking.remove(candidate);
        } else {
            self.staking.insert(*candidate, current - amount);
        }
        Ok(())
    }

    /// Pegs genesis stake; the balance must already cover it
    pub fn peg_stake(&mut self, amount: Balance) -> Result<(), AccountError> {
        let new_pegged = self.total_pegged_stake.saturating_add(amount);
        if new_pegged > self.balance {
            return Err(AccountError::InsufficientBalance {
                available: self.available_balance(),
                requested: amount,
            });
        }
        self.total_pegged_stake = new_pegged;
        Ok(())
    }
}

/// Account errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: Balance, requested: Balance },

    #[error("Insufficient stake: staked {staked}, requested {requested}")]
    InsufficientStake { staked: Balance, requested: Balance },

    #[error("Account not found")]
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(seed: u8) -> Address {
        Address::from_public_key_bytes([seed; 32])
    }

    #[test]
    fn test_address_checksum_roundtrip() {
        let a = addr(3);
        let decoded = Address::from_bytes(&a.to_bytes()).unwrap();
        assert_eq!(a, decoded);

        let parsed: Address = a.to_hex().parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn test_address_rejects_bad_checksum() {
        let mut bytes = addr(3).to_bytes();
        bytes[ADDRESS_LEN - 1] ^= 0xFF;
        assert_eq!(Address::from_bytes(&bytes), Err(AddressError::InvalidChecksum));
        assert_eq!(
            Address::from_bytes(&bytes[..10]),
            Err(AddressError::InvalidLength(10))
        );
    }

    #[test]
    fn test_address_json_is_hex() {
        let a = addr(9);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{}\"", a.to_hex()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_available_balance_uses_max_of_stake_and_peg() {
        let mut account = Account::new(addr(1));
        account.credit(1000);
        account.peg_stake(300).unwrap();
        assert_eq!(account.available_balance(), 700);

        // Staking under the peg does not lower the spendable amount
        account.stake(addr(2), 200).unwrap();
        assert_eq!(account.available_balance(), 700);

        account.stake(addr(3), 400).unwrap();
        assert_eq!(account.total_staking(), 600);
        assert_eq!(account.available_balance(), 400);
    }

    #[test]
    fn test_debit_checks_available() {
        let mut account = Account::new(addr(1));
        account.credit(100);
        account.stake(addr(2), 60).unwrap();

        assert!(matches!(
            account.debit(50),
            Err(AccountError::InsufficientBalance { available: 40, requested: 50 })
        ));
        account.debit(40).unwrap();
        assert_eq!(account.balance, 60);
    }

    #[test]
    fn test_stake_and_unstake() {
        let mut account = Account::new(addr(1));
        account.credit(100);
        assert!(account.stake(addr(2), 150).is_err());

        account.stake(addr(2), 80).unwrap();
        assert!(matches!(
            account.unstake(&addr(2), 90),
            Err(AccountError::InsufficientStake { staked: 80, requested: 90 })
        ));
        account.unstake(&addr(2), 80).unwrap();
        assert!(account.staking.is_empty());
    }
}
