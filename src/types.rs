//! Core value types shared across the engine
//!
//! This module defines:
//! - Account addresses and address derivation
//! - Transactions submitted to the engine
//! - Block context visible to running contracts
//! - Logs and internal transactions recorded as side effects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an address in bytes
pub const ADDRESS_LENGTH: usize = 32;

/// Account address
///
/// Addresses identify both externally owned accounts and deployed
/// contracts. Contract addresses are derived from the creator and its
/// nonce at creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// The all-zero address
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    /// Create an address from raw bytes
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create an address with every byte set to `byte`
    pub const fn repeat_byte(byte: u8) -> Self {
        Self([byte; ADDRESS_LENGTH])
    }

    /// Derive the address of a contract created by `creator` at `nonce`
    pub fn derive(creator: &Address, nonce: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(creator.as_bytes());
        hasher.update(&nonce.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse an address from a byte slice
    ///
    /// Returns `None` if the slice is not exactly [`ADDRESS_LENGTH`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; ADDRESS_LENGTH] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Get the raw bytes as a vector
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{}..)", hex::encode(&self.0[..4]))
    }
}

/// What a transaction does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Deploy a new contract module
    Deploy {
        /// Module code as produced by the transformation pipeline
        code: Vec<u8>,
        /// Arguments passed to the module initializer
        args: Vec<u8>,
    },

    /// Invoke an existing contract (or transfer value to an account)
    Call {
        /// Target address
        to: Address,
        /// Encoded entry arguments
        args: Vec<u8>,
    },
}

/// A transaction submitted to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender (origin) of the transaction
    pub sender: Address,

    /// Sender nonce; must match the account nonce
    pub nonce: u64,

    /// Value transferred to the target
    pub value: u128,

    /// Maximum energy this transaction may consume
    pub energy_limit: u64,

    /// Price paid per unit of energy
    pub energy_price: u64,

    /// Deploy or call
    pub kind: TransactionKind,
}

impl Transaction {
    /// Create a deployment transaction
    pub fn deploy(
        sender: Address,
        nonce: u64,
        code: Vec<u8>,
        args: Vec<u8>,
        energy_limit: u64,
        energy_price: u64,
    ) -> Self {
        Self {
            sender,
            nonce,
            value: 0,
            energy_limit,
            energy_price,
            kind: TransactionKind::Deploy { code, args },
        }
    }

    /// Create a call transaction
    pub fn call(
        sender: Address,
        nonce: u64,
        to: Address,
        value: u128,
        args: Vec<u8>,
        energy_limit: u64,
        energy_price: u64,
    ) -> Self {
        Self {
            sender,
            nonce,
            value,
            energy_limit,
            energy_price,
            kind: TransactionKind::Call { to, args },
        }
    }

    /// Check if this transaction deploys a contract
    pub fn is_deploy(&self) -> bool {
        matches!(self.kind, TransactionKind::Deploy { .. })
    }

    /// Get the transaction data billed by the basic transaction cost
    ///
    /// For deployments this is the code followed by the initializer
    /// arguments; for calls it is the entry arguments.
    pub fn data(&self) -> Vec<u8> {
        match &self.kind {
            TransactionKind::Deploy { code, args } => {
                let mut data = Vec::with_capacity(code.len() + args.len());
                data.extend_from_slice(code);
                data.extend_from_slice(args);
                data
            }
            TransactionKind::Call { args, .. } => args.clone(),
        }
    }

    /// Maximum amount the sender pays up front for energy
    pub fn max_energy_cost(&self) -> u128 {
        u128::from(self.energy_limit) * u128::from(self.energy_price)
    }
}

/// Block context readable by running contracts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    /// Block number
    pub number: u64,

    /// Block timestamp (seconds)
    pub timestamp: u64,

    /// Block producer address
    pub coinbase: Address,

    /// Block difficulty
    pub difficulty: u128,

    /// Maximum energy a single transaction may request
    pub energy_limit: u64,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: 0,
            timestamp: 0,
            coinbase: Address::ZERO,
            difficulty: 0,
            energy_limit: 10_000_000,
        }
    }
}

/// Log emitted by a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Emitting contract
    pub address: Address,

    /// Indexed topics
    pub topics: Vec<Vec<u8>>,

    /// Log payload
    pub data: Vec<u8>,
}

impl Log {
    /// Get the size of the log in bytes
    pub fn size_bytes(&self) -> usize {
        self.topics.iter().map(Vec::len).sum::<usize>() + self.data.len()
    }
}

/// Call or creation issued by a running contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTransaction {
    /// Calling contract
    pub sender: Address,

    /// Target contract, `None` for a creation
    pub destination: Option<Address>,

    /// Value transferred
    pub value: u128,

    /// Call arguments or creation code
    pub data: Vec<u8>,

    /// Energy granted to the sub-call
    pub energy_limit: u64,

    /// Set when the sub-call (or an enclosing call) failed
    pub rejected: bool,
}

impl InternalTransaction {
    /// Check if this is a creation
    pub fn is_create(&self) -> bool {
        self.destination.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_derivation_is_deterministic() {
        let creator = Address::repeat_byte(7);

        assert_eq!(Address::derive(&creator, 0), Address::derive(&creator, 0));
        assert_ne!(Address::derive(&creator, 0), Address::derive(&creator, 1));
        assert_ne!(
            Address::derive(&creator, 0),
            Address::derive(&Address::repeat_byte(8), 0)
        );
    }

    #[test]
    fn test_address_from_slice() {
        let address = Address::repeat_byte(3);

        assert_eq!(Address::from_slice(&address.to_vec()), Some(address));
        assert_eq!(Address::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_deploy_data_concatenates_code_and_args() {
        let tx = Transaction::deploy(Address::ZERO, 0, vec![1, 2], vec![3], 100_000, 1);

        assert!(tx.is_deploy());
        assert_eq!(tx.data(), vec![1, 2, 3]);
    }

    #[test]
    fn test_max_energy_cost() {
        let tx = Transaction::call(
            Address::ZERO,
            0,
            Address::repeat_byte(1),
            0,
            Vec::new(),
            u64::MAX,
            u64::MAX,
        );

        assert_eq!(tx.max_energy_cost(), u128::from(u64::MAX) * u128::from(u64::MAX));
    }
}
