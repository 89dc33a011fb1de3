//! World state abstraction
//!
//! The engine reads and writes accounts through the [`WorldState`] trait.
//! Durable backing stores live outside this crate; [`InMemoryWorldState`]
//! is provided for embedding and testing.
//!
//! Every call is address-scoped. Inside the engine each access is
//! preceded by a resource monitor acquisition for that address.

use crate::types::{Address, BlockContext};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// World state errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// Backing store failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for world state operations
pub type Result<T> = std::result::Result<T, WorldError>;

/// Versioned, address-keyed world state
pub trait WorldState: Send + Sync {
    /// Get an account balance (zero for unknown accounts)
    fn get_balance(&self, address: &Address) -> Result<u128>;

    /// Set an account balance
    fn set_balance(&self, address: &Address, balance: u128) -> Result<()>;

    /// Get an account nonce (zero for unknown accounts)
    fn get_nonce(&self, address: &Address) -> Result<u64>;

    /// Set an account nonce
    fn set_nonce(&self, address: &Address, nonce: u64) -> Result<()>;

    /// Get the module code deployed at an address
    fn get_code(&self, address: &Address) -> Result<Option<Arc<Vec<u8>>>>;

    /// Store module code at an address
    fn set_code(&self, address: &Address, code: Arc<Vec<u8>>) -> Result<()>;

    /// Get the persisted object graph snapshot of a contract
    fn get_object_graph(&self, address: &Address) -> Result<Option<Arc<Vec<u8>>>>;

    /// Persist the object graph snapshot of a contract
    fn put_object_graph(&self, address: &Address, graph: Arc<Vec<u8>>) -> Result<()>;

    /// Get a storage value of a contract
    fn get_storage(&self, address: &Address, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Set (or remove, with `None`) a storage value of a contract
    fn put_storage(&self, address: &Address, key: &[u8], value: Option<Vec<u8>>) -> Result<()>;

    /// Remove an account and everything stored under it
    fn delete_account(&self, address: &Address) -> Result<()>;

    /// Block context of the block being executed
    fn block_context(&self) -> &BlockContext;
}

/// Account record of the in-memory world state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    /// Balance
    pub balance: u128,

    /// Nonce
    pub nonce: u64,

    /// Deployed module code
    pub code: Option<Arc<Vec<u8>>>,

    /// Persisted object graph
    pub object_graph: Option<Arc<Vec<u8>>>,

    /// Key/value storage
    pub storage: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// In-memory world state
///
/// Stores accounts in a HashMap behind a read/write lock. Useful for
/// testing and for embedding the engine without a durable store.
#[derive(Debug, Default)]
pub struct InMemoryWorldState {
    accounts: RwLock<HashMap<Address, Account>>,
    block: BlockContext,
}

impl InMemoryWorldState {
    /// Create an empty world state for `block`
    pub fn new(block: BlockContext) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            block,
        }
    }

    /// Create a world state with pre-funded accounts
    pub fn with_balances(block: BlockContext, balances: &[(Address, u128)]) -> Self {
        let state = Self::new(block);
        {
            let mut accounts = state.accounts.write();
            for (address, balance) in balances {
                accounts.entry(*address).or_default().balance = *balance;
            }
        }
        state
    }

    /// Get a copy of an account
    pub fn account(&self, address: &Address) -> Option<Account> {
        self.accounts.read().get(address).cloned()
    }

    /// Number of accounts
    pub fn account_count(&self) -> usize {
        self.accounts.read().len()
    }

    fn update<F: FnOnce(&mut Account)>(&self, address: &Address, f: F) {
        f(self.accounts.write().entry(*address).or_default());
    }
}

impl WorldState for InMemoryWorldState {
    fn get_balance(&self, address: &Address) -> Result<u128> {
        Ok(self
            .accounts
            .read()
            .get(address)
            .map(|a| a.balance)
            .unwrap_or_default())
    }

    fn set_balance(&self, address: &Address, balance: u128) -> Result<()> {
        self.update(address, |account| account.balance = balance);
        Ok(())
    }

    fn get_nonce(&self, address: &Address) -> Result<u64> {
        Ok(self
            .accounts
            .read()
            .get(address)
            .map(|a| a.nonce)
            .unwrap_or_default())
    }

    fn set_nonce(&self, address: &Address, nonce: u64) -> Result<()> {
        self.update(address, |account| account.nonce = nonce);
        Ok(())
    }

    fn get_code(&self, address: &Address) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self
            .accounts
            .read()
            .get(address)
            .and_then(|a| a.code.clone()))
    }

    fn set_code(&self, address: &Address, code: Arc<Vec<u8>>) -> Result<()> {
        self.update(address, |account| account.code = Some(code));
        Ok(())
    }

    fn get_object_graph(&self, address: &Address) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self
            .accounts
            .read()
            .get(address)
            .and_then(|a| a.object_graph.clone()))
    }

    fn put_object_graph(&self, address: &Address, graph: Arc<Vec<u8>>) -> Result<()> {
        self.update(address, |account| account.object_graph = Some(graph));
        Ok(())
    }

    fn get_storage(&self, address: &Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .accounts
            .read()
            .get(address)
            .and_then(|a| a.storage.get(key).cloned()))
    }

    fn put_storage(&self, address: &Address, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        self.update(address, |account| match value {
            Some(value) => {
                account.storage.insert(key.to_vec(), value);
            }
            None => {
                account.storage.remove(key);
            }
        });
        Ok(())
    }

    fn delete_account(&self, address: &Address) -> Result<()> {
        self.accounts.write().remove(address);
        Ok(())
    }

    fn block_context(&self) -> &BlockContext {
        &self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_account_defaults() {
        let state = InMemoryWorldState::new(BlockContext::default());
        let address = Address::repeat_byte(1);

        assert_eq!(state.get_balance(&address).unwrap(), 0);
        assert_eq!(state.get_nonce(&address).unwrap(), 0);
        assert_eq!(state.get_code(&address).unwrap(), None);
        assert_eq!(state.account_count(), 0);
    }

    #[test]
    fn test_storage_put_and_remove() {
        let state = InMemoryWorldState::new(BlockContext::default());
        let address = Address::repeat_byte(2);

        state.put_storage(&address, b"k", Some(b"v".to_vec())).unwrap();
        assert_eq!(state.get_storage(&address, b"k").unwrap(), Some(b"v".to_vec()));

        state.put_storage(&address, b"k", None).unwrap();
        assert_eq!(state.get_storage(&address, b"k").unwrap(), None);
    }

    #[test]
    fn test_delete_account() {
        let address = Address::repeat_byte(3);
        let state = InMemoryWorldState::with_balances(BlockContext::default(), &[(address, 50)]);
        state.set_code(&address, Arc::new(vec![1])).unwrap();

        state.delete_account(&address).unwrap();

        assert_eq!(state.account(&address), None);
        assert_eq!(state.get_balance(&address).unwrap(), 0);
    }
}
