//! Per-task transactional view of world state
//!
//! A [`TransactionalState`] buffers every read and write one task makes,
//! so nothing reaches the shared [`WorldState`] until the task commits.
//!
//! - Every address is acquired from the [`ResourceMonitor`] before its
//!   first read; the acquisition lasts for the whole attempt
//! - Writes are journaled; a checkpoint is a journal length and
//!   reverting undoes writes newest first
//! - [`TransactionalState::commit`] flushes the buffered writes on the
//!   task's commit turn

use crate::monitor::{ResourceMonitor, Ticket};
use crate::trap::Trap;
use crate::types::{Address, BlockContext};
use crate::world::WorldState;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Result type for overlay operations
pub type Result<T> = std::result::Result<T, Trap>;

/// Fields written since the account was first loaded
#[derive(Debug, Clone, Default)]
struct Dirty {
    balance: bool,
    nonce: bool,
    code: bool,
    object_graph: bool,
    storage: HashSet<Vec<u8>>,
}

/// Buffered view of one account
#[derive(Debug, Clone, Default)]
struct CachedAccount {
    balance: u128,
    nonce: u64,
    code: Option<Arc<Vec<u8>>>,
    object_graph: Option<Arc<Vec<u8>>>,

    /// Storage values read or written so far; `None` means absent
    storage: HashMap<Vec<u8>, Option<Vec<u8>>>,

    deleted: bool,
    dirty: Dirty,
}

/// Undo record of one write
#[derive(Debug)]
enum Change {
    Balance(Address, u128),
    Nonce(Address, u64),
    Code(Address, Option<Arc<Vec<u8>>>),
    ObjectGraph(Address, Option<Arc<Vec<u8>>>),
    Storage(Address, Vec<u8>, Option<Option<Vec<u8>>>, bool),
    Deleted(Address, Box<CachedAccount>),
}

/// Journal length at some point of execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCheckpoint(usize);

/// Journaled write buffer of one task
pub struct TransactionalState {
    world: Arc<dyn WorldState>,
    monitor: Arc<ResourceMonitor>,
    ticket: Ticket,
    accounts: HashMap<Address, CachedAccount>,
    journal: Vec<Change>,
}

impl TransactionalState {
    /// Create an empty overlay for `ticket`
    pub fn new(world: Arc<dyn WorldState>, monitor: Arc<ResourceMonitor>, ticket: Ticket) -> Self {
        Self {
            world,
            monitor,
            ticket,
            accounts: HashMap::new(),
            journal: Vec::new(),
        }
    }

    /// Ticket the overlay acquires resources for
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Block context of the underlying world state
    pub fn block_context(&self) -> &BlockContext {
        self.world.block_context()
    }

    /// Fail with [`Trap::Abort`] if the task was signalled to abort
    pub fn check_abort(&self) -> Result<()> {
        self.monitor.abort_requested(self.ticket)
    }

    /// Number of addresses touched
    pub fn touched(&self) -> usize {
        self.accounts.len()
    }

    fn account(&mut self, address: &Address) -> Result<&mut CachedAccount> {
        match self.accounts.entry(*address) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                self.monitor.acquire(address, self.ticket)?;
                let account = CachedAccount {
                    balance: self.world.get_balance(address)?,
                    nonce: self.world.get_nonce(address)?,
                    code: self.world.get_code(address)?,
                    object_graph: self.world.get_object_graph(address)?,
                    ..CachedAccount::default()
                };
                Ok(entry.insert(account))
            }
        }
    }

    /// Get a balance
    pub fn balance(&mut self, address: &Address) -> Result<u128> {
        Ok(self.account(address)?.balance)
    }

    /// Set a balance
    pub fn set_balance(&mut self, address: &Address, balance: u128) -> Result<()> {
        let account = self.account(address)?;
        let previous = std::mem::replace(&mut account.balance, balance);
        account.dirty.balance = true;
        self.journal.push(Change::Balance(*address, previous));
        Ok(())
    }

    /// Add to a balance
    pub fn credit(&mut self, address: &Address, amount: u128) -> Result<()> {
        let balance = self.balance(address)?;
        self.set_balance(address, balance.saturating_add(amount))
    }

    /// Move `value` between two accounts
    ///
    /// # Returns
    /// `Ok(false)` without changing anything if `from` cannot pay
    pub fn transfer(&mut self, from: &Address, to: &Address, value: u128) -> Result<bool> {
        let available = self.balance(from)?;
        if available < value {
            return Ok(false);
        }
        // Touch the destination even for zero transfers.
        self.balance(to)?;
        if value > 0 && from != to {
            self.set_balance(from, available - value)?;
            self.credit(to, value)?;
        }
        Ok(true)
    }

    /// Get a nonce
    pub fn nonce(&mut self, address: &Address) -> Result<u64> {
        Ok(self.account(address)?.nonce)
    }

    /// Increment a nonce, returning the value before the increment
    pub fn increment_nonce(&mut self, address: &Address) -> Result<u64> {
        let account = self.account(address)?;
        let previous = account.nonce;
        account.nonce = previous.saturating_add(1);
        account.dirty.nonce = true;
        self.journal.push(Change::Nonce(*address, previous));
        Ok(previous)
    }

    /// Get deployed code
    pub fn code(&mut self, address: &Address) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self.account(address)?.code.clone())
    }

    /// Store deployed code
    pub fn set_code(&mut self, address: &Address, code: Arc<Vec<u8>>) -> Result<()> {
        let account = self.account(address)?;
        let previous = account.code.replace(code);
        account.dirty.code = true;
        self.journal.push(Change::Code(*address, previous));
        Ok(())
    }

    /// Get the persisted object graph of a contract
    pub fn object_graph(&mut self, address: &Address) -> Result<Option<Arc<Vec<u8>>>> {
        Ok(self.account(address)?.object_graph.clone())
    }

    /// Persist the object graph of a contract
    pub fn put_object_graph(&mut self, address: &Address, graph: Arc<Vec<u8>>) -> Result<()> {
        let account = self.account(address)?;
        let previous = account.object_graph.replace(graph);
        account.dirty.object_graph = true;
        self.journal.push(Change::ObjectGraph(*address, previous));
        Ok(())
    }

    /// Get a storage value
    pub fn storage(&mut self, address: &Address, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let world = Arc::clone(&self.world);
        let account = self.account(address)?;
        if let Some(value) = account.storage.get(key) {
            return Ok(value.clone());
        }
        let value = if account.deleted {
            None
        } else {
            world.get_storage(address, key)?
        };
        account.storage.insert(key.to_vec(), value.clone());
        Ok(value)
    }

    /// Set (or remove, with `None`) a storage value
    pub fn put_storage(&mut self, address: &Address, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        let account = self.account(address)?;
        let previous = account.storage.insert(key.to_vec(), value);
        let was_dirty = !account.dirty.storage.insert(key.to_vec());
        self.journal
            .push(Change::Storage(*address, key.to_vec(), previous, was_dirty));
        Ok(())
    }

    /// Delete an account and everything stored under it
    pub fn delete_account(&mut self, address: &Address) -> Result<()> {
        let account = self.account(address)?;
        let previous = std::mem::replace(
            account,
            CachedAccount {
                deleted: true,
                ..CachedAccount::default()
            },
        );
        self.journal.push(Change::Deleted(*address, Box::new(previous)));
        Ok(())
    }

    /// Current journal position
    pub fn checkpoint(&self) -> StateCheckpoint {
        StateCheckpoint(self.journal.len())
    }

    /// Undo every write made since `checkpoint`
    ///
    /// Addresses stay acquired; only their buffered values roll back.
    pub fn revert_to(&mut self, checkpoint: StateCheckpoint) {
        while self.journal.len() > checkpoint.0 {
            let Some(change) = self.journal.pop() else {
                break;
            };
            self.undo(change);
        }
    }

    fn undo(&mut self, change: Change) {
        let address = match &change {
            Change::Balance(address, _)
            | Change::Nonce(address, _)
            | Change::Code(address, _)
            | Change::ObjectGraph(address, _)
            | Change::Storage(address, ..)
            | Change::Deleted(address, _) => *address,
        };
        let Some(account) = self.accounts.get_mut(&address) else {
            return;
        };

        match change {
            Change::Balance(_, previous) => account.balance = previous,
            Change::Nonce(_, previous) => account.nonce = previous,
            Change::Code(_, previous) => account.code = previous,
            Change::ObjectGraph(_, previous) => account.object_graph = previous,
            Change::Storage(_, key, previous, was_dirty) => {
                if !was_dirty {
                    account.dirty.storage.remove(&key);
                }
                match previous {
                    Some(value) => {
                        account.storage.insert(key, value);
                    }
                    None => {
                        account.storage.remove(&key);
                    }
                }
            }
            Change::Deleted(_, previous) => *account = *previous,
        }
    }

    /// Write every buffered change to the world state
    pub fn flush(&self) -> Result<()> {
        for (address, account) in &self.accounts {
            if account.deleted {
                self.world.delete_account(address)?;
                continue;
            }

            let dirty = &account.dirty;
            if dirty.balance {
                self.world.set_balance(address, account.balance)?;
            }
            if dirty.nonce {
                self.world.set_nonce(address, account.nonce)?;
            }
            if dirty.code {
                if let Some(code) = &account.code {
                    self.world.set_code(address, Arc::clone(code))?;
                }
            }
            if dirty.object_graph {
                if let Some(graph) = &account.object_graph {
                    self.world.put_object_graph(address, Arc::clone(graph))?;
                }
            }
            for key in &dirty.storage {
                if let Some(value) = account.storage.get(key) {
                    self.world.put_storage(address, key, value.clone())?;
                }
            }
        }
        debug!(
            "Ticket {} flushed {} accounts",
            self.ticket,
            self.accounts.len()
        );
        Ok(())
    }

    /// Wait for this task's commit turn, then flush
    pub fn commit(&self) -> Result<()> {
        self.monitor.commit(self.ticket, || self.flush())
    }

    /// Drop every buffered read and write and release the acquired addresses
    pub fn reset(&mut self) {
        self.accounts.clear();
        self.journal.clear();
        self.monitor.reset(self.ticket);
    }
}

impl fmt::Debug for TransactionalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalState")
            .field("ticket", &self.ticket)
            .field("accounts", &self.accounts.len())
            .field("journal", &self.journal.len())
            .finish_non_exhaustive()
    }
}
