//! Reentrant call stack
//!
//! Each task keeps a stack of the contracts active on its call chain.
//! The first frame that enters an address owns its [`ReentrantState`];
//! a reentrant frame for the same address pushes a [`StackEntry::Shared`]
//! marker and works on the live state held lower in the stack, so at
//! most one state exists per address.
//!
//! Only the state of the address on top of the stack may materialize
//! objects. `push` and `pop` move the active flag of the instance
//! loaders accordingly.
//!
//! Reentrant entries record a snapshot of the live graph in a journal.
//! Reverting to a checkpoint restores those snapshots, which is how a
//! failed sub-call is kept from leaking writes into a caller it
//! re-entered.

use crate::module::Module;
use crate::snapshot::{ObjectGraph, Snapshot};
use crate::types::Address;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Gate that lets a module materialize objects only while on top
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceLoader {
    active: bool,
}

impl InstanceLoader {
    /// Mark the loader as usable
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Mark the loader as paused
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Check if the loader may materialize objects
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Interned class names, shared across reentrant visits of one contract
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    ids: HashMap<String, u32>,
    names: Vec<String>,
}

impl SymbolTable {
    /// Intern `name`, returning a stable identifier
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Get the name of an interned identifier
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Number of interned names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if nothing was interned
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// In-flight state of one contract on a task's call chain
pub struct ReentrantState {
    address: Address,
    module: Arc<dyn Module>,

    /// Live heap
    graph: ObjectGraph,

    /// Heap as loaded from world state
    persisted: ObjectGraph,

    symbols: SymbolTable,
    loader: InstanceLoader,
}

impl ReentrantState {
    /// Create the state of a contract entered from its persisted graph
    pub fn new(address: Address, module: Arc<dyn Module>, graph: ObjectGraph) -> Self {
        Self {
            address,
            module,
            persisted: graph.clone(),
            graph,
            symbols: SymbolTable::default(),
            loader: InstanceLoader::default(),
        }
    }

    /// Contract address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Loaded module
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    /// Live heap
    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    /// Live heap, mutably
    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        &mut self.graph
    }

    /// Replace the live heap
    pub fn replace_graph(&mut self, graph: ObjectGraph) {
        self.graph = graph;
    }

    /// Heap as it was when loaded from world state
    pub fn persisted(&self) -> &ObjectGraph {
        &self.persisted
    }

    /// Interned class table
    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// Instance loader
    pub fn loader(&self) -> &InstanceLoader {
        &self.loader
    }
}

impl fmt::Debug for ReentrantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantState")
            .field("address", &self.address)
            .field("next_hash_code", &self.graph.next_hash_code())
            .field("symbols", &self.symbols.len())
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

/// One frame of the reentrant call stack
#[derive(Debug)]
pub enum StackEntry {
    /// First entry of an address; owns its state
    Owned(ReentrantState),

    /// Reentrant entry; the state is owned lower in the stack
    Shared(Address),
}

impl StackEntry {
    /// Address of the frame
    pub fn address(&self) -> &Address {
        match self {
            StackEntry::Owned(state) => state.address(),
            StackEntry::Shared(address) => address,
        }
    }
}

/// Length of the reentry journal at some point of execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackCheckpoint(usize);

/// Per-task stack of active contracts
#[derive(Debug, Default)]
pub struct ReentrantStack {
    frames: Vec<StackEntry>,

    /// Graph snapshots taken on reentrant entry, oldest first
    journal: Vec<(Address, Snapshot)>,
}

impl ReentrantStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame and make it the active one
    pub fn push(&mut self, entry: StackEntry) {
        if let Some(top) = self.top_address() {
            self.set_loader_active(&top, false);
        }
        let address = *entry.address();
        self.frames.push(entry);
        self.set_loader_active(&address, true);
        debug!("Entered {} at stack height {}", address, self.frames.len());
    }

    /// Pop the top frame and reactivate the one below it
    pub fn pop(&mut self) -> Option<StackEntry> {
        let top = self.top_address()?;
        self.set_loader_active(&top, false);
        let entry = self.frames.pop();
        if let Some(address) = self.top_address() {
            self.set_loader_active(&address, true);
        }
        entry
    }

    /// Find the live state of `address`, scanning from the top
    pub fn try_share(&self, address: &Address) -> Option<&ReentrantState> {
        self.frames.iter().rev().find_map(|entry| match entry {
            StackEntry::Owned(state) if state.address() == address => Some(state),
            _ => None,
        })
    }

    /// Find the live state of `address` for mutation
    pub fn state_mut(&mut self, address: &Address) -> Option<&mut ReentrantState> {
        self.frames.iter_mut().rev().find_map(|entry| match entry {
            StackEntry::Owned(state) if state.address() == address => Some(state),
            _ => None,
        })
    }

    /// Check if `address` is active on the call chain
    pub fn contains(&self, address: &Address) -> bool {
        self.try_share(address).is_some()
    }

    /// Address of the top frame
    pub fn top_address(&self) -> Option<Address> {
        self.frames.last().map(|entry| *entry.address())
    }

    /// Number of frames
    pub fn height(&self) -> usize {
        self.frames.len()
    }

    /// Record the graph of `address` as it was on reentrant entry
    ///
    /// # Returns
    /// Journal position of the recorded snapshot
    pub fn record_reentry(&mut self, address: Address, snapshot: Snapshot) -> usize {
        self.journal.push((address, snapshot));
        self.journal.len() - 1
    }

    /// Snapshot recorded at a journal position
    pub fn reentry_snapshot(&self, position: usize) -> Option<&Snapshot> {
        self.journal.get(position).map(|(_, snapshot)| snapshot)
    }

    /// Current journal position
    pub fn checkpoint(&self) -> StackCheckpoint {
        StackCheckpoint(self.journal.len())
    }

    /// Restore every live graph re-entered since `checkpoint`
    ///
    /// Snapshots are applied newest first so the oldest one wins.
    /// Addresses that already left the stack are skipped.
    pub fn revert_to(&mut self, checkpoint: StackCheckpoint) -> crate::snapshot::Result<()> {
        while self.journal.len() > checkpoint.0 {
            let Some((address, snapshot)) = self.journal.pop() else {
                break;
            };
            if let Some(state) = self.state_mut(&address) {
                state.graph.revert(&snapshot)?;
            }
        }
        Ok(())
    }

    /// Drop every frame and journal entry
    pub fn clear(&mut self) {
        self.frames.clear();
        self.journal.clear();
    }

    fn set_loader_active(&mut self, address: &Address, active: bool) {
        if let Some(state) = self.state_mut(address) {
            if active {
                state.loader.activate();
            } else {
                state.loader.deactivate();
            }
        }
    }
}
