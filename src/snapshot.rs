//! Contract object graphs and snapshots
//!
//! A contract's heap is an [`ObjectGraph`]: a static (root) region plus
//! instance objects keyed by a deterministic identity. The identity
//! counter (`next_hash_code`) travels with the graph so that objects get
//! the same identities no matter how often the graph is captured and
//! reloaded.
//!
//! A [`Snapshot`] is the serialized graph. Snapshots are what the engine
//! persists to world state and what it keeps to restore a caller's view
//! when a reentrant call fails.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Snapshot errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Captured graph exceeds the allowed size
    #[error("Object graph too large: {size} bytes, maximum {max}")]
    TooLarge {
        /// Encoded size of the graph
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// Object identity not present in the graph
    #[error("Unknown object: {0}")]
    UnknownObject(u64),

    /// Snapshot bytes could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Identity of an instance object
pub type ObjectId = u64;

/// In-memory heap of one contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraph {
    /// Next identity handed out by [`ObjectGraph::allocate`]
    next_hash_code: ObjectId,

    /// Static (root) data
    statics: Vec<u8>,

    /// Instance objects
    instances: BTreeMap<ObjectId, Vec<u8>>,
}

/// Serialized object graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot(Vec<u8>);

/// Writes needed to bring one graph to the state of another
///
/// Each entry is the byte size of one written region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDelta {
    /// Regions that did not exist before
    pub first_writes: Vec<usize>,

    /// Regions that existed and changed
    pub updates: Vec<usize>,
}

impl GraphDelta {
    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.first_writes.is_empty() && self.updates.is_empty()
    }

    /// Total bytes written
    pub fn bytes(&self) -> usize {
        self.first_writes.iter().chain(&self.updates).sum()
    }
}

impl ObjectGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the next identity that will be assigned
    pub fn next_hash_code(&self) -> ObjectId {
        self.next_hash_code
    }

    /// Get the static data
    pub fn statics(&self) -> &[u8] {
        &self.statics
    }

    /// Replace the static data
    pub fn set_statics(&mut self, statics: Vec<u8>) {
        self.statics = statics;
    }

    /// Allocate a new instance object and return its identity
    pub fn allocate(&mut self, data: Vec<u8>) -> ObjectId {
        let id = self.next_hash_code;
        self.next_hash_code += 1;
        self.instances.insert(id, data);
        id
    }

    /// Get an instance object
    pub fn instance(&self, id: ObjectId) -> Option<&[u8]> {
        self.instances.get(&id).map(Vec::as_slice)
    }

    /// Replace an existing instance object
    pub fn update_instance(&mut self, id: ObjectId, data: Vec<u8>) -> Result<()> {
        let slot = self
            .instances
            .get_mut(&id)
            .ok_or(SnapshotError::UnknownObject(id))?;
        *slot = data;
        Ok(())
    }

    /// Number of instance objects
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Byte sizes of all instance objects, in identity order
    pub fn instance_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.instances.values().map(Vec::len)
    }

    /// Capture the graph into a snapshot
    ///
    /// # Arguments
    /// * `max_bytes` - Largest snapshot the caller can afford to keep
    ///
    /// # Returns
    /// - `Ok(Snapshot)` with the serialized graph
    /// - `Err(SnapshotError::TooLarge)` if the graph exceeds `max_bytes`
    pub fn capture(&self, max_bytes: u64) -> Result<Snapshot> {
        let size = bincode::serialized_size(self)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        if size > max_bytes {
            return Err(SnapshotError::TooLarge {
                size,
                max: max_bytes,
            });
        }

        bincode::serialize(self)
            .map(Snapshot)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    /// Load a graph from a snapshot
    ///
    /// The identity counter is restored with the graph.
    pub fn load(snapshot: &Snapshot) -> Result<Self> {
        bincode::deserialize(&snapshot.0).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    /// Merge a callee's view of this graph into the caller's
    ///
    /// The callee started from the caller's state, so its statics and
    /// instances supersede the caller's. The identity counter never goes
    /// backwards.
    pub fn commit(caller: ObjectGraph, callee: ObjectGraph) -> ObjectGraph {
        let mut merged = caller;
        merged.statics = callee.statics;
        merged.instances.extend(callee.instances);
        merged.next_hash_code = merged.next_hash_code.max(callee.next_hash_code);
        merged
    }

    /// Restore the caller's pre-call state from its snapshot
    pub fn revert(&mut self, caller: &Snapshot) -> Result<()> {
        *self = Self::load(caller)?;
        Ok(())
    }

    /// Compute the writes that turn `base` into `self`
    pub fn delta_since(&self, base: &ObjectGraph) -> GraphDelta {
        let mut delta = GraphDelta::default();

        if self.statics != base.statics {
            if base.statics.is_empty() {
                delta.first_writes.push(self.statics.len());
            } else {
                delta.updates.push(self.statics.len());
            }
        }

        for (id, data) in &self.instances {
            match base.instances.get(id) {
                None => delta.first_writes.push(data.len()),
                Some(previous) if previous != data => delta.updates.push(data.len()),
                Some(_) => {}
            }
        }

        delta
    }
}

impl Snapshot {
    /// Wrap persisted snapshot bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the snapshot bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the snapshot bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Size of the snapshot in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
