//! # Silver Execution Engine
//!
//! Sandboxed contract execution with concurrent transaction processing.
//!
//! This crate provides:
//! - Transaction execution with per-frame energy metering
//! - Nested and reentrant contract calls with state capture, commit and revert
//! - Per-address optimistic concurrency control with abort and retry
//! - A worker pool that runs a batch in parallel with sequential semantics
//! - Billing model for deployment, storage and transaction costs

#![warn(missing_docs, rust_2018_idioms)]

pub mod billing;
pub mod config;
pub mod effects;
pub mod energy;
pub mod executor;
pub mod module;
pub mod monitor;
pub mod overlay;
pub mod pool;
pub mod queue;
pub mod runtime;
pub mod snapshot;
pub mod stack;
pub mod task;
pub mod trap;
pub mod types;
pub mod world;

pub use billing::{BillingSchedule, FrameFees, StorageFee, StorageFeeProcessor};
pub use config::{EngineConfig, Environment};
pub use effects::{SideEffects, TransactionResult, TransactionStatus};
pub use energy::{EnergyError, EnergyMeter};
pub use executor::{EngineError, TransactionExecutor};
pub use module::{Module, ModuleCache, ModuleError, ModuleLoader};
pub use monitor::{MonitorStats, ResourceMonitor, Ticket};
pub use overlay::TransactionalState;
pub use pool::ConcurrentExecutor;
pub use queue::{FutureResult, HandoffQueue};
pub use runtime::{CallOutcome, Runtime};
pub use snapshot::{ObjectGraph, ObjectId, Snapshot, SnapshotError};
pub use stack::{ReentrantStack, ReentrantState, StackEntry};
pub use task::Task;
pub use trap::Trap;
pub use types::{Address, BlockContext, InternalTransaction, Log, Transaction, TransactionKind};
pub use world::{InMemoryWorldState, WorldError, WorldState};
