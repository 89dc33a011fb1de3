//! Transaction effects and execution results
//!
//! This module defines the effects of transaction execution:
//! - Terminal status of a transaction
//! - Energy usage
//! - Emitted logs and internal transactions
//! - Side-effect log with nested-call checkpoints

use crate::types::{InternalTransaction, Log};
use serde::{Deserialize, Serialize};

/// Terminal status of a transaction
///
/// Has no abort variant; an abort is never terminal and never reaches
/// a submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Transaction executed successfully
    Success,

    /// Energy limit exhausted
    OutOfEnergy,

    /// Native recursion guard tripped
    OutOfStack,

    /// Call chain would have exceeded the depth limit
    CallDepthLimitExceeded,

    /// Contract reverted explicitly
    Revert,

    /// Contract signalled an invalid, non-recoverable state
    Invalid,

    /// Contract raised an exception it did not handle
    UncaughtException,

    /// Module failed pre-execution checks
    RejectedModule,

    /// Sender nonce did not match
    RejectedInvalidNonce,

    /// Sender cannot pay for energy and value
    RejectedInsufficientBalance,

    /// Energy limit below the basic cost or above the block limit
    RejectedInvalidEnergyLimit,
}

impl TransactionStatus {
    /// Check if this is a success
    pub fn is_success(&self) -> bool {
        *self == TransactionStatus::Success
    }

    /// Check if the transaction was rejected before execution
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            TransactionStatus::RejectedInvalidNonce
                | TransactionStatus::RejectedInsufficientBalance
                | TransactionStatus::RejectedInvalidEnergyLimit
        )
    }

    /// Check if the transaction executed and failed
    pub fn is_failed(&self) -> bool {
        !self.is_success() && !self.is_rejected()
    }
}

/// Transaction execution result
///
/// Contains all observable effects of executing a transaction, including:
/// - Execution status (success/failure kind)
/// - Energy used
/// - Return data
/// - Emitted logs and internal transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Execution status
    pub status: TransactionStatus,

    /// Energy charged to the sender
    pub energy_used: u64,

    /// Data returned by the entry point (the new address for deployments)
    pub return_data: Option<Vec<u8>>,

    /// Logs emitted during execution
    pub logs: Vec<Log>,

    /// Calls and creations issued by contracts
    pub internal_transactions: Vec<InternalTransaction>,

    /// Captured cause, for uncaught exceptions only
    pub exception: Option<String>,
}

impl TransactionResult {
    /// Create a result for a transaction rejected before execution
    pub fn rejected(status: TransactionStatus) -> Self {
        Self {
            status,
            energy_used: 0,
            return_data: None,
            logs: Vec::new(),
            internal_transactions: Vec::new(),
            exception: None,
        }
    }

    /// Check if execution was successful
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if execution failed
    pub fn is_failure(&self) -> bool {
        !self.status.is_success()
    }

    /// Get total energy cost (used energy * price)
    pub fn total_energy_cost(&self, energy_price: u64) -> u128 {
        u128::from(self.energy_used) * u128::from(energy_price)
    }
}

/// Position in the side-effect log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideEffectsCheckpoint {
    logs: usize,
    internal_transactions: usize,
}

/// Append-only side-effect log of one transaction attempt
///
/// A failing sub-call drops the logs it (and its callees) emitted and
/// marks its internal transactions as rejected. Internal transactions
/// are kept so the call tree stays observable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    /// Emitted logs
    logs: Vec<Log>,

    /// Issued calls and creations
    internal_transactions: Vec<InternalTransaction>,
}

impl SideEffects {
    /// Create an empty side-effect log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a log
    pub fn add_log(&mut self, log: Log) {
        self.logs.push(log);
    }

    /// Record an internal transaction
    pub fn add_internal_transaction(&mut self, tx: InternalTransaction) {
        self.internal_transactions.push(tx);
    }

    /// Get recorded logs
    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    /// Get recorded internal transactions
    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.internal_transactions
    }

    /// Mark the current position
    pub fn checkpoint(&self) -> SideEffectsCheckpoint {
        SideEffectsCheckpoint {
            logs: self.logs.len(),
            internal_transactions: self.internal_transactions.len(),
        }
    }

    /// Roll back everything recorded after `checkpoint`
    pub fn rollback(&mut self, checkpoint: SideEffectsCheckpoint) {
        self.logs.truncate(checkpoint.logs);
        for tx in self
            .internal_transactions
            .iter_mut()
            .skip(checkpoint.internal_transactions)
        {
            tx.rejected = true;
        }
    }

    /// Clear everything (used between attempts)
    pub fn clear(&mut self) {
        self.logs.clear();
        self.internal_transactions.clear();
    }

    /// Take the recorded effects
    pub fn take(&mut self) -> (Vec<Log>, Vec<InternalTransaction>) {
        (
            std::mem::take(&mut self.logs),
            std::mem::take(&mut self.internal_transactions),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn log(byte: u8) -> Log {
        Log {
            address: Address::repeat_byte(byte),
            topics: vec![vec![byte]],
            data: vec![byte; 4],
        }
    }

    fn internal(byte: u8) -> InternalTransaction {
        InternalTransaction {
            sender: Address::repeat_byte(byte),
            destination: Some(Address::repeat_byte(byte + 1)),
            value: 0,
            data: Vec::new(),
            energy_limit: 1_000,
            rejected: false,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(TransactionStatus::Success.is_success());
        assert!(TransactionStatus::Revert.is_failed());
        assert!(TransactionStatus::RejectedInvalidNonce.is_rejected());
        assert!(!TransactionStatus::RejectedInvalidNonce.is_failed());
        assert!(!TransactionStatus::RejectedModule.is_rejected());
    }

    #[test]
    fn test_rollback_drops_logs_and_marks_internal_transactions() {
        let mut effects = SideEffects::new();
        effects.add_log(log(1));
        effects.add_internal_transaction(internal(1));

        let checkpoint = effects.checkpoint();
        effects.add_log(log(2));
        effects.add_internal_transaction(internal(2));
        effects.rollback(checkpoint);

        assert_eq!(effects.logs(), &[log(1)]);
        assert_eq!(effects.internal_transactions().len(), 2);
        assert!(!effects.internal_transactions()[0].rejected);
        assert!(effects.internal_transactions()[1].rejected);
    }

    #[test]
    fn test_rejected_result_uses_no_energy() {
        let result = TransactionResult::rejected(TransactionStatus::RejectedInsufficientBalance);

        assert!(result.is_failure());
        assert_eq!(result.energy_used, 0);
        assert_eq!(result.total_energy_cost(1_000), 0);
    }
}
