//! Host interface of a running contract
//!
//! Every [`Module`](crate::module::Module) invocation receives a
//! [`Runtime`] bound to its call frame. Through it a contract reads its
//! context, meters energy, works on its object graph, touches world
//! state, and issues nested calls.
//!
//! Host calls return `Result<_, Trap>`. A contract is expected to
//! propagate errors with `?`. Traps that stop the whole frame (energy
//! exhaustion, the depth limit, aborts and fatal errors) stay in force
//! even if the contract ignores the error: every later host call fails
//! with the same trap and the frame ends with it.

use crate::effects::TransactionStatus;
use crate::snapshot::ObjectId;
use crate::trap::Trap;
use crate::types::{Address, BlockContext};

/// Outcome of a nested call or creation, as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// Terminal status of the sub-call
    pub status: TransactionStatus,

    /// Energy the caller was charged for the sub-call
    pub energy_used: u64,

    /// Returned data (the new address for creations)
    pub return_data: Option<Vec<u8>>,

    /// Captured cause of an uncaught exception
    pub exception: Option<String>,
}

impl CallOutcome {
    /// Outcome of a sub-call refused before it started
    pub fn rejected(status: TransactionStatus) -> Self {
        Self {
            status,
            energy_used: 0,
            return_data: None,
            exception: None,
        }
    }

    /// Check if the sub-call succeeded
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Convert into the returned data, re-raising a failure in the caller
    pub fn into_result(self) -> Result<Vec<u8>, Trap> {
        match self.status {
            TransactionStatus::Success => Ok(self.return_data.unwrap_or_default()),
            TransactionStatus::UncaughtException => Err(Trap::Exception(
                self.exception
                    .unwrap_or_else(|| "uncaught exception in sub-call".to_string()),
            )),
            status => Err(Trap::from_status(status).unwrap_or(Trap::Invalid)),
        }
    }
}

/// Host interface of one call frame
pub trait Runtime {
    /// Address of the executing contract
    fn address(&self) -> Address;

    /// Immediate caller
    fn caller(&self) -> Address;

    /// Sender of the transaction
    fn origin(&self) -> Address;

    /// Value transferred with this call
    fn value(&self) -> u128;

    /// Number of frames on the call chain, the external one being 1
    fn depth(&self) -> usize;

    /// Context of the block being executed
    fn block_context(&self) -> BlockContext;

    /// Energy left in this frame
    fn energy_remaining(&self) -> u64;

    /// Charge energy for computation
    fn charge_energy(&mut self, amount: u64) -> Result<(), Trap>;

    /// Balance of any account
    fn balance(&mut self, address: &Address) -> Result<u128, Trap>;

    /// Static data of this contract's object graph
    fn statics(&mut self) -> Result<Vec<u8>, Trap>;

    /// Replace the static data of this contract's object graph
    fn set_statics(&mut self, data: Vec<u8>) -> Result<(), Trap>;

    /// Allocate an instance object
    fn allocate(&mut self, data: Vec<u8>) -> Result<ObjectId, Trap>;

    /// Read an instance object
    fn object(&mut self, id: ObjectId) -> Result<Vec<u8>, Trap>;

    /// Replace an instance object
    fn update_object(&mut self, id: ObjectId, data: Vec<u8>) -> Result<(), Trap>;

    /// Intern a class name in this contract's symbol table
    fn intern(&mut self, name: &str) -> Result<u32, Trap>;

    /// Read a key/value storage entry of this contract
    fn get_storage(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, Trap>;

    /// Write (or remove, with `None`) a key/value storage entry
    fn put_storage(&mut self, key: &[u8], value: Option<Vec<u8>>) -> Result<(), Trap>;

    /// Emit a log
    fn log(&mut self, topics: Vec<Vec<u8>>, data: Vec<u8>) -> Result<(), Trap>;

    /// Call another contract (or this one again)
    ///
    /// # Arguments
    /// * `target` - Contract to call
    /// * `value` - Value to transfer from this contract
    /// * `args` - Entry arguments
    /// * `energy_limit` - Requested energy; the grant is capped so this
    ///   frame keeps 1/64 of its remaining energy
    ///
    /// # Returns
    /// - `Ok(CallOutcome)` for every terminal outcome of the sub-call
    /// - `Err(Trap)` if this frame itself must stop
    fn call(
        &mut self,
        target: &Address,
        value: u128,
        args: &[u8],
        energy_limit: u64,
    ) -> Result<CallOutcome, Trap>;

    /// Deploy a new contract from this one
    ///
    /// On success the outcome's return data is the new address.
    fn create(
        &mut self,
        code: &[u8],
        args: &[u8],
        value: u128,
        energy_limit: u64,
    ) -> Result<CallOutcome, Trap>;

    /// Delete this contract, moving its balance to `beneficiary`
    ///
    /// The account is removed when the transaction commits. Any value sent
    /// to this address later in the same transaction is burned with it,
    /// and naming the contract itself as `beneficiary` burns its balance.
    fn self_destruct(&mut self, beneficiary: &Address) -> Result<(), Trap>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result() {
        let ok = CallOutcome {
            status: TransactionStatus::Success,
            energy_used: 10,
            return_data: Some(vec![1]),
            exception: None,
        };
        assert_eq!(ok.into_result(), Ok(vec![1]));

        let revert = CallOutcome {
            status: TransactionStatus::Revert,
            energy_used: 10,
            return_data: None,
            exception: None,
        };
        assert_eq!(revert.into_result(), Err(Trap::Revert));
    }

    #[test]
    fn test_exception_cause_is_preserved() {
        let outcome = CallOutcome {
            status: TransactionStatus::UncaughtException,
            energy_used: 10,
            return_data: None,
            exception: Some("division by zero".to_string()),
        };

        assert_eq!(
            outcome.into_result(),
            Err(Trap::Exception("division by zero".to_string()))
        );
    }

    #[test]
    fn test_rejected_outcome_is_free() {
        let outcome = CallOutcome::rejected(TransactionStatus::RejectedInsufficientBalance);

        assert_eq!(outcome.energy_used, 0);
        assert!(!outcome.is_success());
    }
}
