//! Tagged outcome of the invoke step
//!
//! A contract invocation either returns data or stops with a [`Trap`].
//! The coordinator matches on the tag to decide between committing,
//! reverting, retrying the task, or shutting the engine down.

use crate::effects::TransactionStatus;
use crate::energy::EnergyError;
use crate::snapshot::SnapshotError;
use crate::world::WorldError;
use thiserror::Error;

/// Reason a call frame stopped without returning
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// Energy limit exhausted
    #[error("Out of energy")]
    OutOfEnergy,

    /// Native recursion guard tripped
    #[error("Out of stack")]
    OutOfStack,

    /// Call chain would exceed the depth limit
    #[error("Call depth limit exceeded")]
    CallDepthLimitExceeded,

    /// Explicit revert
    #[error("Reverted")]
    Revert,

    /// Explicit invalid
    #[error("Invalid")]
    Invalid,

    /// Exception not handled by the contract
    #[error("Uncaught exception: {0}")]
    Exception(String),

    /// Module failed pre-execution checks
    #[error("Rejected module: {0}")]
    RejectedModule(String),

    /// Resource conflict; the whole task must be retried
    #[error("Aborted by resource conflict")]
    Abort,

    /// The execution substrate is corrupted
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl Trap {
    /// Terminal status for this trap
    ///
    /// Returns `None` for [`Trap::Abort`] and [`Trap::Fatal`], which are
    /// never converted into a transaction result.
    pub fn status(&self) -> Option<TransactionStatus> {
        match self {
            Trap::OutOfEnergy => Some(TransactionStatus::OutOfEnergy),
            Trap::OutOfStack => Some(TransactionStatus::OutOfStack),
            Trap::CallDepthLimitExceeded => Some(TransactionStatus::CallDepthLimitExceeded),
            Trap::Revert => Some(TransactionStatus::Revert),
            Trap::Invalid => Some(TransactionStatus::Invalid),
            Trap::Exception(_) => Some(TransactionStatus::UncaughtException),
            Trap::RejectedModule(_) => Some(TransactionStatus::RejectedModule),
            Trap::Abort | Trap::Fatal(_) => None,
        }
    }

    /// Trap that re-raises a failed sub-call status in the calling frame
    pub fn from_status(status: TransactionStatus) -> Option<Self> {
        match status {
            TransactionStatus::Success => None,
            TransactionStatus::OutOfEnergy => Some(Trap::OutOfEnergy),
            TransactionStatus::OutOfStack => Some(Trap::OutOfStack),
            TransactionStatus::CallDepthLimitExceeded => Some(Trap::CallDepthLimitExceeded),
            TransactionStatus::Revert => Some(Trap::Revert),
            TransactionStatus::UncaughtException => {
                Some(Trap::Exception("uncaught exception in sub-call".to_string()))
            }
            TransactionStatus::RejectedModule => {
                Some(Trap::RejectedModule("sub-call module rejected".to_string()))
            }
            TransactionStatus::Invalid
            | TransactionStatus::RejectedInvalidNonce
            | TransactionStatus::RejectedInsufficientBalance
            | TransactionStatus::RejectedInvalidEnergyLimit => Some(Trap::Invalid),
        }
    }

    /// Check if this trap forces a retry
    pub fn is_abort(&self) -> bool {
        matches!(self, Trap::Abort)
    }

    /// Check if this trap must unwind every frame of the task
    pub fn unwinds_task(&self) -> bool {
        matches!(self, Trap::Abort | Trap::Fatal(_))
    }
}

impl From<EnergyError> for Trap {
    fn from(_: EnergyError) -> Self {
        Trap::OutOfEnergy
    }
}

impl From<SnapshotError> for Trap {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::TooLarge { .. } => Trap::OutOfEnergy,
            SnapshotError::UnknownObject(_) => Trap::Invalid,
            SnapshotError::Serialization(msg) => Trap::Fatal(msg),
        }
    }
}

impl From<WorldError> for Trap {
    fn from(err: WorldError) -> Self {
        Trap::Fatal(err.to_string())
    }
}
