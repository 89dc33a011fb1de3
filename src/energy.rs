//! Energy metering for call frames
//!
//! This module provides per-frame energy accounting:
//! - Energy consumption tracking against a frame limit
//! - The sub-call energy restriction (a caller keeps 1/64 of what remains)
//! - Failure-kind dependent energy charging

use crate::effects::TransactionStatus;
use thiserror::Error;

/// Energy metering errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnergyError {
    /// Insufficient energy
    #[error("Insufficient energy: required {required}, available {available}")]
    OutOfEnergy {
        /// Energy the operation needed
        required: u64,
        /// Energy left in the frame
        available: u64,
    },
}

/// Result type for energy operations
pub type EnergyResult<T> = std::result::Result<T, EnergyError>;

/// Divisor of the share of remaining energy a caller always retains
pub const SUB_CALL_RETAINED_DIVISOR: u64 = 64;

/// Largest energy limit a sub-call may be granted
///
/// A caller with `remaining` energy can hand at most
/// `remaining - remaining / 64` to a sub-call.
pub fn max_sub_call_energy(remaining: u64) -> u64 {
    remaining - remaining / SUB_CALL_RETAINED_DIVISOR
}

/// Energy meter for one call frame
///
/// Each frame owns its meter. A sub-call gets a fresh meter whose limit
/// is restricted by [`EnergyMeter::restrict_sub_call`]; when it returns,
/// the caller is charged what the sub-call used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyMeter {
    /// Energy limit for this frame
    limit: u64,

    /// Energy consumed so far
    consumed: u64,
}

impl EnergyMeter {
    /// Create a new energy meter
    ///
    /// # Arguments
    /// * `limit` - Total energy available to the frame
    pub fn new(limit: u64) -> Self {
        Self { limit, consumed: 0 }
    }

    /// Consume energy for an operation
    ///
    /// # Arguments
    /// * `amount` - Amount of energy to consume
    ///
    /// # Returns
    /// - `Ok(())` if energy was consumed successfully
    /// - `Err(EnergyError)` if the frame cannot pay, leaving the meter untouched
    pub fn consume(&mut self, amount: u64) -> EnergyResult<()> {
        let new_consumed = self.consumed.saturating_add(amount);

        if new_consumed > self.limit {
            return Err(EnergyError::OutOfEnergy {
                required: amount,
                available: self.remaining(),
            });
        }

        self.consumed = new_consumed;
        Ok(())
    }

    /// Get remaining energy
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }

    /// Get consumed energy
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Get the frame limit
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Check if there's enough energy for an operation
    pub fn has_energy(&self, amount: u64) -> bool {
        self.remaining() >= amount
    }

    /// Compute the energy limit granted to a sub-call
    ///
    /// The grant is the smaller of what the sub-call requests and
    /// [`max_sub_call_energy`] of this frame's remaining energy. Nothing is
    /// charged here; the caller pays only what the sub-call reports as used.
    pub fn restrict_sub_call(&self, requested: u64) -> u64 {
        requested.min(max_sub_call_energy(self.remaining()))
    }

    /// Energy charged for a frame that concluded with `status`
    ///
    /// Success and revert pay what was consumed; every other failure
    /// pays the full limit. Rejected transactions pay nothing.
    pub fn charge_for(&self, status: TransactionStatus) -> u64 {
        match status {
            TransactionStatus::Success | TransactionStatus::Revert => self.consumed,
            status if status.is_rejected() => 0,
            _ => self.limit,
        }
    }
}
