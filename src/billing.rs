//! Billing model
//!
//! This module provides the energy price schedule:
//! - Basic transaction cost (zero bytes are cheaper than non-zero bytes)
//! - Deployment and code storage fees
//! - Storage fees for object-graph reads and writes, charged through the
//!   energy meter of the frame that is currently executing

use crate::energy::{EnergyMeter, EnergyResult};
use serde::{Deserialize, Serialize};

/// Fixed plus per-byte cost of a storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFee {
    /// Cost charged once per operation
    pub base: u64,

    /// Cost charged per byte touched
    pub per_byte: u64,
}

impl StorageFee {
    /// Create a storage fee
    pub const fn new(base: u64, per_byte: u64) -> Self {
        Self { base, per_byte }
    }

    /// Cost of an operation over `bytes`
    pub fn cost(&self, bytes: usize) -> u64 {
        self.base
            .saturating_add(self.per_byte.saturating_mul(bytes as u64))
    }
}

/// Energy price schedule
///
/// Defines the energy cost for transaction admission, deployment,
/// internal calls, logs, and storage access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSchedule {
    // Transaction costs
    /// Base cost for any transaction
    pub basic_transaction: u64,

    /// Cost per zero byte of transaction data
    pub transaction_zero_byte: u64,

    /// Cost per non-zero byte of transaction data
    pub transaction_nonzero_byte: u64,

    // Deployment costs
    /// Base cost for deploying a module
    pub deployment_base: u64,

    /// Cost per class (type) defined by the module
    pub deployment_per_class: u64,

    /// Cost per byte of module code processed at deployment
    pub deployment_per_byte: u64,

    /// Cost per byte of module code kept in storage
    pub code_storage_per_byte: u64,

    // Runtime costs
    /// Cost for issuing an internal call or creation
    pub internal_call: u64,

    /// Cost for emitting a log
    pub log: StorageFee,

    /// Cost per log topic
    pub log_topic: u64,

    /// Cost for deleting an account
    pub self_destruct: u64,

    // Storage fees
    /// Reading static data from backing storage
    pub read_static_from_storage: StorageFee,

    /// Reading static data from the in-memory cache
    pub read_static_from_cache: StorageFee,

    /// Reading instance data from backing storage
    pub read_instance_from_storage: StorageFee,

    /// Reading instance data from the in-memory cache
    pub read_instance_from_cache: StorageFee,

    /// First write of data to backing storage
    pub first_write_to_storage: StorageFee,

    /// Update of existing data in backing storage
    pub update_write_to_storage: StorageFee,

    /// First write of data to the in-memory cache
    pub first_write_to_cache: StorageFee,

    /// Update of existing data in the in-memory cache
    pub update_write_to_cache: StorageFee,
}

impl Default for BillingSchedule {
    fn default() -> Self {
        Self {
            basic_transaction: 21_000,
            transaction_zero_byte: 4,
            transaction_nonzero_byte: 64,

            deployment_base: 200_000,
            deployment_per_class: 1_000,
            deployment_per_byte: 10,
            code_storage_per_byte: 20,

            internal_call: 5_000,
            log: StorageFee::new(375, 8),
            log_topic: 375,
            self_destruct: 5_000,

            read_static_from_storage: StorageFee::new(5_000, 10),
            read_static_from_cache: StorageFee::new(500, 1),
            read_instance_from_storage: StorageFee::new(2_500, 10),
            read_instance_from_cache: StorageFee::new(100, 1),
            first_write_to_storage: StorageFee::new(20_000, 100),
            update_write_to_storage: StorageFee::new(5_000, 50),
            first_write_to_cache: StorageFee::new(1_000, 5),
            update_write_to_cache: StorageFee::new(500, 2),
        }
    }
}

impl BillingSchedule {
    /// Create a new schedule with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a schedule that charges nothing
    ///
    /// Useful to test protocol behavior independent of prices.
    pub fn free() -> Self {
        let zero = StorageFee::new(0, 0);
        Self {
            basic_transaction: 0,
            transaction_zero_byte: 0,
            transaction_nonzero_byte: 0,
            deployment_base: 0,
            deployment_per_class: 0,
            deployment_per_byte: 0,
            code_storage_per_byte: 0,
            internal_call: 0,
            log: zero,
            log_topic: 0,
            self_destruct: 0,
            read_static_from_storage: zero,
            read_static_from_cache: zero,
            read_instance_from_storage: zero,
            read_instance_from_cache: zero,
            first_write_to_storage: zero,
            update_write_to_storage: zero,
            first_write_to_cache: zero,
            update_write_to_cache: zero,
        }
    }

    /// Get the basic cost of a transaction carrying `data`
    ///
    /// A fixed base cost plus a per-byte cost that is cheaper for zero
    /// bytes than for non-zero bytes.
    pub fn basic_transaction_cost(&self, data: &[u8]) -> u64 {
        data.iter().fold(self.basic_transaction, |cost, byte| {
            let per_byte = if *byte == 0 {
                self.transaction_zero_byte
            } else {
                self.transaction_nonzero_byte
            };
            cost.saturating_add(per_byte)
        })
    }

    /// Get the fee for deploying a module
    ///
    /// # Arguments
    /// * `class_count` - Number of classes (types) the module defines
    /// * `code_bytes` - Size of the module code
    pub fn deployment_fee(&self, class_count: usize, code_bytes: usize) -> u64 {
        self.deployment_base
            .saturating_add(self.deployment_per_class.saturating_mul(class_count as u64))
            .saturating_add(self.deployment_per_byte.saturating_mul(code_bytes as u64))
    }

    /// Get the fee for keeping `code_bytes` of module code in storage
    pub fn code_storage_fee(&self, code_bytes: usize) -> u64 {
        self.code_storage_per_byte.saturating_mul(code_bytes as u64)
    }

    /// Get the fee for emitting a log
    pub fn log_cost(&self, topics: usize, data_bytes: usize) -> u64 {
        self.log
            .cost(data_bytes)
            .saturating_add(self.log_topic.saturating_mul(topics as u64))
    }
}

/// Storage fee processor
///
/// Charges storage fees against an energy account. Implementations must
/// bill the frame that is currently executing, never a shared account:
/// a callee faulting in data on behalf of a caller bills the caller's
/// frame only through the energy the callee reports as used.
pub trait StorageFeeProcessor {
    /// Schedule used for pricing
    fn schedule(&self) -> &BillingSchedule;

    /// Charge `fee` for an operation over `bytes`
    fn charge(&mut self, fee: StorageFee, bytes: usize) -> EnergyResult<()>;

    /// Read static data from backing storage
    fn read_static_from_storage(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().read_static_from_storage;
        self.charge(fee, bytes)
    }

    /// Read static data from the in-memory cache
    fn read_static_from_cache(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().read_static_from_cache;
        self.charge(fee, bytes)
    }

    /// Read instance data from backing storage
    fn read_instance_from_storage(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().read_instance_from_storage;
        self.charge(fee, bytes)
    }

    /// Read instance data from the in-memory cache
    fn read_instance_from_cache(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().read_instance_from_cache;
        self.charge(fee, bytes)
    }

    /// Write data to backing storage for the first time
    fn first_write_to_storage(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().first_write_to_storage;
        self.charge(fee, bytes)
    }

    /// Update data already in backing storage
    fn update_write_to_storage(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().update_write_to_storage;
        self.charge(fee, bytes)
    }

    /// Write data to the in-memory cache for the first time
    fn first_write_to_cache(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().first_write_to_cache;
        self.charge(fee, bytes)
    }

    /// Update data already in the in-memory cache
    fn update_write_to_cache(&mut self, bytes: usize) -> EnergyResult<()> {
        let fee = self.schedule().update_write_to_cache;
        self.charge(fee, bytes)
    }
}

/// Storage fee processor bound to one frame's energy meter
pub struct FrameFees<'a> {
    schedule: &'a BillingSchedule,
    meter: &'a mut EnergyMeter,
}

impl<'a> FrameFees<'a> {
    /// Bind the schedule to a frame meter
    pub fn new(schedule: &'a BillingSchedule, meter: &'a mut EnergyMeter) -> Self {
        Self { schedule, meter }
    }
}

impl StorageFeeProcessor for FrameFees<'_> {
    fn schedule(&self) -> &BillingSchedule {
        self.schedule
    }

    fn charge(&mut self, fee: StorageFee, bytes: usize) -> EnergyResult<()> {
        self.meter.consume(fee.cost(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bytes_are_cheaper() {
        let schedule = BillingSchedule::default();

        let zeros = schedule.basic_transaction_cost(&[0u8; 10]);
        let ones = schedule.basic_transaction_cost(&[1u8; 10]);

        assert_eq!(zeros, 21_000 + 10 * 4);
        assert_eq!(ones, 21_000 + 10 * 64);
        assert!(zeros < ones);
    }

    #[test]
    fn test_basic_cost_of_empty_data() {
        let schedule = BillingSchedule::default();

        assert_eq!(schedule.basic_transaction_cost(&[]), schedule.basic_transaction);
    }

    #[test]
    fn test_deployment_fee() {
        let schedule = BillingSchedule::default();

        assert_eq!(schedule.deployment_fee(3, 100), 200_000 + 3_000 + 1_000);
        assert_eq!(schedule.code_storage_fee(100), 2_000);
    }

    #[test]
    fn test_frame_fees_charge_the_bound_meter() {
        let schedule = BillingSchedule::default();
        let mut meter = EnergyMeter::new(100_000);

        {
            let mut fees = FrameFees::new(&schedule, &mut meter);
            fees.read_static_from_storage(10).unwrap();
            fees.update_write_to_cache(4).unwrap();
        }

        assert_eq!(meter.consumed(), (5_000 + 100) + (500 + 8));
    }

    #[test]
    fn test_frame_fees_out_of_energy() {
        let schedule = BillingSchedule::default();
        let mut meter = EnergyMeter::new(1_000);
        let mut fees = FrameFees::new(&schedule, &mut meter);

        assert!(fees.first_write_to_storage(1).is_err());
        assert_eq!(meter.consumed(), 0);
    }

    #[test]
    fn test_free_schedule() {
        let schedule = BillingSchedule::free();

        assert_eq!(schedule.basic_transaction_cost(&[1, 2, 3]), 0);
        assert_eq!(schedule.deployment_fee(10, 10_000), 0);
        assert_eq!(schedule.read_static_from_storage.cost(1_000), 0);
    }
}
