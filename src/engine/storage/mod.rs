//! Firmware Storage
//!
//! The Update Manager talks to non-volatile storage only through the
//! traits in this module.
//!
//! Components:
//! - `record` - Persisted boot record (active slot, rollback target, health state)
//! - `partition` - Two-slot, file-backed store used by the device daemon
//! - `memory` - In-memory store with fault injection

pub mod memory;
pub mod partition;
pub mod record;

use serde::{Deserialize, Serialize};

use crate::engine::error::StorageError;

pub use memory::MemoryStorage;
pub use partition::PartitionStore;
pub use record::{BootOutcome, BootRecord};

/// Health state of the image the device is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BootPartitionState {
    /// Image confirmed healthy
    #[default]
    Valid,
    /// First boot of a freshly committed image, awaiting confirmation
    PendingVerify,
    /// Image rejected, rollback to the previous slot requested
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Slot::A => "slot_a.bin",
            Slot::B => "slot_b.bin",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => f.write_str("A"),
            Slot::B => f.write_str("B"),
        }
    }
}

/// Write side of the update region
pub trait FirmwareStorage: Send {
    /// Open a region able to hold `capacity` bytes
    fn begin(&mut self, capacity: u32) -> Result<(), StorageError>;

    /// Append bytes to the open region
    fn append(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Close the region and make its contents durable
    fn finalize(&mut self) -> Result<(), StorageError>;

    /// Select the finalized region as the next boot target
    fn set_boot_target(&mut self) -> Result<(), StorageError>;

    /// Drop the open or finalized region without touching the boot target
    fn abort(&mut self);
}

/// Boot-time health bookkeeping
pub trait BootControl {
    fn boot_state(&self) -> Result<BootPartitionState, StorageError>;

    /// Confirm the running image and cancel the pending rollback
    fn mark_valid(&mut self) -> Result<(), StorageError>;

    /// Reject the running image so the previous one boots next
    fn mark_invalid(&mut self) -> Result<(), StorageError>;

    /// Restart the device. Never returns.
    fn reboot(&mut self) -> !;
}

impl<T: FirmwareStorage + ?Sized> FirmwareStorage for Box<T> {
    fn begin(&mut self, capacity: u32) -> Result<(), StorageError> {
        (**self).begin(capacity)
    }

    fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        (**self).append(data)
    }

    fn finalize(&mut self) -> Result<(), StorageError> {
        (**self).finalize()
    }

    fn set_boot_target(&mut self) -> Result<(), StorageError> {
        (**self).set_boot_target()
    }

    fn abort(&mut self) {
        (**self).abort()
    }
}
