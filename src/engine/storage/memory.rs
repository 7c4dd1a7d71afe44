//! In-memory storage used by tests and the loopback harness.
//!
//! Clones share state, so a test can hand one clone to the Update Manager
//! and inspect the other.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{BootControl, BootPartitionState, FirmwareStorage};
use crate::engine::error::StorageError;

/// Faults to inject on the next matching call
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub fail_begin: bool,
    /// Fail the append that would push the region past this many bytes
    pub fail_append_after: Option<usize>,
    pub fail_finalize: bool,
    pub fail_set_boot_target: bool,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub region: Option<Vec<u8>>,
    pub capacity: u32,
    pub finalized: Option<Vec<u8>>,
    /// Image selected as next boot target
    pub boot_image: Option<Vec<u8>>,
    pub boot_state: BootPartitionState,
    pub begin_calls: usize,
    pub abort_calls: usize,
    pub reboots: usize,
    pub faults: Faults,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        let storage = Self::new();
        storage.state().faults = faults;
        storage
    }

    pub fn with_boot_state(boot_state: BootPartitionState) -> Self {
        let storage = Self::new();
        storage.state().boot_state = boot_state;
        storage
    }

    /// Lock the shared state for inspection or fault setup
    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn boot_image(&self) -> Option<Vec<u8>> {
        self.state().boot_image.clone()
    }

    pub fn has_open_region(&self) -> bool {
        self.state().region.is_some()
    }
}

impl FirmwareStorage for MemoryStorage {
    fn begin(&mut self, capacity: u32) -> Result<(), StorageError> {
        let mut state = self.state();
        state.begin_calls += 1;
        if state.faults.fail_begin {
            return Err(StorageError::Injected("begin"));
        }
        state.region = Some(Vec::with_capacity(capacity as usize));
        state.capacity = capacity;
        state.finalized = None;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state();
        let capacity = state.capacity;
        let limit = state.faults.fail_append_after;
        let region = state.region.as_mut().ok_or(StorageError::NoRegion)?;

        let attempted = region.len() + data.len();
        if limit.is_some_and(|limit| attempted > limit) {
            return Err(StorageError::Injected("append"));
        }
        if attempted > capacity as usize {
            return Err(StorageError::RegionOverflow {
                attempted: attempted as u64,
                capacity: u64::from(capacity),
            });
        }
        region.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StorageError> {
        let mut state = self.state();
        let region = state.region.take().ok_or(StorageError::NoRegion)?;
        if state.faults.fail_finalize {
            return Err(StorageError::Injected("finalize"));
        }
        state.finalized = Some(region);
        Ok(())
    }

    fn set_boot_target(&mut self) -> Result<(), StorageError> {
        let mut state = self.state();
        if state.faults.fail_set_boot_target {
            state.finalized = None;
            return Err(StorageError::Injected("set_boot_target"));
        }
        let image = state.finalized.take().ok_or(StorageError::NotFinalized)?;
        state.boot_image = Some(image);
        Ok(())
    }

    fn abort(&mut self) {
        let mut state = self.state();
        state.abort_calls += 1;
        state.region = None;
        state.finalized = None;
    }
}

impl BootControl for MemoryStorage {
    fn boot_state(&self) -> Result<BootPartitionState, StorageError> {
        Ok(self.state().boot_state)
    }

    fn mark_valid(&mut self) -> Result<(), StorageError> {
        self.state().boot_state = BootPartitionState::Valid;
        Ok(())
    }

    fn mark_invalid(&mut self) -> Result<(), StorageError> {
        self.state().boot_state = BootPartitionState::Invalid;
        Ok(())
    }

    /// Unwinds instead of restarting; tests catch the panic.
    fn reboot(&mut self) -> ! {
        self.state().reboots += 1;
        panic!("reboot requested")
    }
}
