//! Boot Record
//!
//! Persisted slot bookkeeping. Every mutation is written atomically so a
//! power cut never leaves a half-written record behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::{BootPartitionState, Slot};
use crate::engine::error::StorageError;

/// Metadata of an image stored in a slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageInfo {
    pub size: u64,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootRecord {
    /// Slot the device is running from
    pub active: Slot,
    /// Last known good slot (rollback target while `PendingVerify`)
    pub previous: Option<Slot>,
    /// Slot selected by a committed update, applied on next boot
    pub next_boot: Option<Slot>,
    /// Health of the active image
    pub state: BootPartitionState,
    #[serde(default)]
    pub slot_a: Option<ImageInfo>,
    #[serde(default)]
    pub slot_b: Option<ImageInfo>,
    pub updated_at: DateTime<Utc>,
}

/// What happened while resolving the boot slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Same slot as before
    Unchanged { slot: Slot },
    /// A committed update is now running, pending verification
    Switched { from: Slot, to: Slot },
    /// The rejected image was abandoned for the previous one
    RolledBack { from: Slot, to: Slot },
}

impl Default for BootRecord {
    fn default() -> Self {
        Self {
            active: Slot::A,
            previous: None,
            next_boot: None,
            state: BootPartitionState::Valid,
            slot_a: None,
            slot_b: None,
            updated_at: Utc::now(),
        }
    }
}

impl BootRecord {
    /// Load the record from disk, or create a default one if absent
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the record atomically
    pub fn save(&mut self, path: &Path) -> Result<(), StorageError> {
        self.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(self)?;

        // Write to temp file first, then rename (atomic)
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    pub fn image(&self, slot: Slot) -> Option<&ImageInfo> {
        match slot {
            Slot::A => self.slot_a.as_ref(),
            Slot::B => self.slot_b.as_ref(),
        }
    }

    pub fn set_image(&mut self, slot: Slot, info: Option<ImageInfo>) {
        match slot {
            Slot::A => self.slot_a = info,
            Slot::B => self.slot_b = info,
        }
    }

    /// Slot an incoming update is written to
    pub fn update_slot(&self) -> Slot {
        self.active.other()
    }

    /// Drop every reference to `slot` before it is overwritten. Returns
    /// whether anything changed.
    pub fn release_slot(&mut self, slot: Slot) -> bool {
        let mut changed = false;
        if self.next_boot == Some(slot) {
            self.next_boot = None;
            changed = true;
        }
        if self.previous == Some(slot) {
            self.previous = None;
            changed = true;
        }
        if self.image(slot).is_some() {
            self.set_image(slot, None);
            changed = true;
        }
        changed
    }

    /// Record a committed image as next boot target
    pub fn select_next_boot(&mut self, slot: Slot, size: u64) {
        self.set_image(
            slot,
            Some(ImageInfo {
                size,
                written_at: Utc::now(),
            }),
        );
        self.next_boot = Some(slot);
    }

    /// Apply pending boot decisions, as a bootloader would at reset
    pub fn resolve_boot(&mut self) -> BootOutcome {
        let from = self.active;

        if self.state == BootPartitionState::Invalid {
            if let Some(previous) = self.previous.take() {
                self.set_image(from, None);
                self.active = previous;
                self.next_boot = None;
                self.state = BootPartitionState::Valid;
                return BootOutcome::RolledBack { from, to: previous };
            }
            // Nothing to fall back to, keep running what we have
            self.state = BootPartitionState::Valid;
        }

        match self.next_boot.take() {
            Some(to) if to != from => {
                self.previous = Some(from);
                self.active = to;
                self.state = BootPartitionState::PendingVerify;
                BootOutcome::Switched { from, to }
            }
            _ => BootOutcome::Unchanged { slot: from },
        }
    }

    pub fn mark_valid(&mut self) {
        self.state = BootPartitionState::Valid;
    }

    pub fn mark_invalid(&mut self) {
        self.state = BootPartitionState::Invalid;
        self.next_boot = None;
    }
}
