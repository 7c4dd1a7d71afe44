//! Partition Store
//!
//! File-backed A/B slot layout used by the device daemon:
//!
//! ```text
//! <device_dir>/
//!   boot.json            boot record
//!   slots/slot_a.bin     image slot A
//!   slots/slot_b.bin     image slot B
//!   slots/slot_?.bin.partial   region being written
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info, warn};

use super::record::{BootOutcome, BootRecord};
use super::{BootControl, BootPartitionState, FirmwareStorage, Slot};
use crate::engine::error::StorageError;

/// Exit status a supervisor treats as "reboot requested"
pub const REBOOT_EXIT_CODE: i32 = 75;

struct OpenRegion {
    slot: Slot,
    file: File,
    capacity: u64,
    written: u64,
}

pub struct PartitionStore {
    base_dir: PathBuf,
    slot_capacity: u64,
    region: Option<OpenRegion>,
    /// Slot and size of a finalized, not yet selected image
    finalized: Option<(Slot, u64)>,
}

impl PartitionStore {
    pub fn new(base_dir: PathBuf, slot_capacity: u64) -> Self {
        Self {
            base_dir,
            slot_capacity,
            region: None,
            finalized: None,
        }
    }

    /// Create the directory layout and a default boot record
    pub fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.slots_dir())?;
        let record_path = self.record_path();
        if !record_path.exists() {
            BootRecord::default().save(&record_path)?;
        }
        self.cleanup_partial()?;
        Ok(())
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.base_dir.join("slots")
    }

    pub fn record_path(&self) -> PathBuf {
        self.base_dir.join("boot.json")
    }

    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        self.slots_dir().join(slot.file_name())
    }

    pub fn partial_path(&self, slot: Slot) -> PathBuf {
        self.slots_dir().join(format!("{}.partial", slot.file_name()))
    }

    pub fn record(&self) -> Result<BootRecord, StorageError> {
        BootRecord::load(&self.record_path())
    }

    /// Apply a pending slot switch or rollback; run once per boot
    pub fn resolve_boot(&self) -> Result<BootOutcome, StorageError> {
        let mut record = self.record()?;
        let outcome = record.resolve_boot();
        record.save(&self.record_path())?;

        match outcome {
            BootOutcome::Switched { from, to } => {
                info!(%from, %to, "Booting new image, verification pending")
            }
            BootOutcome::RolledBack { from, to } => {
                warn!(%from, %to, "Image rejected, rolled back")
            }
            BootOutcome::Unchanged { slot } => info!(%slot, "Booting current image"),
        }
        Ok(outcome)
    }

    /// Remove leftovers of interrupted writes
    pub fn cleanup_partial(&self) -> Result<(), StorageError> {
        for slot in [Slot::A, Slot::B] {
            let partial = self.partial_path(slot);
            if partial.exists() {
                warn!(%slot, "Removing stale partial image");
                fs::remove_file(&partial)?;
            }
        }
        Ok(())
    }

    fn discard_region(&mut self) {
        if let Some(region) = self.region.take() {
            let partial = self.partial_path(region.slot);
            drop(region.file);
            if let Err(e) = fs::remove_file(&partial) {
                warn!(path = %partial.display(), "Could not remove partial image: {}", e);
            }
        }
    }

    fn write_record(&self, update: impl FnOnce(&mut BootRecord)) -> Result<(), StorageError> {
        let path = self.record_path();
        let mut record = BootRecord::load(&path)?;
        update(&mut record);
        record.save(&path)
    }
}

impl FirmwareStorage for PartitionStore {
    fn begin(&mut self, capacity: u32) -> Result<(), StorageError> {
        if self.region.is_some() || self.finalized.is_some() {
            warn!("Discarding stale update region");
            self.abort();
        }

        let requested = u64::from(capacity);
        if requested > self.slot_capacity {
            return Err(StorageError::InsufficientSpace {
                requested,
                capacity: self.slot_capacity,
            });
        }

        let mut record = self.record()?;
        if record.state == BootPartitionState::PendingVerify {
            // The other slot holds the rollback image until this one is confirmed
            return Err(StorageError::Unconfirmed);
        }

        // The slot stops being bootable before its file is touched
        let slot = record.update_slot();
        if record.release_slot(slot) {
            record.save(&self.record_path())?;
            warn!(%slot, "Released slot for overwrite, earlier image no longer selected");
        }

        fs::create_dir_all(self.slots_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.partial_path(slot))?;

        info!(%slot, capacity, "Opened update region");
        self.region = Some(OpenRegion {
            slot,
            file,
            capacity: requested,
            written: 0,
        });
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let region = self.region.as_mut().ok_or(StorageError::NoRegion)?;

        let attempted = region.written + data.len() as u64;
        if attempted > region.capacity {
            return Err(StorageError::RegionOverflow {
                attempted,
                capacity: region.capacity,
            });
        }

        region.file.write_all(data)?;
        region.written = attempted;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StorageError> {
        let mut region = self.region.take().ok_or(StorageError::NoRegion)?;
        let partial = self.partial_path(region.slot);

        let result = region
            .file
            .flush()
            .and_then(|_| region.file.sync_all())
            .and_then(|_| fs::rename(&partial, self.slot_path(region.slot)));

        if let Err(e) = result {
            error!(slot = %region.slot, "Failed to finalize image: {}", e);
            drop(region.file);
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        }

        info!(slot = %region.slot, size = region.written, "Image finalized");
        self.finalized = Some((region.slot, region.written));
        Ok(())
    }

    fn set_boot_target(&mut self) -> Result<(), StorageError> {
        let (slot, size) = self.finalized.take().ok_or(StorageError::NotFinalized)?;
        self.write_record(|record| record.select_next_boot(slot, size))?;
        info!(%slot, "Boot target set");
        Ok(())
    }

    fn abort(&mut self) {
        self.discard_region();
        self.finalized = None;
    }
}

impl BootControl for PartitionStore {
    fn boot_state(&self) -> Result<BootPartitionState, StorageError> {
        Ok(self.record()?.state)
    }

    fn mark_valid(&mut self) -> Result<(), StorageError> {
        self.write_record(BootRecord::mark_valid)
    }

    fn mark_invalid(&mut self) -> Result<(), StorageError> {
        self.write_record(BootRecord::mark_invalid)
    }

    fn reboot(&mut self) -> ! {
        warn!("Rebooting");
        std::process::exit(REBOOT_EXIT_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn store(dir: &Path, capacity: u64) -> PartitionStore {
        let store = PartitionStore::new(dir.to_path_buf(), capacity);
        store.init().unwrap();
        store
    }

    #[test]
    fn test_init_layout() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1024);
        assert!(store.slots_dir().exists());
        assert!(store.record_path().exists());
        assert_eq!(store.record().unwrap().active, Slot::A);
    }

    #[test]
    fn test_write_and_select() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 1024);

        store.begin(8).unwrap();
        assert!(store.partial_path(Slot::B).exists());
        store.append(b"abcd").unwrap();
        store.append(b"efgh").unwrap();
        store.finalize().unwrap();
        assert!(!store.partial_path(Slot::B).exists());
        assert_eq!(fs::read(store.slot_path(Slot::B)).unwrap(), b"abcdefgh");

        // Finalized alone is not bootable
        assert!(store.record().unwrap().next_boot.is_none());

        store.set_boot_target().unwrap();
        let record = store.record().unwrap();
        assert_eq!(record.next_boot, Some(Slot::B));
        assert_eq!(record.image(Slot::B).map(|i| i.size), Some(8));
    }

    #[test]
    fn test_capacity_limits() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 16);

        assert!(matches!(
            store.begin(17),
            Err(StorageError::InsufficientSpace { requested: 17, capacity: 16 })
        ));

        store.begin(4).unwrap();
        assert!(matches!(
            store.append(b"12345"),
            Err(StorageError::RegionOverflow { attempted: 5, capacity: 4 })
        ));
    }

    #[test]
    fn test_abort_removes_partial() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 64);

        store.begin(4).unwrap();
        store.append(b"ab").unwrap();
        store.abort();
        assert!(!store.partial_path(Slot::B).exists());
        assert!(matches!(store.append(b"cd"), Err(StorageError::NoRegion)));
        assert!(matches!(store.set_boot_target(), Err(StorageError::NotFinalized)));
    }

    #[test]
    fn test_refuses_update_while_pending_verify() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 64);

        store.begin(2).unwrap();
        store.append(b"ok").unwrap();
        store.finalize().unwrap();
        store.set_boot_target().unwrap();
        store.resolve_boot().unwrap();
        assert_eq!(store.boot_state().unwrap(), BootPartitionState::PendingVerify);

        assert!(matches!(store.begin(2), Err(StorageError::Unconfirmed)));

        store.mark_valid().unwrap();
        store.begin(2).unwrap();
        // Active is now B, so the update goes to A
        assert!(store.partial_path(Slot::A).exists());
    }

    #[test]
    fn test_rollback_after_invalid() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 64);

        store.begin(1).unwrap();
        store.append(b"x").unwrap();
        store.finalize().unwrap();
        store.set_boot_target().unwrap();
        store.resolve_boot().unwrap();

        store.mark_invalid().unwrap();
        let outcome = store.resolve_boot().unwrap();
        assert_eq!(outcome, BootOutcome::RolledBack { from: Slot::B, to: Slot::A });
        assert_eq!(store.boot_state().unwrap(), BootPartitionState::Valid);
    }

    #[test]
    fn test_init_cleans_stale_partial() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 64);
        fs::write(store.partial_path(Slot::B), b"junk").unwrap();
        store.init().unwrap();
        assert!(!store.partial_path(Slot::B).exists());
    }

    fn commit_image(store: &mut PartitionStore, image: &[u8]) -> Result<(), StorageError> {
        store.begin(image.len() as u32)?;
        store.append(image)?;
        store.finalize()?;
        store.set_boot_target()
    }

    #[test]
    fn test_update_before_reboot_withdraws_previous_commit() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 64);
        commit_image(&mut store, b"image-one").unwrap();
        assert_eq!(store.record().unwrap().next_boot, Some(Slot::B));

        // Second image goes to the same slot; its commit fails on the record write
        store.begin(9).unwrap();
        assert!(store.record().unwrap().next_boot.is_none());
        fs::create_dir(store.record_path().with_extension("tmp")).unwrap();
        store.append(b"image-TWO").unwrap();
        store.finalize().unwrap();
        assert!(store.set_boot_target().is_err());

        let record = store.record().unwrap();
        assert!(record.next_boot.is_none());
        assert!(record.image(Slot::B).is_none());

        fs::remove_dir(store.record_path().with_extension("tmp")).unwrap();
        assert_eq!(
            store.resolve_boot().unwrap(),
            BootOutcome::Unchanged { slot: Slot::A }
        );
    }

    #[test]
    fn test_finalize_failure_keeps_record() {
        let dir = tempdir().unwrap();
        let mut store = store(dir.path(), 64);

        store.begin(4).unwrap();
        store.append(b"data").unwrap();
        // A directory in the slot's place makes the rename fail
        fs::create_dir_all(store.slot_path(Slot::B).join("blocker")).unwrap();

        assert!(store.finalize().is_err());
        assert!(!store.partial_path(Slot::B).exists());
        assert!(matches!(store.set_boot_target(), Err(StorageError::NotFinalized)));
        assert!(store.record().unwrap().next_boot.is_none());
    }
}
