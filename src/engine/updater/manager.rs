//! Update Manager
//!
//! Owns the write/verify/commit lifecycle of one firmware image. Chunks go
//! to storage and into a running SHA-256 at the same time, so the digest is
//! known the moment the last byte lands.

use sha2::{Digest, Sha256};
use std::mem;
use tracing::{debug, error, info, warn};

use crate::engine::error::UpdateError;
use crate::engine::storage::FirmwareStorage;

pub const DIGEST_LEN: usize = 32;

pub type ImageDigest = [u8; DIGEST_LEN];

/// Result of a successful `write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More bytes expected
    InProgress,
    /// Image complete and its digest matches; ready to commit
    Verified,
}

/// In-flight write state
struct UpdateSession {
    expected_size: u32,
    expected_digest: ImageDigest,
    bytes_written: u64,
    hasher: Sha256,
    verified: bool,
}

enum ManagerState {
    Idle,
    InProgress(UpdateSession),
}

pub struct UpdateManager<S> {
    storage: S,
    state: ManagerState,
}

impl<S: FirmwareStorage> UpdateManager<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            state: ManagerState::Idle,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.state, ManagerState::InProgress(_))
    }

    /// Bytes accepted for the current session, if one is open
    pub fn bytes_written(&self) -> Option<u64> {
        match &self.state {
            ManagerState::InProgress(session) => Some(session.bytes_written),
            ManagerState::Idle => None,
        }
    }

    /// Open a session for an image of `expected_size` bytes
    pub fn begin(
        &mut self,
        expected_size: u32,
        expected_digest: ImageDigest,
    ) -> Result<(), UpdateError> {
        if self.is_in_progress() {
            return Err(UpdateError::NotAllowed);
        }
        if expected_size == 0 {
            return Err(UpdateError::InvalidParam("firmware size must be non-zero"));
        }

        self.storage.begin(expected_size).inspect_err(|e| {
            error!("Could not open update region: {}", e);
        })?;

        info!(
            size = expected_size,
            digest = %hex::encode(expected_digest),
            "Starting firmware update"
        );
        self.state = ManagerState::InProgress(UpdateSession {
            expected_size,
            expected_digest,
            bytes_written: 0,
            hasher: Sha256::new(),
            verified: false,
        });
        Ok(())
    }

    /// `begin`, clearing a stale session left by an abandoned connection.
    ///
    /// The first failure aborts whatever is open and the call is retried
    /// once; a second failure is returned with the manager left idle.
    pub fn begin_or_recover(
        &mut self,
        expected_size: u32,
        expected_digest: ImageDigest,
    ) -> Result<(), UpdateError> {
        match self.begin(expected_size, expected_digest) {
            Ok(()) => Ok(()),
            Err(UpdateError::InvalidParam(reason)) => Err(UpdateError::InvalidParam(reason)),
            Err(first) => {
                warn!("Update start failed ({}), aborting stale session and retrying", first);
                self.abort();
                self.begin(expected_size, expected_digest).inspect_err(|e| {
                    error!("Update start failed after retry: {}", e);
                })
            }
        }
    }

    /// Append a chunk of the image
    pub fn write(&mut self, chunk: &[u8]) -> Result<Progress, UpdateError> {
        let session = match &mut self.state {
            ManagerState::InProgress(session) if !session.verified => session,
            _ => return Err(UpdateError::NotAllowed),
        };

        let expected = u64::from(session.expected_size);
        let received = session.bytes_written + chunk.len() as u64;
        if received > expected {
            error!(expected, received, "Firmware image overruns announced size");
            self.abort();
            return Err(UpdateError::SizeOverrun { expected, received });
        }

        if let Err(e) = self.storage.append(chunk) {
            error!("Storage write failed: {}", e);
            self.abort();
            return Err(e.into());
        }

        session.hasher.update(chunk);
        session.bytes_written = received;
        debug!(received, expected, "Chunk written");

        if received < expected {
            return Ok(Progress::InProgress);
        }

        let actual: ImageDigest = session.hasher.finalize_reset().into();
        if actual != session.expected_digest {
            let expected = hex::encode(session.expected_digest);
            let actual = hex::encode(actual);
            error!(%expected, %actual, "Firmware digest mismatch");
            self.abort();
            return Err(UpdateError::DigestMismatch { expected, actual });
        }

        session.verified = true;
        info!(size = received, "Firmware image verified");
        Ok(Progress::Verified)
    }

    /// Close the session. A healthy, verified image becomes the next boot
    /// target; anything else is discarded and the boot target is untouched.
    pub fn commit(&mut self, healthy: bool) -> Result<(), UpdateError> {
        // The session (and its digest context) is released whatever happens
        let state = mem::replace(&mut self.state, ManagerState::Idle);

        if !healthy {
            warn!("Discarding firmware update");
            self.storage.abort();
            return Err(UpdateError::Unhealthy);
        }

        let verified = matches!(state, ManagerState::InProgress(ref s) if s.verified);
        if !verified {
            self.storage.abort();
            return Err(UpdateError::NotAllowed);
        }

        if let Err(e) = self.storage.finalize() {
            error!("Failed to finalize update: {}", e);
            self.storage.abort();
            return Err(e.into());
        }

        if let Err(e) = self.storage.set_boot_target() {
            error!("Failed to set boot target: {}", e);
            self.storage.abort();
            return Err(e.into());
        }

        info!("Firmware update committed, new image boots next");
        Ok(())
    }

    /// Drop any in-flight session
    pub fn abort(&mut self) {
        if let ManagerState::InProgress(session) = mem::replace(&mut self.state, ManagerState::Idle) {
            warn!(
                written = session.bytes_written,
                expected = session.expected_size,
                "Aborting firmware update"
            );
            self.storage.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::{ErrorCode, StorageError};
    use crate::engine::storage::memory::{Faults, MemoryStorage};
    use crate::engine::storage::{BootOutcome, PartitionStore, Slot};

    fn digest(data: &[u8]) -> ImageDigest {
        Sha256::digest(data).into()
    }

    fn manager() -> (UpdateManager<MemoryStorage>, MemoryStorage) {
        let storage = MemoryStorage::new();
        (UpdateManager::new(storage.clone()), storage)
    }

    #[test]
    fn test_full_update() {
        let (mut manager, storage) = manager();
        let image = vec![0x5Au8; 100];

        manager.begin(100, digest(&image)).unwrap();
        assert_eq!(manager.write(&image[..40]).unwrap(), Progress::InProgress);
        assert_eq!(manager.bytes_written(), Some(40));
        assert_eq!(manager.write(&image[40..]).unwrap(), Progress::Verified);

        manager.commit(true).unwrap();
        assert!(!manager.is_in_progress());
        assert_eq!(storage.boot_image(), Some(image));
    }

    #[test]
    fn test_begin_twice_not_allowed() {
        let (mut manager, _) = manager();
        manager.begin(4, [0; 32]).unwrap();
        assert!(matches!(manager.begin(4, [0; 32]), Err(UpdateError::NotAllowed)));
        assert!(manager.is_in_progress());
    }

    #[test]
    fn test_zero_size_rejected() {
        let (mut manager, storage) = manager();
        let err = manager.begin(0, [0; 32]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        assert_eq!(storage.state().begin_calls, 0);
    }

    #[test]
    fn test_write_without_begin() {
        let (mut manager, _) = manager();
        assert!(matches!(manager.write(b"data"), Err(UpdateError::NotAllowed)));
    }

    #[test]
    fn test_overrun_fails_on_crossing_chunk() {
        let (mut manager, storage) = manager();
        manager.begin(10, [0; 32]).unwrap();
        assert_eq!(manager.write(&[1; 6]).unwrap(), Progress::InProgress);

        let err = manager.write(&[1; 5]).unwrap_err();
        assert!(matches!(err, UpdateError::SizeOverrun { expected: 10, received: 11 }));
        assert!(!manager.is_in_progress());
        assert!(!storage.has_open_region());
    }

    #[test]
    fn test_digest_mismatch() {
        let (mut manager, storage) = manager();
        manager.begin(4, digest(b"good")).unwrap();
        let err = manager.write(b"evil").unwrap_err();
        assert!(matches!(err, UpdateError::DigestMismatch { .. }));
        assert_eq!(err.code(), ErrorCode::Fail);
        assert!(!manager.is_in_progress());
        assert!(storage.boot_image().is_none());
    }

    #[test]
    fn test_storage_write_failure_aborts() {
        let storage = MemoryStorage::with_faults(Faults {
            fail_append_after: Some(8),
            ..Faults::default()
        });
        let mut manager = UpdateManager::new(storage.clone());

        manager.begin(16, [0; 32]).unwrap();
        manager.write(&[0; 8]).unwrap();
        let err = manager.write(&[0; 8]).unwrap_err();
        assert!(matches!(err, UpdateError::Storage(StorageError::Injected("append"))));
        assert!(!manager.is_in_progress());
        assert!(matches!(manager.write(&[0; 1]), Err(UpdateError::NotAllowed)));
    }

    #[test]
    fn test_commit_unhealthy_keeps_boot_target() {
        let (mut manager, storage) = manager();
        manager.begin(2, digest(b"ok")).unwrap();
        manager.write(b"ok").unwrap();

        assert!(matches!(manager.commit(false), Err(UpdateError::Unhealthy)));
        assert!(storage.boot_image().is_none());
        assert!(!manager.is_in_progress());
    }

    #[test]
    fn test_commit_requires_verified_image() {
        let (mut manager, storage) = manager();
        manager.begin(4, [0; 32]).unwrap();
        manager.write(b"ab").unwrap();

        assert!(matches!(manager.commit(true), Err(UpdateError::NotAllowed)));
        assert!(storage.boot_image().is_none());
        assert!(!manager.is_in_progress());
    }

    #[test]
    fn test_finalize_failure_not_bootable() {
        let storage = MemoryStorage::with_faults(Faults {
            fail_finalize: true,
            ..Faults::default()
        });
        let mut manager = UpdateManager::new(storage.clone());
        manager.begin(2, digest(b"ok")).unwrap();
        manager.write(b"ok").unwrap();

        assert!(matches!(manager.commit(true), Err(UpdateError::Storage(_))));
        assert!(storage.boot_image().is_none());
        assert!(storage.state().finalized.is_none());
    }

    #[test]
    fn test_set_boot_target_failure() {
        let storage = MemoryStorage::with_faults(Faults {
            fail_set_boot_target: true,
            ..Faults::default()
        });
        let mut manager = UpdateManager::new(storage.clone());
        manager.begin(2, digest(b"ok")).unwrap();
        manager.write(b"ok").unwrap();

        let err = manager.commit(true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Fail);
        assert!(storage.boot_image().is_none());
        assert!(!manager.is_in_progress());
    }

    #[test]
    fn test_recover_from_stale_session() {
        let (mut manager, storage) = manager();
        manager.begin(8, [0; 32]).unwrap();
        manager.write(&[0; 3]).unwrap();

        let image = b"fresh!!!";
        manager.begin_or_recover(8, digest(image)).unwrap();
        assert_eq!(manager.bytes_written(), Some(0));
        assert_eq!(storage.state().begin_calls, 2);
        assert_eq!(storage.state().abort_calls, 1);

        assert_eq!(manager.write(image).unwrap(), Progress::Verified);
    }

    #[test]
    fn test_recover_retries_once_then_fails_idle() {
        let storage = MemoryStorage::with_faults(Faults {
            fail_begin: true,
            ..Faults::default()
        });
        let mut manager = UpdateManager::new(storage.clone());

        let err = manager.begin_or_recover(8, [0; 32]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Fail);
        assert_eq!(storage.state().begin_calls, 2);
        assert!(!manager.is_in_progress());
    }

    #[test]
    fn test_chunking_invariance_of_mismatch() {
        let image: Vec<u8> = (0..=255u8).cycle().take(600).collect();
        let wrong = digest(b"not the image");

        for chunk_len in [1usize, 7, 64, 599, 600] {
            let (mut manager, _) = manager();
            manager.begin(600, wrong).unwrap();
            let mut outcome = None;
            for chunk in image.chunks(chunk_len) {
                match manager.write(chunk) {
                    Ok(Progress::InProgress) => continue,
                    other => {
                        outcome = Some(other);
                        break;
                    }
                }
            }
            assert!(
                matches!(outcome, Some(Err(UpdateError::DigestMismatch { .. }))),
                "chunk_len {chunk_len}"
            );
        }
    }

    fn partition_manager(dir: &std::path::Path) -> UpdateManager<PartitionStore> {
        let store = PartitionStore::new(dir.to_path_buf(), 1024);
        store.init().unwrap();
        UpdateManager::new(store)
    }

    fn push(manager: &mut UpdateManager<PartitionStore>, image: &[u8]) -> Result<(), UpdateError> {
        manager.begin(image.len() as u32, digest(image))?;
        manager.write(image)?;
        manager.commit(true)
    }

    #[test]
    fn test_partition_finalize_failure_not_bootable() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = partition_manager(dir.path());
        let reader = PartitionStore::new(dir.path().to_path_buf(), 1024);

        manager.begin(4, digest(b"data")).unwrap();
        manager.write(b"data").unwrap();
        std::fs::create_dir_all(reader.slot_path(Slot::B).join("blocker")).unwrap();

        let err = manager.commit(true).unwrap_err();
        assert!(matches!(err, UpdateError::Storage(_)));
        assert!(!reader.partial_path(Slot::B).exists());
        assert!(reader.record().unwrap().next_boot.is_none());
        assert_eq!(
            reader.resolve_boot().unwrap(),
            BootOutcome::Unchanged { slot: Slot::A }
        );
    }

    #[test]
    fn test_partition_set_boot_target_failure_not_bootable() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = partition_manager(dir.path());
        let reader = PartitionStore::new(dir.path().to_path_buf(), 1024);

        manager.begin(2, digest(b"ok")).unwrap();
        manager.write(b"ok").unwrap();
        let blocker = reader.record_path().with_extension("tmp");
        std::fs::create_dir(&blocker).unwrap();

        let err = manager.commit(true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Fail);
        assert!(!manager.is_in_progress());
        assert!(reader.record().unwrap().next_boot.is_none());

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(
            reader.resolve_boot().unwrap(),
            BootOutcome::Unchanged { slot: Slot::A }
        );
    }

    #[test]
    fn test_partition_rejected_update_before_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = partition_manager(dir.path());
        let reader = PartitionStore::new(dir.path().to_path_buf(), 1024);

        push(&mut manager, b"image-one").unwrap();
        assert_eq!(reader.record().unwrap().next_boot, Some(Slot::B));

        // A second image arrives before reboot and its commit fails
        manager.begin(9, digest(b"image-TWO")).unwrap();
        manager.write(b"image-TWO").unwrap();
        let blocker = reader.record_path().with_extension("tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(manager.commit(true).is_err());

        // The device must not boot the image it just reported as rejected
        let record = reader.record().unwrap();
        assert!(record.next_boot.is_none());
        assert!(record.image(Slot::B).is_none());

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(
            reader.resolve_boot().unwrap(),
            BootOutcome::Unchanged { slot: Slot::A }
        );
    }
}
