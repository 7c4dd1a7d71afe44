//! Post-boot rollback decision.

use tracing::{error, info, warn};

use super::health::HealthCheck;
use crate::engine::error::StorageError;
use crate::engine::storage::{BootControl, BootPartitionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackDecision {
    /// Image was already confirmed, nothing to do
    AlreadyValid,
    /// Pending image confirmed, rollback cancelled
    Confirmed,
}

/// Resolve a `PendingVerify` image. An unhealthy image is marked invalid
/// and the device reboots into the previous one; that path never returns.
pub fn check_rollback<B: BootControl>(
    boot: &mut B,
    is_healthy: bool,
) -> Result<RollbackDecision, StorageError> {
    let state = boot.boot_state().inspect_err(|e| {
        error!("Could not read partition state: {}", e);
    })?;

    if state != BootPartitionState::PendingVerify {
        info!(?state, "Firmware already validated");
        return Ok(RollbackDecision::AlreadyValid);
    }

    info!("Firmware verification pending");
    if !is_healthy {
        reject_and_reboot(boot);
    }

    match boot.mark_valid() {
        Ok(()) => {
            info!("Firmware marked valid, rollback cancelled");
            Ok(RollbackDecision::Confirmed)
        }
        Err(e) => {
            error!("Failed to mark firmware valid: {}", e);
            reject_and_reboot(boot)
        }
    }
}

/// Query `health` only when a decision is actually pending
pub fn check_rollback_with<B: BootControl, H: HealthCheck + ?Sized>(
    boot: &mut B,
    health: &H,
) -> Result<RollbackDecision, StorageError> {
    if boot.boot_state()? != BootPartitionState::PendingVerify {
        return check_rollback(boot, true);
    }
    let healthy = health.is_system_healthy();
    check_rollback(boot, healthy)
}

fn reject_and_reboot<B: BootControl>(boot: &mut B) -> ! {
    warn!("Firmware unhealthy, rolling back to previous image");
    if let Err(e) = boot.mark_invalid() {
        error!("Failed to mark firmware invalid: {}", e);
    }
    boot.reboot()
}
