//! Secure OTA Bootstrapper
//!
//! Runs once per device start, before the update server:
//! 1. Apply a pending slot switch or a requested rollback
//! 2. Run the health check for an image that is still `PendingVerify`
//! 3. Confirm it, or mark it invalid and exit with the reboot status
//! 4. Hand over to `ota-cli serve`
//!
//! Usage: `ota-bootstrap [DEVICE_DIR] [--no-serve]`

use std::env;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

use secure_ota::engine::config::{default_device_dir, Config};
use secure_ota::engine::storage::{BootOutcome, PartitionStore};
use secure_ota::engine::updater::{check_rollback_with, HealthChecker, RollbackDecision};
use tracing::{error, info, warn};

struct Args {
    device_dir: PathBuf,
    serve: bool,
}

fn parse_args() -> Option<Args> {
    let mut device_dir = None;
    let mut serve = true;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--no-serve" => serve = false,
            _ => device_dir = Some(PathBuf::from(arg)),
        }
    }
    Some(Args {
        device_dir: device_dir.or_else(default_device_dir)?,
        serve,
    })
}

fn main() -> ExitCode {
    let Some(args) = parse_args() else {
        eprintln!("Error: Could not determine device directory");
        return ExitCode::FAILURE;
    };

    let config = match Config::load(&args.device_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run `ota-cli init` first.");
            return ExitCode::FAILURE;
        }
    };
    secure_ota::init_tracing(&config.device.log_filter);

    let mut store = PartitionStore::new(args.device_dir.clone(), config.storage.slot_capacity);
    let outcome = store.init().and_then(|()| store.resolve_boot());
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Could not resolve boot slot: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let slot = match outcome {
        BootOutcome::Unchanged { slot } => slot,
        BootOutcome::Switched { to, .. } | BootOutcome::RolledBack { to, .. } => to,
    };
    info!(version = env!("CARGO_PKG_VERSION"), device = %config.device.name, %slot, "whoami");

    // Unhealthy images never return from here: the process exits for a reboot
    let health = HealthChecker::new(&config.health);
    match check_rollback_with(&mut store, &health) {
        Ok(RollbackDecision::Confirmed) => info!(%slot, "New image confirmed"),
        Ok(RollbackDecision::AlreadyValid) => {}
        Err(e) => {
            error!("Rollback check failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if !args.serve {
        return ExitCode::SUCCESS;
    }
    launch_daemon(&args.device_dir)
}

fn launch_daemon(device_dir: &std::path::Path) -> ExitCode {
    let daemon = match env::current_exe() {
        Ok(exe) => exe.with_file_name(if cfg!(windows) { "ota-cli.exe" } else { "ota-cli" }),
        Err(e) => {
            error!("Could not locate own executable: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !daemon.exists() {
        warn!(path = %daemon.display(), "Update server binary not found");
        return ExitCode::FAILURE;
    }

    let mut command = Command::new(&daemon);
    command.arg("--device-dir").arg(device_dir).arg("serve");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = command.exec();
        error!("Failed to exec {}: {}", daemon.display(), err);
        ExitCode::FAILURE
    }

    #[cfg(not(unix))]
    {
        match command.status() {
            Ok(status) if status.success() => ExitCode::SUCCESS,
            Ok(status) => ExitCode::from(status.code().unwrap_or(1) as u8),
            Err(e) => {
                error!("Failed to launch {}: {}", daemon.display(), e);
                ExitCode::FAILURE
            }
        }
    }
}
