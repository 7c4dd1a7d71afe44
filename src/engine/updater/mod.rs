//! Secure OTA Update System
//!
//! A digest-verified, rollback-safe firmware update pipeline.
//!
//! Components:
//! - `manager` - Write/verify/commit lifecycle of one image
//! - `rollback` - Post-boot confirmation or rollback
//! - `health` - Startup health checks

pub mod health;
pub mod manager;
pub mod rollback;

pub use health::{ConstantHealth, HealthCheck, HealthChecker};
pub use manager::{ImageDigest, Progress, UpdateManager, DIGEST_LEN};
pub use rollback::{check_rollback, check_rollback_with, RollbackDecision};
