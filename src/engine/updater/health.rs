//! Health Check System
//!
//! Decides whether a freshly booted image is healthy enough to keep.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::engine::config::HealthConfig;

/// Health collaborator consulted once after reboot
pub trait HealthCheck {
    fn is_system_healthy(&self) -> bool;
}

/// Fixed answer, for tests and manual confirmation
#[derive(Debug, Clone, Copy)]
pub struct ConstantHealth(pub bool);

impl HealthCheck for ConstantHealth {
    fn is_system_healthy(&self) -> bool {
        self.0
    }
}

/// Health check result
#[derive(Debug, Clone, PartialEq)]
pub enum HealthResult {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

/// Runs the configured health command
pub struct HealthChecker {
    command: Option<String>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(&HealthConfig::default())
    }

    /// Run the health command; no command means healthy
    pub fn run(&self) -> HealthResult {
        let Some(command) = &self.command else {
            return HealthResult::Healthy;
        };

        let start = Instant::now();

        #[cfg(unix)]
        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        #[cfg(windows)]
        let result = Command::new("cmd")
            .arg("/C")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match result {
            Ok(child) => child,
            Err(e) => {
                return HealthResult::Unhealthy {
                    reason: format!("Failed to run health check: {}", e),
                }
            }
        };

        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return HealthResult::Healthy,
                Ok(Some(status)) => {
                    return HealthResult::Unhealthy {
                        reason: format!("Health check failed: {:?}", status.code()),
                    }
                }
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return HealthResult::Timeout;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return HealthResult::Unhealthy {
                        reason: format!("Wait error: {}", e),
                    }
                }
            }
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl HealthCheck for HealthChecker {
    fn is_system_healthy(&self) -> bool {
        match self.run() {
            HealthResult::Healthy => {
                info!("System health check passed");
                true
            }
            HealthResult::Unhealthy { reason } => {
                warn!(%reason, "System health check failed");
                false
            }
            HealthResult::Timeout => {
                warn!(timeout = ?self.timeout, "System health check timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(command: Option<&str>, timeout_secs: u64) -> HealthChecker {
        HealthChecker::new(&HealthConfig {
            command: command.map(str::to_string),
            timeout_secs,
        })
    }

    #[test]
    fn test_no_command_is_healthy() {
        assert_eq!(HealthChecker::with_defaults().run(), HealthResult::Healthy);
        assert!(HealthChecker::default().is_system_healthy());
    }

    #[test]
    fn test_constant_health() {
        assert!(ConstantHealth(true).is_system_healthy());
        assert!(!ConstantHealth(false).is_system_healthy());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_exit_status() {
        assert_eq!(checker(Some("exit 0"), 5).run(), HealthResult::Healthy);
        assert!(matches!(
            checker(Some("exit 3"), 5).run(),
            HealthResult::Unhealthy { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_timeout() {
        assert_eq!(checker(Some("sleep 5"), 0).run(), HealthResult::Timeout);
    }
}
