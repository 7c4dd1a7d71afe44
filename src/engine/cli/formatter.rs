//! CLI Output Formatting Module
//! Colorized terminal output for device and push commands

use colored::Colorize;

use crate::engine::protocol::{OtaAck, UpdateHeader};
use crate::engine::storage::{BootPartitionState, BootRecord, Slot};

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    pub fn update_header(header: &UpdateHeader) {
        Self::header("Update Header");
        Self::kv(
            "Size",
            &format!("{} ({})", header.firmware_size, format_size(u64::from(header.firmware_size))),
        );
        Self::kv("SHA-256", &hex::encode(header.expected_digest));
        Self::kv("Frame", &hex::encode(header.to_bytes()));
    }

    pub fn ota_ack(ack: &OtaAck) {
        let written = format_size(u64::from(ack.bytes_written));
        if ack.is_success() {
            Self::success(&format!("Device accepted the image ({} written)", written));
        } else {
            Self::error(&format!(
                "Device rejected the update after {} (status {})",
                written,
                ack.status.code()
            ));
        }
    }

    pub fn boot_record(record: &BootRecord) {
        Self::header("Boot Record");
        Self::kv("Active slot", &record.active.to_string());
        Self::kv("State", &state_label(record.state));
        Self::kv(
            "Next boot",
            &record
                .next_boot
                .map(|slot| slot.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        Self::kv(
            "Rollback slot",
            &record
                .previous
                .map(|slot| slot.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        Self::kv("Updated", &record.updated_at.to_rfc3339());

        for slot in [Slot::A, Slot::B] {
            let line = match record.image(slot) {
                Some(info) => format!(
                    "{}, written {}",
                    format_size(info.size),
                    info.written_at.format("%Y-%m-%d %H:%M:%S")
                ),
                None => "empty".bright_black().to_string(),
            };
            Self::kv(&format!("Slot {}", slot), &line);
        }
    }
}

fn state_label(state: BootPartitionState) -> String {
    match state {
        BootPartitionState::Valid => "valid".green().to_string(),
        BootPartitionState::PendingVerify => "pending verify".yellow().to_string(),
        BootPartitionState::Invalid => "invalid".red().to_string(),
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(4 * 1024 * 1024), "4.00 MB");
    }
}
