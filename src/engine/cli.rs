//! OTA CLI Module
//! Command-line interface for the device daemon and the push tool

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config::default_device_dir;

#[derive(Parser, Debug)]
#[command(name = "ota-cli")]
#[command(author = "Secure OTA Team")]
#[command(version)]
#[command(about = "Authenticated firmware updates with A/B rollback", long_about = None)]
pub struct Cli {
    /// Device directory holding config, slots and boot record
    #[arg(short, long, global = true)]
    pub device_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a device directory with a fresh shared secret
    Init {
        /// Device name
        #[arg(short, long, default_value = "ota-device")]
        name: String,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the update server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Push a firmware image to a device
    Push {
        /// Firmware image file
        image: PathBuf,

        /// Device address
        #[arg(short, long, default_value = "127.0.0.1:2000")]
        addr: String,

        /// Shared secret as hex (defaults to the device config)
        #[arg(long)]
        secret: Option<String>,

        /// Bytes per chunk; must not exceed the device receive buffer
        #[arg(long, default_value = "1024")]
        chunk_len: usize,

        /// Give up after this many seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Print the update header for an image
    Header {
        /// Firmware image file
        image: PathBuf,
    },

    /// Show slot and boot state
    Status,

    /// Confirm or reject the image booted from a pending slot
    Confirm {
        /// Reject the pending image and roll back
        #[arg(long)]
        reject: bool,
    },
}

impl Cli {
    pub fn get_device_dir(&self) -> PathBuf {
        self.device_dir
            .clone()
            .or_else(default_device_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
