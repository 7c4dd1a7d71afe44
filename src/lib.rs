//! Secure OTA - authenticated, digest-verified firmware updates
//!
//! A device accepts an image from an authenticated peer, writes it to the
//! inactive slot while hashing it, and only selects it as the next boot
//! target once size and SHA-256 match. After reboot the image stays
//! `PendingVerify` until a health check confirms it; otherwise the device
//! rolls back to the previous slot.

pub mod engine;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
