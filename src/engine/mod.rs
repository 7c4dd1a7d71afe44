// Secure OTA Engine - Core module structure
pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;
pub mod updater;

pub use auth::Authenticator;
pub use config::Config;
pub use session::SessionCoordinator;
pub use transport::DeviceServer;
pub use updater::UpdateManager;
