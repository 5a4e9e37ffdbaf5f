//! Relaygate Common Library
//!
//! Credential vault, persistence and connection tokens shared by the
//! terminal bridge and the desktop broker.

pub mod clock;
pub mod crypto;
pub mod db;
pub mod error;
pub mod tokens;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::Vault;
pub use db::Database;
pub use error::{Error, Result};
pub use tokens::TokenBroker;
pub use types::*;

/// Relaygate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".relaygate")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
