//! proxmox-mcp - credential handling for the Proxmox MCP server
//!
//! Loads the server's configuration with its Proxmox API token encrypted at
//! rest, and rotates that encryption to a new master key without ever
//! leaving an unreadable file on disk.

pub mod config;
pub mod crypto;
pub mod proxmox;
pub mod rotation;
pub mod storage;

use thiserror::Error;

pub use config::{load, ConfigLoader, ResolvedConfig};
pub use rotation::{rotate, RotationResult};

/// Core error types for proxmox-mcp
#[derive(Error, Debug)]
pub enum ProxmoxMcpError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("Master key error: {0}")]
    Key(#[from] crypto::KeyError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error(transparent)]
    Rotation(#[from] rotation::RotationError),

    #[error("Proxmox error: {0}")]
    Proxmox(#[from] proxmox::ProxmoxError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
