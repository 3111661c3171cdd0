//! Interface to the Proxmox VE API consumed by the MCP tool layer
//!
//! Only the seam lives here: the connection settings derived from a
//! [`ResolvedConfig`] and the [`ProxmoxApi`] trait the tools call.

use crate::config::ResolvedConfig;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the Proxmox API
#[derive(Error, Debug)]
pub enum ProxmoxError {
    #[error("Proxmox API request failed: {0}")]
    Request(String),

    #[error("Proxmox API returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Proxmox object not found: {0}")]
    NotFound(String),

    #[error("Guest agent error: {0}")]
    GuestAgent(String),
}

/// A cluster node as listed by `/nodes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node: String,
    pub status: String,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// A QEMU guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub cpus: Option<u32>,
}

/// Result of a command run through the QEMU guest agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the MCP tools perform against a Proxmox cluster
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>, ProxmoxError>;

    async fn get_vm(&self, node: &str, vmid: u32) -> Result<VmSummary, ProxmoxError>;

    /// Run `command` inside the guest via the QEMU guest agent
    async fn exec_guest_command(
        &self,
        node: &str,
        vmid: u32,
        command: &str,
    ) -> Result<CommandOutput, ProxmoxError>;
}

/// Everything an HTTP client needs to talk to the API
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub base_url: String,
    pub verify_tls: bool,
    pub service: String,
    authorization: SecretString,
}

impl ConnectionSettings {
    pub fn from_resolved(config: &ResolvedConfig) -> Self {
        let authorization = format!(
            "PVEAPIToken={}!{}={}",
            config.user(),
            config.token_name(),
            config.token_value().expose_secret()
        );

        Self {
            base_url: format!("https://{}:{}/api2/json", config.host(), config.port()),
            verify_tls: config.verify_ssl(),
            service: config.service().to_string(),
            authorization: SecretString::from(authorization),
        }
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> &SecretString {
        &self.authorization
    }
}
