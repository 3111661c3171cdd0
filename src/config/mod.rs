//! Configuration system for proxmox-mcp
//!
//! Loads the JSON configuration document, validates it, and decrypts the
//! API token into an immutable [`ResolvedConfig`] for the server to consume.

mod encrypt;
mod types;

pub use encrypt::{default_encrypted_path, encrypt_config_file, encryption_status, EncryptionStatus};
pub use types::*;

use crate::crypto::{CryptoError, DecryptionError, KeyError, KeyProvider, KeySourceConfig};
use crate::storage::StorageError;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "PROXMOX_MCP_CONFIG";

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration path not provided; pass one or set {CONFIG_PATH_ENV}")]
    PathUnset,

    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Configuration could not be read: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Configuration could not be written: {0}")]
    WriteError(#[from] StorageError),

    #[error("Configuration could not be parsed: {0}")]
    ParseError(String),

    #[error("Configuration field `{field}` is invalid: {reason}")]
    SchemaValidation { field: String, reason: String },

    #[error("Configuration master key error: {0}")]
    Key(#[from] KeyError),

    #[error("Configuration field `{field}` could not be decrypted: {source}")]
    Decryption {
        field: String,
        source: DecryptionError,
    },

    #[error("Configuration field could not be encrypted: {0}")]
    Encryption(#[from] CryptoError),
}

impl ConfigError {
    pub(crate) fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::SchemaValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The fully decrypted configuration the server runs with.
///
/// Built once at startup by [`ConfigLoader::load`]. There are no setters.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    host: String,
    port: u16,
    service: String,
    user: String,
    token_name: String,
    token_value: SecretString,
    verify_ssl: bool,
    logging: LoggingConfig,
    token_was_encrypted: bool,
}

impl ResolvedConfig {
    fn new(document: RawConfigDocument, token_value: SecretString) -> Self {
        Self {
            host: document.host().to_string(),
            port: document.port(),
            service: document.service().to_string(),
            user: document.user().to_string(),
            token_name: document.token_name().to_string(),
            token_value,
            verify_ssl: document.verify_ssl(),
            logging: document.logging().clone(),
            token_was_encrypted: document.token_value().is_encrypted(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn token_name(&self) -> &str {
        &self.token_name
    }

    /// The decrypted API token secret
    pub fn token_value(&self) -> &SecretString {
        &self.token_value
    }

    pub fn verify_ssl(&self) -> bool {
        self.verify_ssl
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// Whether the token was stored encrypted on disk
    pub fn token_was_encrypted(&self) -> bool {
        self.token_was_encrypted
    }
}

/// Loads configuration documents, resolving the master key only when needed.
///
/// Key sources come from the loader override, else the document's
/// `master_key` section, else [`KeySourceConfig::default`].
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    key_sources: Option<KeySourceConfig>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use these key sources regardless of what the document declares
    pub fn with_key_sources(mut self, key_sources: KeySourceConfig) -> Self {
        self.key_sources = Some(key_sources);
        self
    }

    /// Load, validate and decrypt the configuration at `path`
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<ResolvedConfig, ConfigError> {
        let path = path.as_ref();
        let document = read_document(path).await?;

        let token = match document.token_value() {
            TokenValue::Plaintext(_) => {
                warn!(
                    path = %path.display(),
                    "API token is stored in plaintext; run `proxmox-mcp encrypt` to protect it"
                );
                document.token_value().reveal(None)?
            }
            TokenValue::Encrypted(_) => {
                let sources = self
                    .key_sources
                    .clone()
                    .or_else(|| document.key_sources().cloned())
                    .unwrap_or_default();
                let key = KeyProvider::new(sources).resolve_key().await?;
                document.token_value().reveal(Some(&key))?
            }
        };

        if !document.verify_ssl() {
            warn!(
                host = %document.host(),
                "TLS certificate verification is disabled by configuration"
            );
        }

        info!(
            path = %path.display(),
            host = %document.host(),
            encrypted = document.token_value().is_encrypted(),
            "Configuration loaded"
        );

        Ok(ResolvedConfig::new(document, token))
    }

    /// Load the configuration named by `explicit` or `$PROXMOX_MCP_CONFIG`
    pub async fn load_default(&self, explicit: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
        let path = resolve_config_path(explicit)?;
        self.load(path).await
    }
}

/// Load the configuration at `path` with default key sources
pub async fn load(path: impl AsRef<Path>) -> Result<ResolvedConfig, ConfigError> {
    ConfigLoader::new().load(path).await
}

/// Read and validate a document without decrypting anything
pub async fn read_document(path: &Path) -> Result<RawConfigDocument, ConfigError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).await?;
    RawConfigDocument::parse(&content)
}

/// The explicit path if given, else `$PROXMOX_MCP_CONFIG`
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => Ok(expand_home(&path)),
        _ => Err(ConfigError::PathUnset),
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
