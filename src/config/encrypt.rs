//! Migrating plaintext-token configurations to encrypted ones

use super::{read_document, ConfigError, TokenValue};
use crate::crypto::{encrypt_field, EncryptedField, MasterKey};
use crate::storage::write_private;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Whether a configuration's token is stored encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionStatus {
    Encrypted,
    Plaintext,
    /// The document has no `token_value`
    Missing,
}

impl std::fmt::Display for EncryptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionStatus::Encrypted => write!(f, "encrypted"),
            EncryptionStatus::Plaintext => write!(f, "plaintext"),
            EncryptionStatus::Missing => write!(f, "missing"),
        }
    }
}

/// Report the token's storage form without decrypting or fully validating
pub async fn encryption_status(path: &Path) -> Result<EncryptionStatus, ConfigError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).await?;
    let value: Value =
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let status = match value.get("token_value") {
        None | Some(Value::Null) => EncryptionStatus::Missing,
        Some(token) if EncryptedField::is_envelope(token) => EncryptionStatus::Encrypted,
        Some(_) => EncryptionStatus::Plaintext,
    };
    Ok(status)
}

/// `<stem>.encrypted.json` beside `path`
pub fn default_encrypted_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    path.with_file_name(format!("{}.encrypted.json", stem))
}

/// Write an encrypted copy of the configuration at `path`.
///
/// The output defaults to [`default_encrypted_path`] and is readable only by
/// the owner. An already encrypted token is carried over unchanged.
pub async fn encrypt_config_file(
    path: &Path,
    output: Option<&Path>,
    key: &MasterKey,
) -> Result<PathBuf, ConfigError> {
    let document = read_document(path).await?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_encrypted_path(path));

    let document = match document.token_value() {
        TokenValue::Encrypted(_) => {
            info!(path = %path.display(), "Token already encrypted; copying unchanged");
            document
        }
        TokenValue::Plaintext(token) => {
            let field = encrypt_field(token.expose_secret(), key)?;
            let encrypted = TokenValue::Encrypted(field);

            // the new envelope must open before anything is written
            let reopened = encrypted.reveal(Some(key))?;
            if reopened.expose_secret() != token.expose_secret() {
                return Err(ConfigError::schema(
                    "token_value",
                    "encrypted value did not decrypt to the original",
                ));
            }

            document.with_token_value(encrypted)?
        }
    };

    write_private(&output, document.to_json_pretty()?.as_bytes()).await?;

    info!(
        source = %path.display(),
        output = %output.display(),
        "Configuration encrypted"
    );

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, RawConfigDocument};
    use crate::crypto::KeySourceConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn plaintext_config(dir: &Path) -> PathBuf {
        let path = dir.join("config.json");
        let value = json!({
            "host": "pve.example.com",
            "user": "mcp@pve",
            "token_name": "mcp",
            "token_value": "plain-token",
            "verify_ssl": true
        });
        std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_default_encrypted_path() {
        assert_eq!(
            default_encrypted_path(Path::new("/etc/pmcp/config.json")),
            PathBuf::from("/etc/pmcp/config.encrypted.json")
        );
    }

    #[tokio::test]
    async fn test_encrypt_then_load() {
        let dir = tempdir().unwrap();
        let path = plaintext_config(dir.path());
        let key = MasterKey::generate();

        let output = encrypt_config_file(&path, None, &key).await.unwrap();
        assert_eq!(output, dir.path().join("config.encrypted.json"));
        assert_eq!(encryption_status(&path).await.unwrap(), EncryptionStatus::Plaintext);
        assert_eq!(encryption_status(&output).await.unwrap(), EncryptionStatus::Encrypted);

        let written = std::fs::read_to_string(&output).unwrap();
        assert!(!written.contains("plain-token"));

        let source = RawConfigDocument::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let encrypted = RawConfigDocument::parse(&written).unwrap();
        assert!(source.same_settings_as(&encrypted));

        let key_path = dir.path().join("key");
        std::fs::write(&key_path, key.encode().expose_secret()).unwrap();
        let config = ConfigLoader::new()
            .with_key_sources(KeySourceConfig::file(key_path))
            .load(&output)
            .await
            .unwrap();
        assert_eq!(config.token_value().expose_secret(), "plain-token");
    }

    #[tokio::test]
    async fn test_already_encrypted_is_unchanged() {
        let dir = tempdir().unwrap();
        let path = plaintext_config(dir.path());
        let key = MasterKey::generate();

        let first = encrypt_config_file(&path, None, &key).await.unwrap();
        let second = dir.path().join("again.json");
        encrypt_config_file(&first, Some(&second), &key).await.unwrap();

        let a: Value = serde_json::from_str(&std::fs::read_to_string(&first).unwrap()).unwrap();
        let b: Value = serde_json::from_str(&std::fs::read_to_string(&second).unwrap()).unwrap();
        assert_eq!(a["token_value"], b["token_value"]);
    }

    #[tokio::test]
    async fn test_status_missing_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"host": "pve"}"#).unwrap();

        assert_eq!(encryption_status(&path).await.unwrap(), EncryptionStatus::Missing);
    }
}
