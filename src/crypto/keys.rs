//! Master key resolution from environment, key file, or an interactive prompt

use super::{KeyError, MasterKey};
use secrecy::{ExposeSecret, SecretString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Environment variable holding the encoded master key
pub const MASTER_KEY_ENV: &str = "PROXMOX_MCP_MASTER_KEY";

/// Environment variable pointing at a key file
pub const MASTER_KEY_FILE_ENV: &str = "PROXMOX_MCP_MASTER_KEY_FILE";

/// File name of the default key file in the home directory
pub const DEFAULT_KEY_FILE_NAME: &str = ".proxmox_mcp_key";

/// Default bound on file and interactive key resolution
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_secs(5);

/// A single place a master key can come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Named environment variable
    Env(String),
    /// Key file on disk
    File(PathBuf),
    /// Prompt on the controlling terminal
    Interactive,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Env(name) => write!(f, "environment variable {}", name),
            KeySource::File(path) => write!(f, "key file {}", path.display()),
            KeySource::Interactive => write!(f, "interactive prompt"),
        }
    }
}

/// Which key sources are enabled, in precedence order env, file, interactive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySourceConfig {
    /// Environment variable to read
    pub env_var: Option<String>,
    /// Key file to read
    pub key_file: Option<PathBuf>,
    /// Whether to prompt when no other source yields a key
    pub interactive: bool,
    /// Upper bound for file and interactive resolution
    pub timeout: Duration,
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self {
            env_var: Some(MASTER_KEY_ENV.to_string()),
            key_file: Some(Self::default_key_file()),
            interactive: false,
            timeout: DEFAULT_KEY_TIMEOUT,
        }
    }
}

impl KeySourceConfig {
    /// Only the given environment variable
    pub fn env(name: impl Into<String>) -> Self {
        Self {
            env_var: Some(name.into()),
            key_file: None,
            interactive: false,
            timeout: DEFAULT_KEY_TIMEOUT,
        }
    }

    /// Only the given key file
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            env_var: None,
            key_file: Some(path.into()),
            interactive: false,
            timeout: DEFAULT_KEY_TIMEOUT,
        }
    }

    /// Only an interactive prompt
    pub fn interactive() -> Self {
        Self {
            env_var: None,
            key_file: None,
            interactive: true,
            timeout: DEFAULT_KEY_TIMEOUT,
        }
    }

    /// Override the resolution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default key file: `$PROXMOX_MCP_MASTER_KEY_FILE`, else `~/.proxmox_mcp_key`
    pub fn default_key_file() -> PathBuf {
        if let Ok(path) = std::env::var(MASTER_KEY_FILE_ENV) {
            return crate::config::expand_home(&path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_KEY_FILE_NAME)
    }

    /// Enabled sources in precedence order
    pub fn sources(&self) -> Vec<KeySource> {
        let mut sources = Vec::with_capacity(3);
        if let Some(name) = &self.env_var {
            sources.push(KeySource::Env(name.clone()));
        }
        if let Some(path) = &self.key_file {
            sources.push(KeySource::File(path.clone()));
        }
        if self.interactive {
            sources.push(KeySource::Interactive);
        }
        sources
    }
}

/// Resolves a [`MasterKey`] from the enabled sources.
///
/// A source that is absent (unset variable, missing file) passes to the next
/// one. A source that is present but malformed stops resolution with
/// [`KeyError::Format`]; there is never a fallback to a weaker key.
#[derive(Debug, Clone, Default)]
pub struct KeyProvider {
    config: KeySourceConfig,
}

impl KeyProvider {
    pub fn new(config: KeySourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KeySourceConfig {
        &self.config
    }

    /// Resolve the master key
    pub async fn resolve_key(&self) -> Result<MasterKey, KeyError> {
        let sources = self.config.sources();
        if sources.is_empty() {
            return Err(KeyError::Unavailable(
                "no master key source is enabled".to_string(),
            ));
        }

        for source in &sources {
            if let Some(encoded) = self.read_source(source).await? {
                debug!(source = %source, "Resolved master key");
                return MasterKey::from_encoded(encoded.expose_secret())
                    .map_err(|e| e.in_source(source));
            }
            debug!(source = %source, "Master key source yielded nothing");
        }

        let tried = sources
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(KeyError::Unavailable(format!("tried {}", tried)))
    }

    async fn read_source(&self, source: &KeySource) -> Result<Option<SecretString>, KeyError> {
        match source {
            KeySource::Env(name) => Ok(read_env(name)),
            KeySource::File(path) => read_key_file(path, self.config.timeout).await,
            KeySource::Interactive => prompt_for_key(self.config.timeout).await.map(Some),
        }
    }
}

fn read_env(name: &str) -> Option<SecretString> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(SecretString::from(value)),
        _ => None,
    }
}

async fn read_key_file(path: &Path, timeout: Duration) -> Result<Option<SecretString>, KeyError> {
    let owned = path.to_path_buf();
    let read = run_detached(timeout, move || std::fs::read_to_string(owned))
        .await
        .map_err(|e| match e {
            Detached::TimedOut => KeyError::Unavailable(format!(
                "timed out after {:?} reading key file {}",
                timeout,
                path.display()
            )),
            Detached::Failed(reason) => KeyError::Unavailable(format!(
                "cannot read key file {}: {}",
                path.display(),
                reason
            )),
        })?;

    match read {
        Ok(content) => {
            warn_if_shared(path).await;
            Ok(Some(SecretString::from(content)))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(KeyError::Unavailable(format!(
            "cannot read key file {}: {}",
            path.display(),
            e
        ))),
    }
}

enum Detached {
    TimedOut,
    Failed(String),
}

/// Run blocking `work` on its own thread and wait at most `timeout` for it.
///
/// The thread is never joined: a read stuck on a FIFO or a terminal is left
/// behind instead of holding up runtime shutdown.
async fn run_detached<T, F>(timeout: Duration, work: F) -> Result<T, Detached>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("master-key-reader".to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|e| Detached::Failed(e.to_string()))?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(Detached::Failed("reader thread exited".to_string())),
        Err(_) => Err(Detached::TimedOut),
    }
}

#[cfg(unix)]
async fn warn_if_shared(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = fs::metadata(path).await {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{:o}", mode & 0o777),
                "Master key file is readable by other users; run chmod 600"
            );
        }
    }
}

#[cfg(not(unix))]
async fn warn_if_shared(_path: &Path) {}

async fn prompt_for_key(timeout: Duration) -> Result<SecretString, KeyError> {
    let prompt = run_detached(timeout, || -> io::Result<String> {
        eprint!("Enter master key: ");
        io::stderr().flush()?;
        rpassword::read_password()
    });

    let entered = prompt
        .await
        .map_err(|e| match e {
            Detached::TimedOut => {
                KeyError::Unavailable(format!("no master key entered within {:?}", timeout))
            }
            Detached::Failed(reason) => KeyError::Unavailable(format!("key prompt failed: {}", reason)),
        })?
        .map_err(|e| KeyError::Unavailable(format!("key prompt failed: {}", e)))?;

    if entered.trim().is_empty() {
        return Err(KeyError::Unavailable("empty master key entered".to_string()));
    }
    Ok(SecretString::from(entered))
}

/// Write a key file readable only by its owner.
///
/// Refuses to replace an existing file unless `overwrite` is set.
pub async fn write_key_file(path: &Path, key: &MasterKey, overwrite: bool) -> Result<(), KeyError> {
    if !overwrite && fs::try_exists(path).await.unwrap_or(false) {
        return Err(KeyError::Unavailable(format!(
            "key file {} already exists; refusing to overwrite",
            path.display()
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| KeyError::Unavailable(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let encoded = key.encode();
    crate::storage::write_private(path, encoded.expose_secret().as_bytes())
        .await
        .map_err(|e| KeyError::Unavailable(format!("cannot write key file {}: {}", path.display(), e)))
}
