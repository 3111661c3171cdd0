//! Master key rotation
//!
//! Re-encrypts every encrypted field of a configuration document under a new
//! master key. Each plan walks a fixed sequence of stages:
//!
//! ```text
//! START -> LOADED_WITH_OLD_KEY -> REENCRYPTED_WITH_NEW_KEY -> VERIFIED -> COMMITTED
//! ```
//!
//! Any failure ends the plan in `FAILED`. The source file is only ever
//! replaced by an atomic rename in the last stage, so until then it still
//! opens with the old key and afterwards it opens with the new one. Nothing
//! is retried automatically.

mod lock;

pub use lock::{lock_path_for, LockError, RotationLock};

use crate::config::{ConfigError, RawConfigDocument};
use crate::crypto::{
    decrypt_field, encrypt_field, CryptoError, DecryptionError, KeyError, KeyProvider,
    KeySourceConfig, MasterKey,
};
use crate::storage::{
    backup_path_for, create_backup, is_backup_path, remove_stale_staged, StagedFile, StorageError,
};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::fs::Permissions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

/// Stage of a rotation plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Start,
    LoadedWithOldKey,
    ReencryptedWithNewKey,
    Verified,
    Committed,
    Failed,
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationState::Start => "START",
            RotationState::LoadedWithOldKey => "LOADED_WITH_OLD_KEY",
            RotationState::ReencryptedWithNewKey => "REENCRYPTED_WITH_NEW_KEY",
            RotationState::Verified => "VERIFIED",
            RotationState::Committed => "COMMITTED",
            RotationState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What went wrong during a rotation step
#[derive(Error, Debug)]
pub enum RotationFailure {
    #[error("another rotation holds the lock {0}")]
    Locked(PathBuf),

    #[error("old and new master keys are identical")]
    SameKey,

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("field `{field}`: {source}")]
    Decryption {
        field: String,
        source: DecryptionError,
    },

    #[error(transparent)]
    Encryption(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("staged file failed verification: {0}")]
    VerificationMismatch(String),

    #[error("source file was modified while the rotation was running")]
    SourceModified,

    #[error("cannot search for configuration files: {0}")]
    Discovery(String),
}

/// A failed rotation and the stage it failed in
#[derive(Error, Debug)]
#[error("Key rotation failed in state {state}: {reason}")]
pub struct RotationError {
    pub state: RotationState,
    #[source]
    pub reason: RotationFailure,
}

impl RotationError {
    fn new(state: RotationState, reason: impl Into<RotationFailure>) -> Self {
        Self {
            state,
            reason: reason.into(),
        }
    }
}

/// Outcome of one rotation plan
#[derive(Debug)]
pub struct RotationResult {
    pub success: bool,
    /// Pre-rotation copy, kept until [`confirm_rotation`]
    pub backup_path: Option<PathBuf>,
    /// Fields that were re-encrypted
    pub rotated_fields: Vec<String>,
    pub error: Option<RotationError>,
}

impl RotationResult {
    fn committed(backup_path: PathBuf, rotated_fields: Vec<String>) -> Self {
        Self {
            success: true,
            backup_path: Some(backup_path),
            rotated_fields,
            error: None,
        }
    }

    fn nothing_to_rotate() -> Self {
        Self {
            success: true,
            backup_path: None,
            rotated_fields: Vec::new(),
            error: None,
        }
    }

    fn failed(error: RotationError) -> Self {
        Self {
            success: false,
            backup_path: None,
            rotated_fields: Vec::new(),
            error: Some(error),
        }
    }
}

/// One configuration file to rotate and where its keys come from
#[derive(Debug, Clone)]
pub struct RotationPlan {
    pub source_path: PathBuf,
    pub old_key: KeySourceConfig,
    pub new_key: KeySourceConfig,
    pub backup_path: PathBuf,
}

impl RotationPlan {
    pub fn new(
        source_path: impl Into<PathBuf>,
        old_key: KeySourceConfig,
        new_key: KeySourceConfig,
    ) -> Self {
        let source_path = source_path.into();
        let backup_path = backup_path_for(&source_path);
        Self {
            source_path,
            old_key,
            new_key,
            backup_path,
        }
    }

    pub fn with_backup_path(mut self, backup_path: impl Into<PathBuf>) -> Self {
        self.backup_path = backup_path.into();
        self
    }

    /// Resolve both keys, then rotate
    pub async fn execute(&self) -> RotationResult {
        let keys = match resolve_keys(&self.old_key, &self.new_key).await {
            Ok(keys) => keys,
            Err(e) => return fail(&self.source_path, e),
        };
        run_with_keys(self, &keys.0, &keys.1).await
    }
}

/// Rotate the configuration at `path` from the old key to the new key
pub async fn rotate(
    path: impl Into<PathBuf>,
    old_key: KeySourceConfig,
    new_key: KeySourceConfig,
) -> RotationResult {
    RotationPlan::new(path, old_key, new_key).execute().await
}

/// Rotate a plan with keys already in hand
pub async fn run_with_keys(plan: &RotationPlan, old: &MasterKey, new: &MasterKey) -> RotationResult {
    info!(
        path = %plan.source_path.display(),
        backup = %plan.backup_path.display(),
        "Starting key rotation"
    );

    match drive(plan, old, new).await {
        Ok(result) => result,
        Err(e) => fail(&plan.source_path, e),
    }
}

/// Rotate every configuration file under `dir`, resolving keys once.
///
/// `config.example*` files are skipped. Each file is its own plan; one
/// failure does not stop the others.
pub async fn rotate_all(
    dir: &Path,
    old_key: &KeySourceConfig,
    new_key: &KeySourceConfig,
) -> Result<Vec<(PathBuf, RotationResult)>, RotationError> {
    let (old, new) = resolve_keys(old_key, new_key).await?;
    let files = discover_configs(dir)?;

    info!(dir = %dir.display(), files = files.len(), "Rotating configuration directory");

    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let plan = RotationPlan::new(&path, old_key.clone(), new_key.clone());
        let result = run_with_keys(&plan, &old, &new).await;
        results.push((path, result));
    }
    Ok(results)
}

/// Delete the backup once the new key has been confirmed to work.
///
/// Only files named like [`backup_path_for`] output are removed.
pub async fn confirm_rotation(backup_path: &Path) -> Result<(), StorageError> {
    let is_file = fs::metadata(backup_path).await?.is_file();
    if !is_file || !is_backup_path(backup_path) {
        return Err(StorageError::NotABackup(backup_path.to_path_buf()));
    }

    fs::remove_file(backup_path).await?;
    info!(backup = %backup_path.display(), "Rotation confirmed, backup removed");
    Ok(())
}

async fn resolve_keys(
    old: &KeySourceConfig,
    new: &KeySourceConfig,
) -> Result<(MasterKey, MasterKey), RotationError> {
    let at_start = |e: KeyError| RotationError::new(RotationState::Start, e);
    let old = KeyProvider::new(old.clone()).resolve_key().await.map_err(at_start)?;
    let new = KeyProvider::new(new.clone()).resolve_key().await.map_err(at_start)?;
    Ok((old, new))
}

fn discover_configs(dir: &Path) -> Result<Vec<PathBuf>, RotationError> {
    let discovery = |e: String| RotationError::new(RotationState::Start, RotationFailure::Discovery(e));

    let pattern = dir.join("**").join("*.json");
    let entries = glob::glob(&pattern.to_string_lossy()).map_err(|e| discovery(e.to_string()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| discovery(e.to_string()))?;
        let skip = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("config.example"))
            .unwrap_or(true);
        if !skip {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn fail(path: &Path, error: RotationError) -> RotationResult {
    error!(
        path = %path.display(),
        state = %error.state,
        error = %error.reason,
        "Key rotation failed; source file left untouched"
    );
    RotationResult::failed(error)
}

async fn drive(plan: &RotationPlan, old: &MasterKey, new: &MasterKey) -> Result<RotationResult, RotationError> {
    let start = Start::begin(plan, old, new).map_err(|e| RotationError::new(RotationState::Start, e))?;

    let loaded = start
        .load(old)
        .await
        .map_err(|e| RotationError::new(RotationState::Start, e))?;
    if loaded.secrets.is_empty() {
        info!(path = %plan.source_path.display(), "No encrypted fields; nothing to rotate");
        return Ok(RotationResult::nothing_to_rotate());
    }
    info!(state = %RotationState::LoadedWithOldKey, fields = loaded.secrets.len(), "Decrypted with old key");

    let reencrypted = loaded
        .reencrypt(new)
        .await
        .map_err(|e| RotationError::new(RotationState::LoadedWithOldKey, e))?;
    info!(
        state = %RotationState::ReencryptedWithNewKey,
        staged = %reencrypted.staged.path().display(),
        "Re-encrypted into staged file"
    );

    let verified = reencrypted
        .verify(new)
        .await
        .map_err(|e| RotationError::new(RotationState::ReencryptedWithNewKey, e))?;
    info!(state = %RotationState::Verified, "Staged file verified with new key");

    let rotated_fields = verified.commit().await.map_err(|e| RotationError::new(RotationState::Verified, e))?;
    info!(
        state = %RotationState::Committed,
        path = %plan.source_path.display(),
        backup = %plan.backup_path.display(),
        "Key rotation committed; confirm once the new key is in place"
    );

    Ok(RotationResult::committed(plan.backup_path.clone(), rotated_fields))
}

/// Lock held, keys checked
struct Start<'a> {
    plan: &'a RotationPlan,
    lock: RotationLock,
}

/// Source read and every encrypted field opened with the old key
struct LoadedWithOldKey<'a> {
    plan: &'a RotationPlan,
    lock: RotationLock,
    original: Vec<u8>,
    permissions: Permissions,
    document: RawConfigDocument,
    secrets: Vec<(&'static str, SecretString)>,
}

/// New document written to a staged file beside the source
struct ReencryptedWithNewKey<'a> {
    loaded: LoadedWithOldKey<'a>,
    staged: StagedFile,
}

/// Staged file reopened and checked
struct Verified<'a> {
    loaded: LoadedWithOldKey<'a>,
    staged: StagedFile,
}

impl<'a> Start<'a> {
    fn begin(plan: &'a RotationPlan, old: &MasterKey, new: &MasterKey) -> Result<Self, RotationFailure> {
        if old == new {
            return Err(RotationFailure::SameKey);
        }

        let lock = RotationLock::acquire(&plan.source_path).map_err(|e| match e {
            LockError::Held(path) => RotationFailure::Locked(path),
            LockError::Io(e) => RotationFailure::Storage(e.into()),
        })?;

        Ok(Self { plan, lock })
    }

    async fn load(self, old: &MasterKey) -> Result<LoadedWithOldKey<'a>, RotationFailure> {
        let path = &self.plan.source_path;
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(ConfigError::NotFound(path.clone()).into());
        }

        // the lock is held, so no live writer owns these
        let stale = remove_stale_staged(path).await?;
        if stale > 0 {
            warn!(path = %path.display(), removed = stale, "Removed staged files from an interrupted rotation");
        }

        let original = fs::read(path).await.map_err(ConfigError::from)?;
        let permissions = fs::metadata(path).await.map_err(ConfigError::from)?.permissions();
        let document = RawConfigDocument::from_slice(&original)?;

        let mut secrets = Vec::new();
        for (field, envelope) in document.encrypted_fields() {
            let secret = decrypt_field(envelope, old).map_err(|source| RotationFailure::Decryption {
                field: field.to_string(),
                source,
            })?;
            secrets.push((field, secret));
        }

        Ok(LoadedWithOldKey {
            plan: self.plan,
            lock: self.lock,
            original,
            permissions,
            document,
            secrets,
        })
    }
}

impl<'a> LoadedWithOldKey<'a> {
    async fn reencrypt(self, new: &MasterKey) -> Result<ReencryptedWithNewKey<'a>, RotationFailure> {
        let mut document = self.document.clone();
        for (field, secret) in &self.secrets {
            let envelope = encrypt_field(secret.expose_secret(), new)?;
            document = document.with_encrypted_field(field, envelope)?;
        }

        let contents = document.to_json_pretty()?;
        let staged = StagedFile::write(
            &self.plan.source_path,
            contents.as_bytes(),
            Some(self.permissions.clone()),
        )
        .await?;

        Ok(ReencryptedWithNewKey {
            loaded: self,
            staged,
        })
    }
}

impl<'a> ReencryptedWithNewKey<'a> {
    /// Reopen the staged file and check it against what was loaded. The
    /// staged file is deleted on drop if this fails.
    async fn verify(self, new: &MasterKey) -> Result<Verified<'a>, RotationFailure> {
        let bytes = fs::read(self.staged.path()).await.map_err(StorageError::from)?;
        let staged_doc = RawConfigDocument::from_slice(&bytes)
            .map_err(|e| RotationFailure::VerificationMismatch(e.to_string()))?;

        if !staged_doc.same_settings_as(&self.loaded.document) {
            return Err(RotationFailure::VerificationMismatch(
                "non-secret fields differ from the source".to_string(),
            ));
        }

        let staged_fields = staged_doc.encrypted_fields();
        for (field, expected) in &self.loaded.secrets {
            let Some((_, envelope)) = staged_fields.iter().find(|(name, _)| name == field) else {
                return Err(RotationFailure::VerificationMismatch(format!(
                    "`{}` is not encrypted in the staged file",
                    field
                )));
            };
            let reopened = decrypt_field(envelope, new).map_err(|_| {
                RotationFailure::VerificationMismatch(format!("`{}` does not open with the new key", field))
            })?;
            if reopened.expose_secret() != expected.expose_secret() {
                return Err(RotationFailure::VerificationMismatch(format!(
                    "`{}` decrypted to a different value",
                    field
                )));
            }
        }

        Ok(Verified {
            loaded: self.loaded,
            staged: self.staged,
        })
    }
}

impl Verified<'_> {
    async fn commit(self) -> Result<Vec<String>, RotationFailure> {
        let loaded = self.loaded;
        let source = &loaded.plan.source_path;

        let current = fs::read(source).await.map_err(StorageError::from)?;
        if current != loaded.original {
            warn!(path = %source.display(), "Source changed during rotation");
            return Err(RotationFailure::SourceModified);
        }

        create_backup(
            &loaded.plan.backup_path,
            &loaded.original,
            Some(loaded.permissions.clone()),
        )
        .await?;

        self.staged.persist(source)?;
        drop(loaded.lock);

        Ok(loaded
            .secrets
            .iter()
            .map(|(field, _)| field.to_string())
            .collect())
    }
}
