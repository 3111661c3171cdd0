//! Temp-file staging, atomic replacement and verified backups

use super::StorageError;
use chrono::{NaiveDateTime, Utc};
use std::fs::Permissions;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// A fully written and synced file waiting to replace its target.
///
/// Lives beside the target so the final rename never crosses filesystems.
/// Dropping it without [`StagedFile::persist`] deletes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    temp: TempPath,
}

impl StagedFile {
    /// Write `contents` to a new temp file next to `target`
    pub async fn write(
        target: &Path,
        contents: &[u8],
        permissions: Option<Permissions>,
    ) -> Result<Self, StorageError> {
        let dir = parent_dir(target);
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".tmp")
            .tempfile_in(dir)?
            .into_temp_path();

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&temp)
            .await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(permissions) = permissions {
            fs::set_permissions(&temp, permissions).await?;
        }

        Ok(Self { temp })
    }

    /// Location of the staged file
    pub fn path(&self) -> &Path {
        &self.temp
    }

    /// Atomically rename the staged file over `target`
    pub fn persist(self, target: &Path) -> Result<(), StorageError> {
        self.temp.persist(target).map_err(io::Error::from)?;
        Ok(())
    }

    /// Leave the staged file on disk without persisting it, as an interrupted process would
    pub fn abandon(self) -> PathBuf {
        let path = self.temp.to_path_buf();
        // keep() only fails on platforms that cannot disable deletion; the path is still valid
        let _ = self.temp.keep();
        path
    }
}

const BACKUP_MARKER: &str = ".backup.";
const BACKUP_STAMP: &str = "%Y%m%d_%H%M%S%.3f";

/// Default backup location: `<path>.backup.<UTC timestamp>`
pub fn backup_path_for(source: &Path) -> PathBuf {
    let stamp = Utc::now().format(BACKUP_STAMP);
    let mut name = source.as_os_str().to_os_string();
    name.push(format!("{}{}", BACKUP_MARKER, stamp));
    PathBuf::from(name)
}

/// Whether `path` is named like a file from [`backup_path_for`]
pub fn is_backup_path(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match name.rfind(BACKUP_MARKER) {
        Some(at) if at > 0 => {
            let stamp = &name[at + BACKUP_MARKER.len()..];
            NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP).is_ok()
        }
        _ => false,
    }
}

/// Delete staged files an interrupted writer left beside `target`
pub async fn remove_stale_staged(target: &Path) -> Result<usize, StorageError> {
    let Some(file_name) = target.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(0);
    };
    let prefix = format!(".{}.", file_name);

    let mut removed = 0;
    let mut entries = fs::read_dir(parent_dir(target)).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".tmp") && entry.file_type().await?.is_file() {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(removed)
}

/// Write `expected` (the source's bytes as loaded) to a new file at
/// `backup_path`, then read it back and compare.
///
/// Never replaces an existing file.
pub async fn create_backup(
    backup_path: &Path,
    expected: &[u8],
    permissions: Option<Permissions>,
) -> Result<(), StorageError> {
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(backup_path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(StorageError::AlreadyExists(backup_path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(expected).await?;
    file.sync_all().await?;
    drop(file);

    if let Some(permissions) = permissions {
        fs::set_permissions(backup_path, permissions).await?;
    }

    let written = fs::read(backup_path).await?;
    if written != expected {
        return Err(StorageError::BackupMismatch(backup_path.to_path_buf()));
    }

    Ok(())
}

/// Replace `path` with `contents`, readable only by the owner on unix
pub async fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let staged = StagedFile::write(path, contents, owner_only()).await?;
    staged.persist(path)
}

#[cfg(unix)]
fn owner_only() -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn owner_only() -> Option<Permissions> {
    None
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
