//! On-disk handling for configuration documents
//!
//! Every write that replaces a document goes through a temp file in the same
//! directory followed by a rename, so readers only ever see a complete file.

mod file;

pub use file::{
    backup_path_for, create_backup, is_backup_path, remove_stale_staged, write_private, StagedFile,
};

use std::path::PathBuf;
use thiserror::Error;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Backup {0} does not match the source file")]
    BackupMismatch(PathBuf),

    #[error("Not a rotation backup: {0}")]
    NotABackup(PathBuf),
}
