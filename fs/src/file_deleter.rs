use std::io;
use std::path::Path;
use thiserror::Error;

use super::utils::{validate_path, FsError};
use super::LocalFile;

#[derive(Error, Debug)]
pub enum DeleteError {
    #[error("error deleting file: `{0}`")]
    Delete(#[from] io::Error),

    #[error("invalid path: `{0}`")]
    InvalidPath(#[from] FsError),
}

pub trait FileDeleter {
    /// Deletes a file. Deleting a file that does not exist is not an error,
    /// so rollback hooks can run more than once.
    fn delete(&self, file_path: &Path) -> Result<(), DeleteError>;
}

impl FileDeleter for LocalFile {
    fn delete(&self, file_path: &Path) -> Result<(), DeleteError> {
        validate_path(file_path)?;
        if !file_path.exists() {
            return Ok(());
        }
        std::fs::remove_file(file_path)?;
        Ok(())
    }
}
