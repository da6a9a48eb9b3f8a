use std::io;
use std::path::Path;
use thiserror::Error;

use super::utils::{validate_path, FsError};
use super::LocalFile;

#[derive(Error, Debug)]
pub enum RenameError {
    #[error("error renaming file: `{0}`")]
    Rename(#[from] io::Error),

    #[error("invalid path: `{0}`")]
    InvalidPath(#[from] FsError),
}

/// Rename within one filesystem. `std::fs::rename` is atomic on POSIX when
/// source and target live on the same mount, which is what the metadata
/// store relies on for its write-temp-then-replace cycle.
pub trait FileRenamer {
    fn rename(&self, file_path: &Path, rename_path: &Path) -> Result<(), RenameError>;
}

impl FileRenamer for LocalFile {
    fn rename(&self, file_path: &Path, rename_path: &Path) -> Result<(), RenameError> {
        validate_path(file_path)?;
        validate_path(rename_path)?;
        std::fs::rename(file_path, rename_path)?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_rename_replaces_target() {
        let tempdir = tempfile::tempdir().unwrap();
        let tmp = tempdir.path().join("ranges_metadata.json.tmp");
        let target = tempdir.path().join("ranges_metadata.json");
        fs::write(&tmp, "{\"1\":{}}").unwrap();
        fs::write(&target, "{}").unwrap();

        LocalFile.rename(&tmp, &target).unwrap();

        assert!(!tmp.exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"1\":{}}");
    }

    #[test]
    fn test_rename_missing_source_fails() {
        let tempdir = tempfile::tempdir().unwrap();
        let missing = tempdir.path().join("absent.tmp");
        let target = tempdir.path().join("target");

        assert!(LocalFile.rename(&missing, &target).is_err());
    }
}
