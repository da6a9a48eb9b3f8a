use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::{fs, io};

use super::utils::{get_file_permissions, validate_path, FsError};
use thiserror::Error;

use super::LocalFile;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("error creating file: `{0}`")]
    ErrorCreatingFile(#[from] io::Error),

    #[error("invalid path: `{0}`")]
    InvalidPath(#[from] FsError),
}

pub trait FileWriter {
    fn write(&self, path: &Path, buf: String) -> Result<(), WriteError>;
}

impl FileWriter for LocalFile {
    /// Writes `content` to `path` with owner-only permissions, truncating any
    /// previous content.
    fn write(&self, path: &Path, content: String) -> Result<(), WriteError> {
        validate_path(path)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(get_file_permissions().mode())
            .open(path)?;

        file.write_all(content.as_bytes())?;

        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_content_and_permissions() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("status");

        LocalFile.write(&path, "SUCCESS\n".to_string()).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "SUCCESS\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_truncates_previous_content() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("status");

        LocalFile.write(&path, "FAILURE\n".to_string()).unwrap();
        LocalFile.write(&path, "SUCCESS\n".to_string()).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "SUCCESS\n");
    }

    #[test]
    fn test_write_rejects_dotted_paths() {
        let result = LocalFile.write(
            Path::new("some/path/../../etc/passwd"),
            String::new(),
        );
        assert!(result.is_err());
    }
}
