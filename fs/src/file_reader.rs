use std::fs::{read_dir, read_to_string};
use std::io::Error as ioError;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::LocalFile;

#[derive(Error, Debug)]
pub enum FileReaderError {
    #[error("error reading contents: `{0}`")]
    Read(#[from] ioError),
    #[error("file not found: `{0}`")]
    FileNotFound(String),
    #[error("dir not found: `{0}`")]
    DirNotFound(String),
}

pub trait FileReader {
    fn read(&self, file_path: &Path) -> Result<String, FileReaderError>;
    fn read_dir(&self, dir_path: &Path) -> Result<Vec<PathBuf>, FileReaderError>;
}

impl FileReader for LocalFile {
    fn read(&self, file_path: &Path) -> Result<String, FileReaderError> {
        if !file_path.is_file() {
            return Err(FileReaderError::FileNotFound(format!(
                "{}",
                file_path.display()
            )));
        }
        Ok(read_to_string(file_path)?)
    }

    fn read_dir(&self, dir_path: &Path) -> Result<Vec<PathBuf>, FileReaderError> {
        if !dir_path.is_dir() {
            return Err(FileReaderError::DirNotFound(format!(
                "{}",
                dir_path.display()
            )));
        }
        let mut entries = Vec::new();
        for entry in read_dir(dir_path)? {
            entries.push(entry?.path());
        }
        Ok(entries)
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
    fn test_read_existing_file() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("ranges_metadata.json");
        fs::write(&path, "{}").unwrap();

        let content = LocalFile.read(&path).unwrap();
        assert_eq!(content, "{}");
    }

    #[test]
    fn test_read_missing_file_is_not_found() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("absent.json");

        let err = LocalFile.read(&path).unwrap_err();
        assert!(matches!(err, FileReaderError::FileNotFound(_)));
    }

    #[test]
    fn test_read_dir_lists_entries() {
        let tempdir = tempfile::tempdir().unwrap();
        fs::write(tempdir.path().join("a.log"), "").unwrap();
        fs::write(tempdir.path().join("b.log"), "").unwrap();

        let entries = LocalFile.read_dir(tempdir.path()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_read_dir_missing_is_not_found() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("absent");

        let err = LocalFile.read_dir(&path).unwrap_err();
        assert!(matches!(err, FileReaderError::DirNotFound(_)));
    }
}
