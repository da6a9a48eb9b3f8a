use super::utils::validate_path;
use std::fs::{remove_dir_all, DirBuilder};
use std::io;
use std::path::Path;
use tracing::instrument;

pub trait DirectoryManager {
    /// Creates the directory and any missing parents.
    fn create(&self, path: &Path) -> io::Result<()>;

    /// Deletes the directory and its contents. A missing directory is not
    /// an error.
    fn delete(&self, path: &Path) -> io::Result<()>;
}

#[derive(Clone)]
pub struct DirectoryManagerFs;

impl DirectoryManager for DirectoryManagerFs {
    fn create(&self, path: &Path) -> io::Result<()> {
        validate_path(path).map_err(io::Error::other)?;

        let mut directory_builder = DirBuilder::new();
        directory_builder.recursive(true);
        {
            use std::os::unix::fs::DirBuilderExt;
            use std::os::unix::fs::PermissionsExt;
            directory_builder.mode(super::utils::get_directory_permissions().mode());
        }
        directory_builder.create(path)
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn delete(&self, path: &Path) -> io::Result<()> {
        validate_path(path).map_err(io::Error::other)?;

        if !path.exists() {
            return Ok(());
        }
        remove_dir_all(path)
    }
}

////////////////////////////////////////////////////////////////////////////////////
// Mock
////////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "mocks")]
pub mod mock {
    use super::*;
    use mockall::{mock, predicate};
    use std::path::PathBuf;

    mock! {
        pub DirectoryManager {}

        impl DirectoryManager for DirectoryManager {
            fn create(&self, path: &Path) -> io::Result<()>;
            fn delete(&self, path: &Path) -> io::Result<()>;
        }
        impl Clone for DirectoryManager {
            fn clone(&self) -> Self;
        }
    }

    impl MockDirectoryManager {
        pub fn should_create(&mut self, path: &Path) {
            self.expect_create()
                .with(predicate::eq(PathBuf::from(path)))
                .once()
                .returning(|_| Ok(()));
        }

        pub fn should_delete(&mut self, path: &Path) {
            self.expect_delete()
                .with(predicate::eq(PathBuf::from(path)))
                .once()
                .returning(|_| Ok(()));
        }
    }
}
