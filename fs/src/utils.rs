use regex::Regex;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FsError {
    #[error("invalid path: `{0}`")]
    InvalidPath(String),

    #[error("dots disallowed in path `{0}`")]
    DotsDisallowed(String),
}

/// Rejects paths containing `..` components so callers cannot escape the
/// directories they were handed.
pub fn validate_path(path: &Path) -> Result<(), FsError> {
    match path.to_str() {
        None => Err(FsError::InvalidPath(format!(
            "{} is not valid unicode",
            path.to_string_lossy()
        ))),
        Some(valid_path) => {
            let dots_regex = Regex::new(r"\.\.").unwrap();
            if dots_regex.is_match(valid_path) {
                Err(FsError::DotsDisallowed(valid_path.to_string()))
            } else {
                Ok(())
            }
        }
    }
}

pub fn get_file_permissions() -> Permissions {
    Permissions::from_mode(0o600)
}

pub fn get_directory_permissions() -> Permissions {
    Permissions::from_mode(0o700)
}

/// Logs and disk artifacts meant to be readable by the operator account.
pub fn get_shared_file_permissions() -> Permissions {
    Permissions::from_mode(0o644)
}
