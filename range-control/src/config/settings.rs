//! Application settings.
//!
//! Loaded from a YAML file discovered at `./config.yml` or `./config.yaml`
//! (or an explicit `--config` path); every field has a default so a missing
//! file means default behavior, not an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fs::file_reader::{FileReader, FileReaderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("could not read settings file: {0}")]
    Read(#[from] FileReaderError),

    #[error("could not parse settings file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// Level filter, overridable with `RUST_LOG`.
    pub level: String,
    pub console: bool,
    pub file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root of all per-range state and the metadata store.
    pub cyber_range_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Explicit hypervisor URI; when unset it is derived from the
    /// `--network-mode` flag.
    pub libvirt_uri: Option<String>,
    /// Overlay on the built-in network name → CIDR table.
    pub network_cidrs: HashMap<String, String>,
    /// Parallel per-guest workers (builds, boots, discovery, tasks).
    pub max_workers: usize,
    /// Concurrent image builds across all ranges.
    pub build_permits: usize,
    /// Escalate any task failure to a range failure.
    pub strict_tasks: bool,
    /// Log-and-skip unknown build-time task keys instead of failing
    /// validation, for older description files.
    pub legacy_build_task_compat: bool,
    /// Wrap iptables and bridge commands in non-interactive sudo.
    pub use_sudo: bool,
    pub ip_cache_ttl_secs: u64,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cyber_range_dir: PathBuf::from(defaults::CYBER_RANGE_DIR),
            log_dir: PathBuf::from(defaults::LOG_DIR),
            libvirt_uri: None,
            network_cidrs: HashMap::new(),
            max_workers: defaults::DEFAULT_MAX_WORKERS,
            build_permits: defaults::DEFAULT_BUILD_PERMITS,
            strict_tasks: false,
            legacy_build_task_compat: false,
            use_sudo: false,
            ip_cache_ttl_secs: defaults::IP_CACHE_TTL.as_secs(),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path, reader: &impl FileReader) -> Result<Self, SettingsError> {
        let content = reader.read(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Explicit path, then the discovery locations, then defaults.
    pub fn discover(
        explicit: Option<&Path>,
        reader: &impl FileReader,
    ) -> Result<Self, SettingsError> {
        if let Some(path) = explicit {
            return Self::load(path, reader);
        }
        for candidate in ["config.yml", "config.yaml"] {
            let path = PathBuf::from(candidate);
            if path.is_file() {
                return Self::load(&path, reader);
            }
        }
        Ok(Self::default())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.cyber_range_dir.join(defaults::RANGES_METADATA_FILENAME)
    }

    pub fn range_dir(&self, range_id: &str) -> PathBuf {
        self.cyber_range_dir.join(range_id)
    }

    /// Commented template written by `config-init`.
    pub fn template() -> String {
        let defaults = Self::default();
        format!(
            "# CyRIS range-control configuration\n\
             # All keys are optional; the values below are the defaults.\n\
             \n\
             cyber_range_dir: {cyber_range_dir}\n\
             log_dir: {log_dir}\n\
             # libvirt_uri: qemu:///system\n\
             \n\
             # Override the built-in network name -> CIDR table:\n\
             # network_cidrs:\n\
             #   office: 192.168.100.0/24\n\
             network_cidrs: {{}}\n\
             \n\
             max_workers: {max_workers}\n\
             build_permits: {build_permits}\n\
             strict_tasks: {strict_tasks}\n\
             legacy_build_task_compat: {legacy}\n\
             use_sudo: {use_sudo}\n\
             ip_cache_ttl_secs: {ttl}\n\
             \n\
             log:\n\
             \x20 level: {level}\n\
             \x20 console: {console}\n\
             \x20 file: {file}\n",
            cyber_range_dir = defaults.cyber_range_dir.display(),
            log_dir = defaults.log_dir.display(),
            max_workers = defaults.max_workers,
            build_permits = defaults.build_permits,
            strict_tasks = defaults.strict_tasks,
            legacy = defaults.legacy_build_task_compat,
            use_sudo = defaults.use_sudo,
            ttl = defaults.ip_cache_ttl_secs,
            level = defaults.log.level,
            console = defaults.log.console,
            file = defaults.log.file,
        )
    }

    /// Effective settings as YAML, for `config-show`.
    pub fn render(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use fs::LocalFile;

    #[test]
    fn test_partial_file_keeps_defaults_elsewhere() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("config.yml");
        std::fs::write(&path, "max_workers: 2\nstrict_tasks: true\n").unwrap();

        let settings = Settings::load(&path, &LocalFile).unwrap();
        assert_eq!(settings.max_workers, 2);
        assert!(settings.strict_tasks);
        assert_eq!(settings.build_permits, defaults::DEFAULT_BUILD_PERMITS);
        assert_eq!(
            settings.cyber_range_dir,
            PathBuf::from(defaults::CYBER_RANGE_DIR)
        );
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("config.yml");
        std::fs::write(&path, "max_wrokers: 2\n").unwrap();

        assert!(matches!(
            Settings::load(&path, &LocalFile),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_template_round_trips_to_defaults() {
        let parsed: Settings = serde_yaml::from_str(&Settings::template()).unwrap();
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn test_discover_without_file_yields_defaults() {
        let settings = Settings::discover(None, &LocalFile).unwrap();
        // The test process may run anywhere; only assert the fallback when
        // no config file is present in the working directory.
        if !PathBuf::from("config.yml").exists() && !PathBuf::from("config.yaml").exists() {
            assert_eq!(settings, Settings::default());
        }
    }

    #[test]
    fn test_paths_derive_from_range_dir() {
        let settings = Settings::default();
        assert!(settings.metadata_path().ends_with("ranges_metadata.json"));
        assert!(settings.range_dir("77").ends_with("77"));
    }
}
