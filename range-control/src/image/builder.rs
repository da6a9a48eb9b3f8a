//! Disk image production for `kvm-auto` guests.
//!
//! A named base image is materialized into a per-guest qcow2 with
//! `virt-builder`, then build-time account tasks are injected with
//! `virt-customize`. Both preconditions (toolchain present, base image
//! listed) are checked before anything mutates. Builds are bandwidth-heavy,
//! so a global semaphore bounds how many run at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::command::{CommandError, CommandExecutor, CommandSpec};
use crate::config::description::HostConfig;
use crate::defaults;
use crate::operation::OperationTracker;
use crate::tasks::kinds::TaskKind;
use crate::utils::semaphore::Semaphore;

const TOOLCHAIN: [&str; 3] = ["virt-builder", "virt-customize", "virt-install"];

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("required tool `{0}` is not available on this host")]
    ToolMissing(String),

    #[error("base image `{image}` is not in the toolkit's list (known: {known})")]
    ImageNotAvailable { image: String, known: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub guest_id: String,
    pub image_name: String,
    pub disk_size: String,
    pub output_dir: PathBuf,
    pub tasks: Vec<TaskKind>,
    /// Regenerate host keys and enable sshd inside the image.
    pub enable_ssh: bool,
}

impl BuildRequest {
    pub fn image_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.qcow2", self.guest_id))
    }
}

/// Outcome of one build. Subprocess failures land here rather than in an
/// error: the partial file is left in place for the rollback hook to
/// remove.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub success: bool,
    pub image_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub build_time: std::time::Duration,
}

pub struct ImageBuilder {
    executor: Arc<CommandExecutor>,
    build_permits: Semaphore,
}

impl ImageBuilder {
    pub fn new(executor: Arc<CommandExecutor>) -> Self {
        Self {
            executor,
            build_permits: Semaphore::new(defaults::DEFAULT_BUILD_PERMITS),
        }
    }

    pub fn with_build_permits(mut self, permits: usize) -> Self {
        self.build_permits = Semaphore::new(permits);
        self
    }

    /// Verifies `virt-builder`, `virt-customize` and `virt-install` are
    /// runnable.
    pub fn check_toolchain(&self, tracker: &OperationTracker) -> Result<(), ImageError> {
        for tool in TOOLCHAIN {
            let result = self.executor.execute(
                tracker,
                &CommandSpec::new(tool)
                    .arg("--version")
                    .timeout(std::time::Duration::from_secs(10))
                    .context("Check image toolchain"),
            );
            match result {
                Ok(result) if result.success => {}
                _ => return Err(ImageError::ToolMissing(tool.to_string())),
            }
        }
        Ok(())
    }

    /// Base images the toolkit can materialize.
    pub fn list_base_images(&self, tracker: &OperationTracker) -> Result<Vec<String>, ImageError> {
        let result = self.executor.execute(
            tracker,
            &CommandSpec::new("virt-builder")
                .arg("--list")
                .timeout(std::time::Duration::from_secs(30))
                .context("List base images"),
        )?;
        if !result.success {
            return Err(ImageError::ToolMissing("virt-builder".to_string()));
        }
        Ok(result
            .stdout
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with(char::is_whitespace))
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    /// Builds the guest disk. Precondition failures are errors; toolkit
    /// failures return an unsuccessful [BuildResult].
    pub fn build(
        &self,
        tracker: &OperationTracker,
        request: &BuildRequest,
    ) -> Result<BuildResult, ImageError> {
        let started_at = Instant::now();

        self.check_toolchain(tracker)?;
        let available = self.list_base_images(tracker)?;
        if !available.contains(&request.image_name) {
            let mut known: Vec<&str> = available.iter().map(String::as_str).take(5).collect();
            if available.len() > 5 {
                known.push("…");
            }
            return Err(ImageError::ImageNotAvailable {
                image: request.image_name.clone(),
                known: known.join(", "),
            });
        }

        let _permit = self.build_permits.acquire();
        let image_path = request.image_path();
        info!(
            guest = %request.guest_id,
            image = %request.image_name,
            path = %image_path.display(),
            "building guest disk"
        );

        let built = self.executor.execute(
            tracker,
            &CommandSpec::new("virt-builder")
                .arg(&request.image_name)
                .args(["--size", &request.disk_size])
                .args(["--format", "qcow2"])
                .args(["--output", &image_path.display().to_string()])
                .timeout(defaults::IMAGE_BUILD_TIMEOUT)
                .context("Build base image"),
        );
        match built {
            Ok(result) if result.success => {}
            Ok(result) => {
                return Ok(BuildResult {
                    success: false,
                    image_path: Some(image_path),
                    error_message: Some(format!("virt-builder failed: {}", result.stderr)),
                    build_time: started_at.elapsed(),
                });
            }
            Err(err) => {
                return Ok(BuildResult {
                    success: false,
                    image_path: Some(image_path),
                    error_message: Some(err.to_string()),
                    build_time: started_at.elapsed(),
                });
            }
        }

        if request.enable_ssh {
            let enabled = self.executor.execute(
                tracker,
                &CommandSpec::new("virt-customize")
                    .args(["-a", &image_path.display().to_string()])
                    .args(["--run-command", "ssh-keygen -A && systemctl enable ssh sshd || true"])
                    .timeout(defaults::IMAGE_CUSTOMIZE_TIMEOUT)
                    .context("Enable SSH in image"),
            );
            match enabled {
                Ok(result) if result.success => {}
                Ok(result) => {
                    return Ok(BuildResult {
                        success: false,
                        image_path: Some(image_path),
                        error_message: Some(format!("enabling SSH failed: {}", result.stderr)),
                        build_time: started_at.elapsed(),
                    });
                }
                Err(err) => {
                    return Ok(BuildResult {
                        success: false,
                        image_path: Some(image_path),
                        error_message: Some(err.to_string()),
                        build_time: started_at.elapsed(),
                    });
                }
            }
        }

        if let Some(message) = self.run_build_time_tasks(tracker, request, &image_path) {
            return Ok(BuildResult {
                success: false,
                image_path: Some(image_path),
                error_message: Some(message),
                build_time: started_at.elapsed(),
            });
        }

        Ok(BuildResult {
            success: true,
            image_path: Some(image_path),
            error_message: None,
            build_time: started_at.elapsed(),
        })
    }

    /// Copies a finished disk to a remote deployment host.
    pub fn distribute(
        &self,
        tracker: &OperationTracker,
        image_path: &Path,
        host: &HostConfig,
        remote_path: &str,
    ) -> Result<(), ImageError> {
        let target = format!("{}@{}:{}", host.account, host.mgmt_addr, remote_path);
        let result = self.executor.execute(
            tracker,
            &CommandSpec::new("scp")
                .args(["-o", "StrictHostKeyChecking=no"])
                .arg(image_path.display().to_string())
                .arg(&target)
                .timeout(defaults::IMAGE_DISTRIBUTE_TIMEOUT)
                .context("Distribute guest disk"),
        )?;
        if result.success {
            info!(host = %host.host_id, target, "disk distributed");
            Ok(())
        } else {
            Err(ImageError::Command(CommandError::Spawn {
                command: result.command,
                source: std::io::Error::other(result.stderr),
            }))
        }
    }

    /// Removes a produced disk; invoked by rollback and destroy.
    pub fn cleanup_build_files(&self, image_path: &Path) {
        match std::fs::remove_file(image_path) {
            Ok(()) => info!(path = %image_path.display(), "build artifact removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %image_path.display(), %err, "could not remove build artifact"),
        }
    }

    fn run_build_time_tasks(
        &self,
        tracker: &OperationTracker,
        request: &BuildRequest,
        image_path: &Path,
    ) -> Option<String> {
        for task in &request.tasks {
            let spec = match task {
                TaskKind::AddAccount { account, passwd } => CommandSpec::new("virt-customize")
                    .args(["-a", &image_path.display().to_string()])
                    .args(["--run-command", &format!("useradd -m {account}")])
                    .args(["--password", &format!("{account}:password:{passwd}")])
                    .timeout(defaults::IMAGE_CUSTOMIZE_TIMEOUT)
                    .context("Add account to image"),
                TaskKind::ModifyAccount {
                    account,
                    new_passwd: Some(new_passwd),
                    ..
                } => CommandSpec::new("virt-customize")
                    .args(["-a", &image_path.display().to_string()])
                    .args(["--password", &format!("{account}:password:{new_passwd}")])
                    .timeout(defaults::IMAGE_CUSTOMIZE_TIMEOUT)
                    .context("Modify account in image"),
                TaskKind::Unknown { kind } => {
                    warn!(guest = %request.guest_id, kind, "skipping unknown build-time task");
                    continue;
                }
                // Post-boot kinds are the task executor's concern.
                _ => continue,
            };

            match self.executor.execute(tracker, &spec) {
                Ok(result) if result.success => {}
                Ok(result) => {
                    return Some(format!(
                        "virt-customize failed for task `{}`: {}",
                        task.kind_name(),
                        result.stderr
                    ));
                }
                Err(err) => return Some(err.to_string()),
            }
        }
        None
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::executor::testing::FakeRunner;
    use assert_matches::assert_matches;

    const IMAGE_LIST: &str = "\
ubuntu-20.04             x86_64     Ubuntu 20.04 (focal)
ubuntu-22.04             x86_64     Ubuntu 22.04 (jammy)
centosstream-9           x86_64     CentOS Stream 9
";

    fn builder(runner: FakeRunner) -> (ImageBuilder, Arc<FakeRunner>, OperationTracker) {
        let runner = Arc::new(runner);
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&runner) as Arc<dyn crate::command::CommandRunner>
        ));
        (
            ImageBuilder::new(executor),
            runner,
            OperationTracker::new("77"),
        )
    }

    fn request(image_name: &str, tasks: Vec<TaskKind>) -> BuildRequest {
        BuildRequest {
            guest_id: "desktop".to_string(),
            image_name: image_name.to_string(),
            disk_size: "20G".to_string(),
            output_dir: PathBuf::from("/tmp/cyris-test-disks"),
            tasks,
            enable_ssh: false,
        }
    }

    #[test]
    fn test_build_invokes_toolkit_with_expected_arguments() {
        let (builder, runner, tracker) =
            builder(FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST));

        let result = builder
            .build(&tracker, &request("ubuntu-20.04", Vec::new()))
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.image_path.as_deref(),
            Some(Path::new("/tmp/cyris-test-disks/desktop.qcow2"))
        );
        assert!(runner.recorded().iter().any(|cmd| cmd
            == "virt-builder ubuntu-20.04 --size 20G --format qcow2 --output /tmp/cyris-test-disks/desktop.qcow2"));
    }

    #[test]
    fn test_unlisted_image_is_a_precondition_error() {
        let (builder, runner, tracker) =
            builder(FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST));

        let err = builder
            .build(&tracker, &request("windows-3.1", Vec::new()))
            .unwrap_err();

        assert_matches!(err, ImageError::ImageNotAvailable { image, .. } => {
            assert_eq!(image, "windows-3.1");
        });
        // Nothing was built.
        assert!(!runner
            .recorded()
            .iter()
            .any(|cmd| cmd.contains("--output")));
    }

    #[test]
    fn test_missing_tool_is_a_precondition_error() {
        let (builder, _, tracker) =
            builder(FakeRunner::default().respond("virt-customize --version", 127, ""));

        let err = builder
            .build(&tracker, &request("ubuntu-20.04", Vec::new()))
            .unwrap_err();
        assert_matches!(err, ImageError::ToolMissing(tool) => assert_eq!(tool, "virt-customize"));
    }

    #[test]
    fn test_build_failure_is_a_result_not_an_error() {
        let (builder, _, tracker) = builder(
            FakeRunner::default()
                .respond("virt-builder --list", 0, IMAGE_LIST)
                .respond("--output", 1, ""),
        );

        let result = builder
            .build(&tracker, &request("ubuntu-20.04", Vec::new()))
            .unwrap();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("virt-builder failed"));
    }

    #[test]
    fn test_account_tasks_run_through_virt_customize() {
        let (builder, runner, tracker) =
            builder(FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST));

        let tasks = vec![
            TaskKind::AddAccount {
                account: "daniel".to_string(),
                passwd: "secret".to_string(),
            },
            TaskKind::ModifyAccount {
                account: "root".to_string(),
                new_passwd: Some("toor".to_string()),
                new_account: None,
            },
            // Post-boot tasks are not the builder's concern.
            TaskKind::InstallPackage {
                package_manager: "apt-get".to_string(),
                name: "wireshark".to_string(),
                version: None,
            },
        ];
        let result = builder
            .build(&tracker, &request("ubuntu-20.04", tasks))
            .unwrap();
        assert!(result.success);

        let recorded = runner.recorded();
        assert!(recorded
            .iter()
            .any(|cmd| cmd.contains("--run-command 'useradd -m daniel'")
                && cmd.contains("--password daniel:password:secret")));
        assert!(recorded
            .iter()
            .any(|cmd| cmd.contains("--password root:password:toor")));
        assert!(!recorded.iter().any(|cmd| cmd.contains("wireshark")));
    }

    #[test]
    fn test_unknown_build_task_is_skipped() {
        let (builder, runner, tracker) =
            builder(FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST));

        let result = builder
            .build(
                &tracker,
                &request(
                    "ubuntu-20.04",
                    vec![TaskKind::Unknown {
                        kind: "deploy_honeypot".to_string(),
                    }],
                ),
            )
            .unwrap();
        assert!(result.success);
        assert!(!runner
            .recorded()
            .iter()
            .any(|cmd| cmd.contains("deploy_honeypot")));
    }

    #[test]
    fn test_distribute_copies_over_scp() {
        let (builder, runner, tracker) = builder(FakeRunner::default());
        let host = crate::config::description::HostConfig {
            host_id: "host_2".to_string(),
            mgmt_addr: "10.0.0.20".to_string(),
            virbr_addr: "192.168.122.1".to_string(),
            account: "cyuser".to_string(),
        };

        builder
            .distribute(
                &tracker,
                Path::new("/tmp/cyris-test-disks/desktop.qcow2"),
                &host,
                "/var/lib/cyris/disks/desktop.qcow2",
            )
            .unwrap();

        assert!(runner.recorded().iter().any(|cmd| cmd
            == "scp -o StrictHostKeyChecking=no /tmp/cyris-test-disks/desktop.qcow2 cyuser@10.0.0.20:/var/lib/cyris/disks/desktop.qcow2"));
    }

    #[test]
    fn test_enable_ssh_customizes_the_image() {
        let (builder, runner, tracker) =
            builder(FakeRunner::default().respond("virt-builder --list", 0, IMAGE_LIST));

        let result = builder
            .build(
                &tracker,
                &BuildRequest {
                    enable_ssh: true,
                    ..request("ubuntu-20.04", Vec::new())
                },
            )
            .unwrap();
        assert!(result.success);
        assert!(runner
            .recorded()
            .iter()
            .any(|cmd| cmd.contains("ssh-keygen -A")));
    }

    #[test]
    fn test_cleanup_removes_the_disk() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("desktop.qcow2");
        std::fs::write(&path, "disk").unwrap();

        let (builder, _, _) = builder(FakeRunner::default());
        builder.cleanup_build_files(&path);
        assert!(!path.exists());

        // Second invocation is a quiet no-op.
        builder.cleanup_build_files(&path);
    }
}
