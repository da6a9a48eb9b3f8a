//! Range description files.
//!
//! A description is the user-facing YAML with three top-level sections:
//! `host_settings`, `guest_settings` and `clone_settings`. Parsing is
//! strict about structure but leaves cross-references and provider
//! coherence to [RangeDescription::validate], which reports every problem
//! at once instead of stopping at the first.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use fs::file_reader::{FileReader, FileReaderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::network::policy::NetworkRule;
use crate::tasks::kinds::{parse_tasks, TaskKind};

#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("could not read description file: {0}")]
    Read(#[from] FileReaderError),

    #[error("could not parse description file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("description is invalid:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseVmType {
    #[serde(rename = "kvm")]
    Kvm,
    #[serde(rename = "kvm-auto")]
    KvmAuto,
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "docker")]
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsFamily {
    #[serde(rename = "ubuntu")]
    Ubuntu,
    #[serde(rename = "ubuntu_16")]
    Ubuntu16,
    #[serde(rename = "ubuntu_18")]
    Ubuntu18,
    #[serde(rename = "ubuntu_20")]
    Ubuntu20,
    #[serde(rename = "centos")]
    Centos,
    #[serde(rename = "red_hat")]
    RedHat,
    #[serde(rename = "amazon_linux")]
    AmazonLinux,
    #[serde(rename = "windows.7")]
    Windows7,
    #[serde(rename = "windows.8.1")]
    Windows81,
    #[serde(rename = "windows.10")]
    Windows10,
}

impl OsFamily {
    pub fn is_windows(&self) -> bool {
        matches!(
            self,
            OsFamily::Windows7 | OsFamily::Windows81 | OsFamily::Windows10
        )
    }
}

/// Deployment target for guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub host_id: String,
    pub mgmt_addr: String,
    pub virbr_addr: String,
    pub account: String,
}

impl HostConfig {
    pub fn is_local(&self) -> bool {
        matches!(self.mgmt_addr.as_str(), "localhost" | "127.0.0.1")
    }
}

/// One VM specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestConfig {
    #[serde(alias = "id")]
    pub guest_id: String,
    pub basevm_host: Option<String>,
    pub basevm_config_file: Option<PathBuf>,
    pub basevm_type: BaseVmType,
    pub basevm_os_type: OsFamily,
    pub ip_addr: Option<String>,
    /// kvm-auto only: named base image plus sizing.
    pub image_name: Option<String>,
    pub vcpus: Option<u32>,
    /// MiB.
    pub memory: Option<u64>,
    /// e.g. `20G`.
    pub disk_size: Option<String>,
    #[serde(default)]
    pub tasks: Vec<serde_yaml::Value>,
}

impl GuestConfig {
    pub fn parsed_tasks(&self) -> Result<Vec<TaskKind>, crate::tasks::kinds::TaskParseError> {
        parse_tasks(&self.tasks)
    }

    #[cfg(test)]
    pub fn test_kvm_guest(guest_id: &str) -> Self {
        Self {
            guest_id: guest_id.to_string(),
            basevm_host: Some("host_1".to_string()),
            basevm_config_file: Some(PathBuf::from(format!("/opt/cyris/basevm/{guest_id}.xml"))),
            basevm_type: BaseVmType::Kvm,
            basevm_os_type: OsFamily::Ubuntu20,
            ip_addr: None,
            image_name: None,
            vcpus: None,
            memory: None,
            disk_size: None,
            tasks: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn test_kvm_auto_guest(guest_id: &str, image_name: &str) -> Self {
        Self {
            guest_id: guest_id.to_string(),
            basevm_host: Some("host_1".to_string()),
            basevm_config_file: None,
            basevm_type: BaseVmType::KvmAuto,
            basevm_os_type: OsFamily::Ubuntu20,
            ip_addr: None,
            image_name: Some(image_name.to_string()),
            vcpus: Some(2),
            memory: Some(2048),
            disk_size: Some("20G".to_string()),
            tasks: Vec::new(),
        }
    }
}

/// `members:` accepts a single `guest.iface` string or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Members {
    One(String),
    Many(Vec<String>),
}

impl Default for Members {
    fn default() -> Self {
        Members::Many(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub members: Members,
    pub gateway: Option<String>,
}

impl NetworkSpec {
    pub fn member_list(&self) -> Vec<String> {
        match &self.members {
            Members::One(member) => vec![member.clone()],
            Members::Many(members) => members.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingRuleSpec {
    pub rule: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRuleSpec>,
}

impl TopologySpec {
    pub fn forwarding_rule_strings(&self) -> Vec<String> {
        self.forwarding_rules
            .iter()
            .map(|spec| spec.rule.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneGuest {
    pub guest_id: String,
    #[serde(default = "default_one")]
    pub number: u32,
    #[serde(default)]
    pub entry_point: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneHost {
    pub host_id: String,
    #[serde(default = "default_one")]
    pub instance_number: u32,
    #[serde(default)]
    pub guests: Vec<CloneGuest>,
    #[serde(default)]
    pub topology: Vec<TopologySpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneSpec {
    pub range_id: Option<serde_yaml::Value>,
    #[serde(default)]
    pub hosts: Vec<CloneHost>,
}

impl CloneSpec {
    /// `range_id` may be written as an integer or a string.
    pub fn range_id_string(&self) -> Option<String> {
        match self.range_id.as_ref()? {
            serde_yaml::Value::Number(number) => Some(number.to_string()),
            serde_yaml::Value::String(string) => Some(string.clone()),
            _ => None,
        }
    }
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeDescription {
    #[serde(default)]
    pub host_settings: Vec<HostConfig>,
    #[serde(default)]
    pub guest_settings: Vec<GuestConfig>,
    #[serde(default)]
    pub clone_settings: Vec<CloneSpec>,
}

impl RangeDescription {
    pub fn load(path: &Path, reader: &impl FileReader) -> Result<Self, DescriptionError> {
        let content = reader.read(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, DescriptionError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn host(&self, host_id: &str) -> Option<&HostConfig> {
        self.host_settings
            .iter()
            .find(|host| host.host_id == host_id)
    }

    pub fn guest(&self, guest_id: &str) -> Option<&GuestConfig> {
        self.guest_settings
            .iter()
            .find(|guest| guest.guest_id == guest_id)
    }

    /// The single custom topology block of the first clone spec, when
    /// declared.
    pub fn topology(&self) -> Option<&TopologySpec> {
        self.clone_settings
            .first()?
            .hosts
            .first()?
            .topology
            .iter()
            .find(|spec| spec.kind == "custom")
    }

    /// Guests placed by the clone section, or every declared guest when no
    /// clone section narrows the set.
    pub fn placed_guests(&self) -> Vec<&GuestConfig> {
        let placed_ids: Vec<&str> = self
            .clone_settings
            .iter()
            .flat_map(|clone| &clone.hosts)
            .flat_map(|host| &host.guests)
            .map(|guest| guest.guest_id.as_str())
            .collect();
        if placed_ids.is_empty() {
            return self.guest_settings.iter().collect();
        }
        self.guest_settings
            .iter()
            .filter(|guest| placed_ids.contains(&guest.guest_id.as_str()))
            .collect()
    }

    /// Full cross-reference validation. Returns every problem found.
    pub fn validate(&self, legacy_build_task_compat: bool) -> Result<(), DescriptionError> {
        let mut errors = Vec::new();

        for guest in &self.guest_settings {
            let id = &guest.guest_id;
            match guest.basevm_type {
                BaseVmType::Kvm => {
                    if guest.basevm_config_file.is_none() {
                        errors.push(format!(
                            "guest `{id}`: kvm guests require `basevm_config_file`"
                        ));
                    }
                }
                BaseVmType::KvmAuto => {
                    for (field, missing) in [
                        ("image_name", guest.image_name.is_none()),
                        ("vcpus", guest.vcpus.is_none()),
                        ("memory", guest.memory.is_none()),
                        ("disk_size", guest.disk_size.is_none()),
                    ] {
                        if missing {
                            errors.push(format!(
                                "guest `{id}`: kvm-auto guests require `{field}`"
                            ));
                        }
                    }
                    if let Some(disk_size) = &guest.disk_size {
                        if !is_valid_disk_size(disk_size) {
                            errors.push(format!(
                                "guest `{id}`: disk_size `{disk_size}` is not like `20G`"
                            ));
                        }
                    }
                }
                BaseVmType::Aws | BaseVmType::Docker => {
                    errors.push(format!(
                        "guest `{id}`: provider `{:?}` is not supported by this host",
                        guest.basevm_type
                    ));
                }
            }

            if let Some(host_id) = &guest.basevm_host {
                if self.host(host_id).is_none() {
                    errors.push(format!(
                        "guest `{id}`: basevm_host `{host_id}` is not in host_settings"
                    ));
                }
            }
            if let Some(ip) = &guest.ip_addr {
                if ip.parse::<Ipv4Addr>().is_err() {
                    errors.push(format!("guest `{id}`: ip_addr `{ip}` is not IPv4"));
                }
            }

            match guest.parsed_tasks() {
                Ok(tasks) => {
                    for task in tasks {
                        if let TaskKind::Unknown { kind } = task {
                            if legacy_build_task_compat {
                                warn!(guest = %id, kind, "skipping unknown task kind");
                            } else {
                                errors.push(format!(
                                    "guest `{id}`: unknown task kind `{kind}`"
                                ));
                            }
                        }
                    }
                }
                Err(err) => errors.push(format!("guest `{id}`: {err}")),
            }
        }

        for clone in &self.clone_settings {
            for clone_host in &clone.hosts {
                if self.host(&clone_host.host_id).is_none() {
                    errors.push(format!(
                        "clone host `{}` is not in host_settings",
                        clone_host.host_id
                    ));
                }
                for clone_guest in &clone_host.guests {
                    if self.guest(&clone_guest.guest_id).is_none() {
                        errors.push(format!(
                            "clone guest `{}` is not in guest_settings",
                            clone_guest.guest_id
                        ));
                    }
                }

                let custom_blocks = clone_host
                    .topology
                    .iter()
                    .filter(|spec| spec.kind == "custom")
                    .count();
                if clone_host.topology.len() != custom_blocks
                    || (clone_host.topology.len() > 1)
                {
                    errors.push(format!(
                        "clone host `{}`: topology must be a single block of type `custom`",
                        clone_host.host_id
                    ));
                }

                for topology in &clone_host.topology {
                    self.validate_topology(topology, &mut errors);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DescriptionError::Validation(errors))
        }
    }

    fn validate_topology(&self, topology: &TopologySpec, errors: &mut Vec<String>) {
        for network in &topology.networks {
            for member in network.member_list() {
                let guest_id = member.split('.').next().unwrap_or(&member);
                if self.guest(guest_id).is_none() {
                    errors.push(format!(
                        "network `{}`: member `{member}` references unknown guest",
                        network.name
                    ));
                }
            }
        }
        for (index, rule_spec) in topology.forwarding_rules.iter().enumerate() {
            if let Err(message) = NetworkRule::parse(&rule_spec.rule) {
                errors.push(format!("forwarding rule {index}: {message}"));
            }
        }
    }
}

fn is_valid_disk_size(disk_size: &str) -> bool {
    let (digits, suffix) = disk_size.split_at(disk_size.len().saturating_sub(1));
    match suffix {
        "G" | "M" | "T" => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        _ => disk_size.chars().all(|c| c.is_ascii_digit()) && !disk_size.is_empty(),
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DESCRIPTION: &str = r#"
host_settings:
  - host_id: host_1
    mgmt_addr: localhost
    virbr_addr: 192.168.122.1
    account: ubuntu

guest_settings:
  - guest_id: desktop
    basevm_host: host_1
    basevm_config_file: /opt/cyris/basevm/desktop.xml
    basevm_type: kvm
    basevm_os_type: ubuntu_20
    tasks:
      - add_account:
          - account: daniel
            passwd: secret
  - guest_id: webserver
    basevm_host: host_1
    basevm_type: kvm-auto
    basevm_os_type: ubuntu_20
    image_name: ubuntu-20.04
    vcpus: 2
    memory: 2048
    disk_size: 20G

clone_settings:
  - range_id: 125
    hosts:
      - host_id: host_1
        instance_number: 1
        guests:
          - guest_id: desktop
            number: 1
            entry_point: true
          - guest_id: webserver
        topology:
          - type: custom
            networks:
              - name: office
                members: desktop.eth0
              - name: servers
                members:
                  - webserver.eth0
            forwarding_rules:
              - rule: src=office dst=servers dport=80,443
"#;

    #[test]
    fn test_full_description_parses_and_validates() {
        let description = RangeDescription::parse(FULL_DESCRIPTION).unwrap();
        description.validate(false).unwrap();

        assert_eq!(description.host_settings.len(), 1);
        assert_eq!(description.guest_settings.len(), 2);
        assert_eq!(
            description.clone_settings[0].range_id_string().as_deref(),
            Some("125")
        );

        let topology = description.topology().unwrap();
        assert_eq!(topology.networks.len(), 2);
        assert_eq!(
            topology.networks[0].member_list(),
            vec!["desktop.eth0".to_string()]
        );
        assert_eq!(topology.forwarding_rule_strings().len(), 1);

        let placed = description.placed_guests();
        assert_eq!(placed.len(), 2);
    }

    #[test]
    fn test_kvm_auto_requires_sizing_fields() {
        let description = RangeDescription {
            host_settings: Vec::new(),
            guest_settings: vec![GuestConfig {
                image_name: None,
                disk_size: None,
                basevm_host: None,
                ..GuestConfig::test_kvm_auto_guest("builder", "ubuntu-20.04")
            }],
            clone_settings: Vec::new(),
        };

        let err = description.validate(false).unwrap_err();
        let DescriptionError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert!(errors.iter().any(|e| e.contains("image_name")));
        assert!(errors.iter().any(|e| e.contains("disk_size")));
        assert!(!errors.iter().any(|e| e.contains("vcpus")));
    }

    #[test]
    fn test_kvm_requires_config_file() {
        let description = RangeDescription {
            host_settings: Vec::new(),
            guest_settings: vec![GuestConfig {
                basevm_config_file: None,
                basevm_host: None,
                ..GuestConfig::test_kvm_guest("desktop")
            }],
            clone_settings: Vec::new(),
        };

        let err = description.validate(false).unwrap_err();
        assert!(err.to_string().contains("basevm_config_file"));
    }

    #[test]
    fn test_aws_guests_are_unsupported() {
        let description = RangeDescription {
            host_settings: Vec::new(),
            guest_settings: vec![GuestConfig {
                basevm_type: BaseVmType::Aws,
                basevm_host: None,
                ..GuestConfig::test_kvm_guest("cloudy")
            }],
            clone_settings: Vec::new(),
        };

        let err = description.validate(false).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_unknown_guest_reference_is_reported() {
        let mut description = RangeDescription::parse(FULL_DESCRIPTION).unwrap();
        description.clone_settings[0].hosts[0].guests.push(CloneGuest {
            guest_id: "ghost".to_string(),
            number: 1,
            entry_point: false,
        });

        let err = description.validate(false).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_invalid_forwarding_rule_carries_its_index() {
        let mut description = RangeDescription::parse(FULL_DESCRIPTION).unwrap();
        description.clone_settings[0].hosts[0].topology[0]
            .forwarding_rules
            .push(ForwardingRuleSpec {
                rule: "src=office".to_string(),
            });

        let err = description.validate(false).unwrap_err();
        assert!(err.to_string().contains("forwarding rule 1"));
        assert!(err.to_string().contains("dst"));
    }

    #[test]
    fn test_unknown_task_kind_fails_without_compat() {
        let yaml = r#"
guest_settings:
  - guest_id: desktop
    basevm_config_file: /opt/cyris/basevm/desktop.xml
    basevm_type: kvm
    basevm_os_type: ubuntu_20
    tasks:
      - deploy_honeypot:
          - port: 8080
"#;
        let description = RangeDescription::parse(yaml).unwrap();

        let err = description.validate(false).unwrap_err();
        assert!(err.to_string().contains("deploy_honeypot"));

        // With the compatibility switch the description passes.
        description.validate(true).unwrap();
    }

    #[test]
    fn test_invalid_static_ip_is_reported() {
        let description = RangeDescription {
            host_settings: Vec::new(),
            guest_settings: vec![GuestConfig {
                ip_addr: Some("not-an-ip".to_string()),
                basevm_host: None,
                ..GuestConfig::test_kvm_guest("desktop")
            }],
            clone_settings: Vec::new(),
        };

        let err = description.validate(false).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[rstest::rstest]
    #[case("20G", true)]
    #[case("512M", true)]
    #[case("1T", true)]
    #[case("20", true)]
    #[case("G", false)]
    #[case("20X", false)]
    #[case("", false)]
    fn test_disk_size_format(#[case] size: &str, #[case] valid: bool) {
        assert_eq!(is_valid_disk_size(size), valid);
    }
}
