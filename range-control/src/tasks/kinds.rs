//! Guest customization task kinds.
//!
//! The YAML form is a list of single-key maps, each key naming the kind and
//! carrying a list of parameter maps:
//!
//! ```yaml
//! tasks:
//!   - add_account:
//!       - account: daniel
//!         passwd: secret
//!   - install_package:
//!       - package_manager: apt
//!         name: wireshark
//! ```
//!
//! Kinds form a closed set. Unknown kinds parse into [TaskKind::Unknown] and
//! are rejected at validation unless the legacy build-task compatibility
//! switch is on, in which case they are logged and skipped for build-time
//! execution only.

use serde_yaml::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TaskParseError {
    #[error("task entry {index} is not a single-key mapping")]
    NotAMapping { index: usize },

    #[error("task `{kind}` entry {index} is missing required field `{field}`")]
    MissingField {
        kind: String,
        index: usize,
        field: String,
    },

    #[error("task `{kind}` entry {index}: field `{field}` has an invalid value")]
    InvalidField {
        kind: String,
        index: usize,
        field: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    AddAccount {
        account: String,
        passwd: String,
    },
    ModifyAccount {
        account: String,
        new_passwd: Option<String>,
        new_account: Option<String>,
    },
    InstallPackage {
        package_manager: String,
        name: String,
        version: Option<String>,
    },
    CopyContent {
        src: String,
        dst: String,
    },
    ExecuteProgram {
        program: String,
        interpreter: Option<String>,
        args: Option<String>,
    },
    EmulateAttack {
        attack_type: String,
        target_account: Option<String>,
        attempt_number: Option<u32>,
    },
    EmulateMalware {
        name: String,
        mode: Option<String>,
    },
    FirewallRules {
        rule_file: String,
    },
    /// Kind not in the closed set. Carried through parsing so validation
    /// can name the offending key.
    Unknown {
        kind: String,
    },
}

impl TaskKind {
    /// Build-time tasks are applied to the disk image before first boot;
    /// everything else runs post-boot over SSH.
    pub fn is_build_time(&self) -> bool {
        matches!(
            self,
            TaskKind::AddAccount { .. } | TaskKind::ModifyAccount { .. }
        )
    }

    pub fn kind_name(&self) -> &str {
        match self {
            TaskKind::AddAccount { .. } => "add_account",
            TaskKind::ModifyAccount { .. } => "modify_account",
            TaskKind::InstallPackage { .. } => "install_package",
            TaskKind::CopyContent { .. } => "copy_content",
            TaskKind::ExecuteProgram { .. } => "execute_program",
            TaskKind::EmulateAttack { .. } => "emulate_attack",
            TaskKind::EmulateMalware { .. } => "emulate_malware",
            TaskKind::FirewallRules { .. } => "firewall_rules",
            TaskKind::Unknown { kind } => kind,
        }
    }
}

/// Parses a `tasks:` YAML sequence into task kinds, preserving order.
pub fn parse_tasks(tasks: &[Value]) -> Result<Vec<TaskKind>, TaskParseError> {
    let mut parsed = Vec::new();
    for (index, entry) in tasks.iter().enumerate() {
        let mapping = entry
            .as_mapping()
            .filter(|mapping| mapping.len() == 1)
            .ok_or(TaskParseError::NotAMapping { index })?;
        let (key, params) = mapping
            .iter()
            .next()
            .expect("mapping with one entry has a first entry");
        let kind = key.as_str().unwrap_or_default().to_string();

        let param_entries: Vec<&Value> = match params {
            Value::Sequence(values) => values.iter().collect(),
            // A bare mapping is accepted as a single entry.
            Value::Mapping(_) => vec![params],
            _ => {
                return Err(TaskParseError::InvalidField {
                    kind,
                    index,
                    field: "parameters".to_string(),
                })
            }
        };

        for params in param_entries {
            parsed.push(parse_one(&kind, index, params)?);
        }
    }
    Ok(parsed)
}

fn parse_one(kind: &str, index: usize, params: &Value) -> Result<TaskKind, TaskParseError> {
    let required = |field: &str| -> Result<String, TaskParseError> {
        params
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TaskParseError::MissingField {
                kind: kind.to_string(),
                index,
                field: field.to_string(),
            })
    };
    let optional = |field: &str| -> Option<String> {
        params
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let optional_u32 = |field: &str| -> Option<u32> {
        params
            .get(field)
            .and_then(Value::as_u64)
            .map(|value| value as u32)
    };

    let task = match kind {
        "add_account" => TaskKind::AddAccount {
            account: required("account")?,
            passwd: required("passwd")?,
        },
        "modify_account" => TaskKind::ModifyAccount {
            account: required("account")?,
            new_passwd: optional("new_passwd"),
            new_account: optional("new_account"),
        },
        "install_package" => TaskKind::InstallPackage {
            package_manager: optional("package_manager").unwrap_or_else(|| "apt-get".to_string()),
            name: required("name")?,
            version: optional("version"),
        },
        "copy_content" => TaskKind::CopyContent {
            src: required("src")?,
            dst: required("dst")?,
        },
        "execute_program" => TaskKind::ExecuteProgram {
            program: required("program")?,
            interpreter: optional("interpreter"),
            args: optional("args"),
        },
        "emulate_attack" => TaskKind::EmulateAttack {
            attack_type: required("attack_type")?,
            target_account: optional("target_account"),
            attempt_number: optional_u32("attempt_number"),
        },
        "emulate_malware" => TaskKind::EmulateMalware {
            name: required("name")?,
            mode: optional("mode"),
        },
        "firewall_rules" => TaskKind::FirewallRules {
            rule_file: required("rule_file")?,
        },
        other => TaskKind::Unknown {
            kind: other.to_string(),
        },
    };
    Ok(task)
}
