use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("command refused by safety validator (matched `{pattern}`): {command}")]
pub struct SafetyError {
    pub command: String,
    pub pattern: String,
}

/// Denylist of obviously destructive host commands. Anything matching is
/// refused with a structured error instead of being spawned.
pub struct SafetyValidator {
    denylist: Vec<(Regex, &'static str)>,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyValidator {
    pub fn new() -> Self {
        let patterns: [(&str, &str); 6] = [
            (r"rm\s+(-\w+\s+)*-\w*[rR]\w*\s+/(\s|$)", "recursive delete of /"),
            (r"\bmkfs(\.\w+)?\b", "filesystem creation"),
            (r"\bdd\b.*\bof=/dev/(sd|vd|nvme|hd)", "raw write to block device"),
            (r">\s*/dev/(sd|vd|nvme|hd)", "redirect to block device"),
            (r"\bwipefs\b", "signature wipe"),
            (r":\(\)\s*\{.*\};\s*:", "fork bomb"),
        ];
        Self {
            denylist: patterns
                .into_iter()
                .map(|(pattern, name)| {
                    (
                        Regex::new(pattern).expect("safety pattern should be valid"),
                        name,
                    )
                })
                .collect(),
        }
    }

    pub fn validate(&self, command: &str) -> Result<(), SafetyError> {
        for (regex, name) in &self.denylist {
            if regex.is_match(command) {
                return Err(SafetyError {
                    command: command.to_string(),
                    pattern: (*name).to_string(),
                });
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("rm -rf /")]
    #[case("rm -r -f /")]
    #[case("sudo rm -Rf / ")]
    #[case("mkfs.ext4 /dev/sda1")]
    #[case("dd if=/dev/zero of=/dev/sda")]
    #[case("echo x > /dev/sdb")]
    #[case("wipefs -a /dev/vda")]
    #[case(":(){ :|:& };:")]
    fn test_destructive_commands_are_refused(#[case] command: &str) {
        let validator = SafetyValidator::new();
        assert!(validator.validate(command).is_err());
    }

    #[rstest]
    #[case("virsh list --all")]
    #[case("rm -rf /tmp/cyris-builds/desktop.qcow2")]
    #[case("iptables -A CYRIS_FORWARD -s 192.168.100.0/24 -j ACCEPT")]
    #[case("virt-builder ubuntu-20.04 --format qcow2")]
    #[case("scp disk.qcow2 user@host:/var/lib/cyris/")]
    fn test_ordinary_commands_pass(#[case] command: &str) {
        let validator = SafetyValidator::new();
        assert!(validator.validate(command).is_ok());
    }

    #[test]
    fn test_error_names_the_matched_pattern() {
        let err = SafetyValidator::new().validate("rm -rf /").unwrap_err();
        assert_eq!(err.pattern, "recursive delete of /");
        assert!(err.to_string().contains("rm -rf /"));
    }
}
