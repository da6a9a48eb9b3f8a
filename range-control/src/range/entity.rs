use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::topology::RangeNetwork;
use crate::utils::time;

/// Lifecycle state of a range. Exactly one at a time; transitions are
/// enforced by [RangeMetadata::transition].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    Creating,
    Active,
    Error,
    Destroying,
    Destroyed,
}

impl RangeStatus {
    pub fn can_transition_to(self, next: RangeStatus) -> bool {
        matches!(
            (self, next),
            (RangeStatus::Creating, RangeStatus::Active)
                | (RangeStatus::Creating, RangeStatus::Error)
                | (RangeStatus::Active, RangeStatus::Destroying)
                | (RangeStatus::Error, RangeStatus::Destroying)
                | (RangeStatus::Destroying, RangeStatus::Destroyed)
        )
    }

    /// Only these states may start a destroy sequence.
    pub fn is_destroyable(self) -> bool {
        matches!(self, RangeStatus::Active | RangeStatus::Error)
    }
}

impl Display for RangeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            RangeStatus::Creating => "creating",
            RangeStatus::Active => "active",
            RangeStatus::Error => "error",
            RangeStatus::Destroying => "destroying",
            RangeStatus::Destroyed => "destroyed",
        };
        write!(f, "{name}")
    }
}

/// Handles to everything a range allocated, kept so teardown and
/// diagnostics survive process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceIds {
    pub hosts: Vec<String>,
    pub domains: Vec<String>,
    pub policy_id: Option<String>,
}

/// Durable record of one range, as persisted in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeMetadata {
    pub range_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub status: RangeStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub provider_config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub resource_ids: ResourceIds,
    /// guest_id → assigned IP.
    #[serde(default)]
    pub vm_ips: HashMap<String, String>,
    /// network name → realized network record.
    #[serde(default)]
    pub networks: HashMap<String, RangeNetwork>,
}

impl RangeMetadata {
    pub fn new(range_id: impl Into<String>) -> Self {
        let range_id = range_id.into();
        let now = time::now();
        Self {
            name: format!("range-{range_id}"),
            range_id,
            description: String::new(),
            owner: String::new(),
            tags: HashMap::new(),
            status: RangeStatus::Creating,
            created_at: now,
            last_modified: now,
            provider_config: HashMap::new(),
            resource_ids: ResourceIds::default(),
            vm_ips: HashMap::new(),
            networks: HashMap::new(),
        }
    }

    /// Moves to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: RangeStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                range_id: self.range_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_modified = time::now();
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("range `{range_id}` cannot move from `{from}` to `{to}`")]
pub struct InvalidTransition {
    pub range_id: String,
    pub from: RangeStatus,
    pub to: RangeStatus,
}

////////////////////////////////////////////////////////////////////////////////////
// TESTS
////////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut range = RangeMetadata::new("77");
        assert_eq!(range.status, RangeStatus::Creating);

        range.transition(RangeStatus::Active).unwrap();
        range.transition(RangeStatus::Destroying).unwrap();
        range.transition(RangeStatus::Destroyed).unwrap();
    }

    #[test]
    fn test_creating_may_fail_into_error_then_destroy() {
        let mut range = RangeMetadata::new("77");
        range.transition(RangeStatus::Error).unwrap();
        range.transition(RangeStatus::Destroying).unwrap();
        range.transition(RangeStatus::Destroyed).unwrap();
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let mut range = RangeMetadata::new("77");
        assert!(range.transition(RangeStatus::Destroyed).is_err());
        assert!(range.transition(RangeStatus::Destroying).is_err());

        range.transition(RangeStatus::Active).unwrap();
        assert!(range.transition(RangeStatus::Creating).is_err());
        assert!(range.transition(RangeStatus::Error).is_err());
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let mut range = RangeMetadata::new("77");
        range.transition(RangeStatus::Error).unwrap();
        range.transition(RangeStatus::Destroying).unwrap();
        range.transition(RangeStatus::Destroyed).unwrap();

        for next in [
            RangeStatus::Creating,
            RangeStatus::Active,
            RangeStatus::Error,
            RangeStatus::Destroying,
        ] {
            assert!(range.transition(next).is_err());
        }
    }

    #[test]
    fn test_transitions_update_last_modified() {
        let mut range = RangeMetadata::new("77");
        let before = range.last_modified;
        std::thread::sleep(std::time::Duration::from_millis(2));
        range.transition(RangeStatus::Active).unwrap();
        assert!(range.last_modified > before);
    }

    #[test]
    fn test_metadata_survives_json_round_trip() {
        let mut range = RangeMetadata::new("77");
        range.owner = "instructor".to_string();
        range
            .tags
            .insert("course".to_string(), "forensics".to_string());
        range
            .vm_ips
            .insert("desktop".to_string(), "192.168.100.42".to_string());
        range.resource_ids.domains.push("cyris-desktop-77".to_string());

        let json = serde_json::to_string(&range).unwrap();
        let parsed: RangeMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.range_id, "77");
        assert_eq!(parsed.vm_ips["desktop"], "192.168.100.42");
        assert_eq!(parsed.resource_ids, range.resource_ids);
    }
}
