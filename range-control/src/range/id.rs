use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use thiserror::Error;

const RANGE_ID_MAX_LENGTH: usize = 32;

/// Stable identifier of a range. Short, filesystem- and interface-name
/// safe: it is embedded in libvirt network names, bridge device names and
/// directory paths.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Hash)]
#[serde(try_from = "String")]
pub struct RangeId(String);

#[derive(Error, Debug, PartialEq)]
pub enum RangeIdError {
    #[error("range id must be 1-32 characters of [a-z0-9-], starting alphanumeric")]
    InvalidFormat,
}

impl RangeId {
    pub fn new(id: &str) -> Result<Self, RangeIdError> {
        Self::try_from(id.to_string())
    }

    pub fn get(&self) -> String {
        self.0.clone()
    }

    /// Next free auto-assigned id: integers serialized as strings, one
    /// past the highest numeric id already in use.
    pub fn next_auto(existing: &[String]) -> Self {
        let highest = existing
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        RangeId((highest + 1).to_string())
    }

    fn is_valid_format(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= RANGE_ID_MAX_LENGTH
            && id.starts_with(|c: char| c.is_ascii_alphanumeric())
            && id
                .chars()
                .all(|c| c.eq(&'-') || c.is_ascii_digit() || c.is_ascii_lowercase())
    }
}

impl TryFrom<String> for RangeId {
    type Error = RangeIdError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        if Self::is_valid_format(&id) {
            Ok(RangeId(id))
        } else {
            Err(RangeIdError::InvalidFormat)
        }
    }
}

impl Deref for RangeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_id_validator() {
        assert!(RangeId::new("125").is_ok());
        assert!(RangeId::new("training-2026").is_ok());
        assert!(RangeId::new("a").is_ok());
        assert!(RangeId::new(&"a".repeat(32)).is_ok());

        assert!(RangeId::new("").is_err());
        assert!(RangeId::new(&"a".repeat(33)).is_err());
        assert!(RangeId::new("-125").is_err());
        assert!(RangeId::new("Range125").is_err());
        assert!(RangeId::new("a b").is_err());
        assert!(RangeId::new("a/b").is_err());
    }

    #[test]
    fn test_auto_assignment_is_one_past_highest() {
        assert_eq!(RangeId::next_auto(&[]).get(), "1");
        assert_eq!(
            RangeId::next_auto(&["1".to_string(), "125".to_string()]).get(),
            "126"
        );
        // Non-numeric ids do not disturb the counter.
        assert_eq!(
            RangeId::next_auto(&["training-a".to_string(), "2".to_string()]).get(),
            "3"
        );
    }
}
