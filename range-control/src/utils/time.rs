use chrono::{DateTime, Utc};

/// Current time in RFC 3339, the format used across range metadata and
/// audit trails.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
