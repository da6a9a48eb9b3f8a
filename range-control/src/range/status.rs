//! Detailed range status: stored metadata joined with live hypervisor
//! state, discovered addresses and an SSH reachability probe. Cached with a
//! short TTL so `list --verbose` over many ranges stays bounded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::defaults;
use crate::hypervisor::DomainState;
use crate::range::entity::RangeMetadata;

#[derive(Debug, Clone, Serialize)]
pub struct GuestStatus {
    pub guest_id: String,
    pub domain_name: String,
    pub state: Option<DomainState>,
    pub ip_addresses: Vec<String>,
    pub ssh_reachable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedStatus {
    pub metadata: RangeMetadata,
    pub guests: Vec<GuestStatus>,
}

/// TTL cache over detailed status lookups.
pub struct StatusCache {
    entries: Mutex<HashMap<String, (Instant, DetailedStatus)>>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl StatusCache {
    pub fn get(&self, range_id: &str) -> Option<DetailedStatus> {
        let entries = self.entries.lock().expect("status cache lock");
        let (cached_at, status) = entries.get(range_id)?;
        (cached_at.elapsed() < defaults::STATUS_CACHE_TTL).then(|| status.clone())
    }

    pub fn put(&self, range_id: &str, status: DetailedStatus) {
        self.entries
            .lock()
            .expect("status cache lock")
            .insert(range_id.to_string(), (Instant::now(), status));
    }

    pub fn invalidate(&self, range_id: &str) {
        self.entries
            .lock()
            .expect("status cache lock")
            .remove(range_id);
    }
}
