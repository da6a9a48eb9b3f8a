//! Hypervisor connection reuse.
//!
//! Connections are cached per thread and per URI, health-checked before
//! reuse and reopened transparently when dead. Callers never hold a raw
//! connection: all access goes through [ConnectionPool::with_connection],
//! which scopes the borrow so the connection is back in the cache on every
//! exit path.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::debug;
use virt::connect::Connect;

use crate::hypervisor::error::HypervisorError;

/// Idle connections kept per thread across all URIs.
const MAX_CACHED_CONNECTIONS: usize = 4;

thread_local! {
    static CONNECTIONS: RefCell<HashMap<String, Connect>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone)]
pub struct ConnectionPool {
    uri: String,
}

impl ConnectionPool {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Runs `f` with a live connection for this pool's URI.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, HypervisorError>
    where
        F: FnOnce(&Connect) -> Result<T, HypervisorError>,
    {
        CONNECTIONS.with(|cell| {
            let mut cache = cell.borrow_mut();

            let stale = cache
                .get(&self.uri)
                .map(|conn| !conn.is_alive().unwrap_or(false))
                .unwrap_or(false);
            if stale {
                debug!(uri = %self.uri, "cached hypervisor connection is dead, reopening");
                if let Some(mut dead) = cache.remove(&self.uri) {
                    let _ = dead.close();
                }
            }

            if !cache.contains_key(&self.uri) {
                let conn =
                    Connect::open(Some(&self.uri)).map_err(|source| HypervisorError::Connect {
                        uri: self.uri.clone(),
                        source,
                    })?;
                Self::evict_over_cap(&mut cache);
                cache.insert(self.uri.clone(), conn);
            }

            let conn = cache
                .get(&self.uri)
                .expect("connection was inserted above");
            f(conn)
        })
    }

    fn evict_over_cap(cache: &mut HashMap<String, Connect>) {
        while cache.len() >= MAX_CACHED_CONNECTIONS {
            let Some(uri) = cache.keys().next().cloned() else {
                break;
            };
            if let Some(mut evicted) = cache.remove(&uri) {
                debug!(%uri, "closing idle hypervisor connection over cap");
                let _ = evicted.close();
            }
        }
    }
}
