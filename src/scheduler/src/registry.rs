// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fleet membership.
//!
//! Hosts announce themselves by joining role-keyed sets in the shared store:
//! compute hosts join [`AVAILABLE_HOST_SET`], storage hosts join
//! [`AVAILABLE_STORAGE_HOST_SET`] (and, permanently for the life of the
//! process, [`ALL_STORAGE_HOST_SET`]). Reads go through a short-lived cache
//! so that scheduling a large batch does not hammer the store; membership is
//! only eventually consistent anyway, so a slightly stale view is fine.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stratus_scheduler_client::Message;
use stratus_store::KeyValueStore;

/// The set of compute hosts accepting work.
pub const AVAILABLE_HOST_SET: &str = "available_hosts";

/// The set of storage hosts accepting work.
pub const AVAILABLE_STORAGE_HOST_SET: &str = "available_storage_hosts";

/// The set of every storage host that has ever joined the deployment.
pub const ALL_STORAGE_HOST_SET: &str = "all_storage_hosts";

/// How long a cached membership read stays fresh.
pub const HOST_CACHE_TTL: Duration = Duration::from_secs(10);

/// Returns the available-set a host of the given kind belongs to.
pub fn global_set_name(is_storage_node: bool) -> &'static str {
    if is_storage_node {
        AVAILABLE_STORAGE_HOST_SET
    } else {
        AVAILABLE_HOST_SET
    }
}

/// Returns the available-set from which hosts for `msg` must be drawn.
pub fn set_name_for_message(msg: &Message) -> &'static str {
    global_set_name(msg.is_storage)
}

/// A cached view of fleet membership.
#[derive(Debug)]
pub struct HostRegistry {
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<HashMap<String, (Instant, BTreeSet<String>)>>,
}

impl HostRegistry {
    /// Creates a registry backed by `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> HostRegistry {
        HostRegistry {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `host` to the membership set named `set`.
    pub async fn add_host(&self, set: &str, host: &str) -> Result<(), anyhow::Error> {
        self.store.set_add(set, host).await
    }

    /// Removes `host` from the membership set named `set`.
    pub async fn remove_host(&self, set: &str, host: &str) -> Result<(), anyhow::Error> {
        self.store.set_remove(set, host).await
    }

    /// Returns the members of `set`, tolerating reads up to `max_staleness`
    /// old. A zero staleness always asks the store.
    pub async fn list_hosts(
        &self,
        set: &str,
        max_staleness: Duration,
    ) -> Result<BTreeSet<String>, anyhow::Error> {
        if !max_staleness.is_zero() {
            let cache = self.cache.lock().expect("lock poisoned");
            if let Some((read_at, members)) = cache.get(set) {
                if read_at.elapsed() < max_staleness {
                    return Ok(members.clone());
                }
            }
        }
        let members = self.store.set_members(set).await?;
        let mut cache = self.cache.lock().expect("lock poisoned");
        cache.insert(set.to_string(), (Instant::now(), members.clone()));
        Ok(members)
    }

    /// Returns the hosts eligible to run `msg`, by role.
    pub async fn list_hosts_for_message(
        &self,
        msg: &Message,
    ) -> Result<BTreeSet<String>, anyhow::Error> {
        self.list_hosts(set_name_for_message(msg), HOST_CACHE_TTL)
            .await
    }
}

#[cfg(test)]
mod tests {
    use stratus_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_list_hosts_caches_reads() {
        let store = Arc::new(MemoryStore::new());
        let registry = HostRegistry::new(Arc::clone(&store) as Arc<dyn KeyValueStore>);

        registry.add_host(AVAILABLE_HOST_SET, "a").await.unwrap();
        let first = registry
            .list_hosts(AVAILABLE_HOST_SET, HOST_CACHE_TTL)
            .await
            .unwrap();
        assert_eq!(first, BTreeSet::from(["a".to_string()]));

        // A membership change within the staleness window is invisible...
        registry.add_host(AVAILABLE_HOST_SET, "b").await.unwrap();
        let cached = registry
            .list_hosts(AVAILABLE_HOST_SET, HOST_CACHE_TTL)
            .await
            .unwrap();
        assert_eq!(cached, first);

        // ...but a zero-staleness read sees it and refreshes the cache.
        let fresh = registry
            .list_hosts(AVAILABLE_HOST_SET, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            fresh,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_set_names_by_role() {
        assert_eq!(global_set_name(false), AVAILABLE_HOST_SET);
        assert_eq!(global_set_name(true), AVAILABLE_STORAGE_HOST_SET);
        let mut msg = Message::new("alpha", "beta");
        assert_eq!(set_name_for_message(&msg), AVAILABLE_HOST_SET);
        msg.is_storage = true;
        assert_eq!(set_name_for_message(&msg), AVAILABLE_STORAGE_HOST_SET);
    }
}
