// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A process-local [`KeyValueStore`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time;

use crate::KeyValueStore;

/// An in-memory [`KeyValueStore`].
///
/// Single-process deployments and tests use this in place of an external
/// store. Expiry is applied lazily: an expired entry is dropped the next time
/// anything touches its key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    sets: HashMap<String, BTreeSet<String>>,
    values: HashMap<String, Vec<u8>>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    queue_signals: HashMap<String, Arc<Notify>>,
    expiries: HashMap<String, Instant>,
}

impl StoreState {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.sets.remove(key);
                self.values.remove(key);
                self.queues.remove(key);
            }
        }
    }

    fn queue_signal(&mut self, key: &str) -> Arc<Notify> {
        Arc::clone(
            self.queue_signals
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn try_dequeue(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(key);
        let queue = state.queues.get_mut(key)?;
        let head = queue.pop_front();
        if !queue.is_empty() {
            // Hand the permit on so a second waiter sees the remaining
            // elements.
            state.queue_signal(key).notify_one();
        }
        head
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_add(&self, set: &str, member: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(set);
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(set);
        if let Some(members) = state.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<BTreeSet<String>, anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(set);
        Ok(state.sets.get(set).cloned().unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(key);
        Ok(state.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.values.insert(key.to_string(), value);
        state.expiries.remove(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.sets.remove(key);
        state.values.remove(key);
        state.queues.remove(key);
        state.expiries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(key);
        match state.values.get(key) {
            Some(current) if current == value => {
                state.values.remove(key);
                state.expiries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn enqueue(&self, key: &str, value: Vec<u8>) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.purge_expired(key);
        state
            .queues
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        state.queue_signal(key).notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, anyhow::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_dequeue(key) {
                return Ok(Some(value));
            }
            let signal = {
                let mut state = self.state.lock().expect("lock poisoned");
                state.queue_signal(key)
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A push may have raced us between the failed pop and this wait;
            // `Notify` stores that permit, so we wake immediately and re-check.
            if time::timeout(remaining, signal.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn publish_result(
        &self,
        result_key: &str,
        status_key: &str,
        payload: Vec<u8>,
        result_ttl: Duration,
        status_ttl: Duration,
    ) -> Result<(), anyhow::Error> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .queues
            .entry(result_key.to_string())
            .or_default()
            .push_back(payload.clone());
        state.values.insert(status_key.to_string(), payload);
        state.expiries.insert(result_key.to_string(), now + result_ttl);
        state.expiries.insert(status_key.to_string(), now + status_ttl);
        state.queue_signal(result_key).notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.set_add("hosts", "a").await.unwrap();
        store.set_add("hosts", "b").await.unwrap();
        store.set_add("hosts", "a").await.unwrap();
        assert_eq!(
            store.set_members("hosts").await.unwrap(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        store.set_remove("hosts", "a").await.unwrap();
        assert_eq!(
            store.set_members("hosts").await.unwrap(),
            BTreeSet::from(["b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let store = Arc::new(MemoryStore::new());
        let reader = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            reader.dequeue("q", Duration::from_secs(5)).await.unwrap()
        });
        tokio::task::yield_now().await;
        store.enqueue("q", b"payload".to_vec()).await.unwrap();
        assert_eq!(handle.await.unwrap(), Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn test_dequeue_times_out() {
        let store = MemoryStore::new();
        let got = store.dequeue("q", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_publish_result_feeds_queue_and_status() {
        let store = MemoryStore::new();
        store
            .publish_result(
                "result",
                "status",
                b"out".to_vec(),
                Duration::from_secs(60),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(
            store.dequeue("result", Duration::ZERO).await.unwrap(),
            Some(b"out".to_vec())
        );
        assert_eq!(store.get("status").await.unwrap(), Some(b"out".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = MemoryStore::new();
        store.set("lock", b"me".to_vec()).await.unwrap();
        assert!(!store.delete_if_equals("lock", b"you").await.unwrap());
        assert!(store.delete_if_equals("lock", b"me").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_purges_lazily() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec()).await.unwrap();
        store.expire("k", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
