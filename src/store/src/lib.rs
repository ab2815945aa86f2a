// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared key-value store interface for the Stratus fleet.
//!
//! Every host in a deployment points at the same store, which carries three
//! kinds of state: membership sets (which hosts are alive, which hosts can
//! serve a given role), plain keys with optional expiry (function status
//! blobs), and blob queues with blocking dequeue (function results). The
//! scheduler consumes the store exclusively through the [`KeyValueStore`]
//! trait; production deployments back it with an external store while tests
//! use the process-local [`MemoryStore`].

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

mod memory;

pub use crate::memory::MemoryStore;

/// A handle to the deployment-wide key-value store.
///
/// All operations are fallible: implementations talk to an external system
/// and surface transport errors to the caller. Implementations must be safe
/// to share across tasks.
#[async_trait]
pub trait KeyValueStore: fmt::Debug + Send + Sync {
    /// Adds `member` to the set named `set`.
    async fn set_add(&self, set: &str, member: &str) -> Result<(), anyhow::Error>;

    /// Removes `member` from the set named `set`.
    async fn set_remove(&self, set: &str, member: &str) -> Result<(), anyhow::Error>;

    /// Returns all members of the set named `set`.
    async fn set_members(&self, set: &str) -> Result<BTreeSet<String>, anyhow::Error>;

    /// Returns the value stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, anyhow::Error>;

    /// Stores `value` at `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), anyhow::Error>;

    /// Deletes `key`, whether it names a value, a queue, or a set.
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;

    /// Deletes `key` only if its current value equals `value`.
    ///
    /// Returns whether the key was deleted. The comparison and deletion are
    /// atomic with respect to concurrent writers; lock helpers rely on this
    /// to release only locks they still hold.
    async fn delete_if_equals(&self, key: &str, value: &[u8]) -> Result<bool, anyhow::Error>;

    /// Marks `key` to expire after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), anyhow::Error>;

    /// Appends `value` to the queue named `key`.
    async fn enqueue(&self, key: &str, value: Vec<u8>) -> Result<(), anyhow::Error>;

    /// Removes and returns the head of the queue named `key`, waiting up to
    /// `timeout` for an element to arrive.
    ///
    /// Returns `None` if the timeout elapses first. A zero timeout polls the
    /// queue without waiting.
    async fn dequeue(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, anyhow::Error>;

    /// Publishes a function result: pushes `payload` onto the queue at
    /// `result_key`, stores it at `status_key`, and applies the respective
    /// expiries, all atomically.
    ///
    /// Consumers block on the queue, while late readers poll the status key,
    /// so partially applied publishes would strand one or the other.
    async fn publish_result(
        &self,
        result_key: &str,
        status_key: &str,
        payload: Vec<u8>,
        result_ttl: Duration,
        status_ttl: Duration,
    ) -> Result<(), anyhow::Error>;
}
