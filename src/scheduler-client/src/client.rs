// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client traits for the scheduler's collaborators.
//!
//! The scheduler never talks to a transport directly: it asks a
//! [`ClientFactory`] for per-host [`FunctionCallClient`] and
//! [`SnapshotClient`] handles and calls through them. The same verbs are
//! mirrored on the served side as [`FunctionCallRequest`] /
//! [`FunctionCallResponse`], so a transport is a thin loop that decodes a
//! request, hands it to the server, and encodes the response.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decision::SchedulingDecision;
use crate::message::{
    BatchRequest, HostResources, Message, PendingMigrations, UnregisterRequest,
};

/// A connection to a peer scheduler's function-call surface.
#[async_trait]
pub trait FunctionCallClient: Debug + Send + Sync {
    /// Hands the peer a batch it must execute locally.
    async fn execute_functions(&self, req: BatchRequest) -> Result<(), anyhow::Error>;

    /// Tells the peer to flush its executors and caches.
    async fn send_flush(&self) -> Result<(), anyhow::Error>;

    /// Asks the peer for its current slot accounting.
    async fn get_resources(&self) -> Result<HostResources, anyhow::Error>;

    /// Tells the peer (a master) that `req.host` no longer keeps executors
    /// warm for the function.
    async fn unregister(&self, req: UnregisterRequest) -> Result<(), anyhow::Error>;

    /// Delivers a finished message straight into the peer's local slot table.
    async fn send_direct_result(&self, msg: Message) -> Result<(), anyhow::Error>;

    /// Announces planned migrations to a host involved in the app.
    async fn send_pending_migrations(&self, pm: PendingMigrations) -> Result<(), anyhow::Error>;

    /// Fetches the NDP delta registered under `id` on the peer.
    async fn ndp_delta_request(&self, id: u32) -> Result<Vec<u8>, anyhow::Error>;
}

/// A connection to a peer's snapshot surface.
#[async_trait]
pub trait SnapshotClient: Debug + Send + Sync {
    /// Pushes a full snapshot to the peer.
    async fn push_snapshot(
        &self,
        key: &str,
        snap: Arc<dyn Snapshot>,
    ) -> Result<(), anyhow::Error>;

    /// Pushes only the changes tracked since the snapshot was last pushed.
    async fn push_snapshot_update(
        &self,
        key: &str,
        snap: Arc<dyn Snapshot>,
        diffs: Vec<SnapshotDiff>,
    ) -> Result<(), anyhow::Error>;

    /// Deletes the peer's copy of a snapshot.
    async fn delete_snapshot(&self, key: &str) -> Result<(), anyhow::Error>;

    /// Reports a thread's result to its master, together with the memory
    /// diffs the thread produced.
    async fn push_thread_result(
        &self,
        msg_id: u32,
        return_value: i32,
        key: &str,
        diffs: Vec<SnapshotDiff>,
    ) -> Result<(), anyhow::Error>;
}

/// Creates per-host clients for the scheduler's connection pool.
///
/// Implementations are expected to be cheap: the pool caches the returned
/// handles for the lifetime of the scheduler, so setup cost is paid once per
/// remote.
pub trait ClientFactory: Debug + Send + Sync {
    /// Creates a function-call client for `host`.
    fn function_call_client(&self, host: &str) -> Arc<dyn FunctionCallClient>;

    /// Creates a snapshot client for `host`.
    fn snapshot_client(&self, host: &str) -> Arc<dyn SnapshotClient>;
}

/// The point-to-point broker used by collective (grouped) messages.
#[async_trait]
pub trait Broker: Debug + Send + Sync {
    /// Publishes the group-index to host mapping derived from a decision so
    /// that group members can find each other.
    async fn set_and_send_mappings(
        &self,
        decision: &SchedulingDecision,
    ) -> Result<(), anyhow::Error>;

    /// Drops all published mappings.
    fn clear(&self);
}

/// One contiguous changed region of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// Byte offset of the change within the snapshot.
    pub offset: usize,
    /// The new contents at that offset.
    pub data: Vec<u8>,
}

/// A handle to one snapshot held by the snapshot subsystem.
///
/// The diff engine itself is out of the scheduler's hands; the scheduler
/// only needs to read and reset the change-tracking state around a push, and
/// to queue diffs arriving from remote threads.
pub trait Snapshot: Debug + Send + Sync {
    /// Returns the changes tracked since the last [`clear_tracked_changes`].
    ///
    /// [`clear_tracked_changes`]: Snapshot::clear_tracked_changes
    fn tracked_changes(&self) -> Vec<SnapshotDiff>;

    /// Resets change tracking.
    fn clear_tracked_changes(&self);

    /// Queues diffs for merging into this snapshot.
    fn queue_diffs(&self, diffs: Vec<SnapshotDiff>);
}

/// Looks up snapshots by key.
pub trait SnapshotRegistry: Debug + Send + Sync {
    /// Returns the snapshot stored under `key`.
    fn get_snapshot(&self, key: &str) -> Result<Arc<dyn Snapshot>, anyhow::Error>;
}

/// A request arriving at a scheduler's served function-call surface.
///
/// Mirrors the verbs of [`FunctionCallClient`].
#[derive(Clone, Debug)]
pub enum FunctionCallRequest {
    /// Execute a batch locally.
    ExecuteFunctions(BatchRequest),
    /// Flush executors and caches.
    Flush,
    /// Report local slot accounting.
    GetResources,
    /// Remove a host from a function's registered set.
    Unregister(UnregisterRequest),
    /// Accept a directly delivered result.
    DirectResult(Message),
    /// Accept planned migrations for an app.
    PendingMigrations(PendingMigrations),
    /// Fetch a registered NDP delta.
    NdpDeltaRequest(u32),
}

/// The response to a [`FunctionCallRequest`].
#[derive(Clone, Debug, PartialEq)]
pub enum FunctionCallResponse {
    /// The request produced no payload.
    Empty,
    /// The host's resources, for [`FunctionCallRequest::GetResources`].
    Resources(HostResources),
    /// The delta bytes, for [`FunctionCallRequest::NdpDeltaRequest`].
    NdpDelta(Vec<u8>),
}
