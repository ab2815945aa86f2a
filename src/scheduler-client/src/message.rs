// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Messages and batches: the unit of schedulable work.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Distinguishes real invocations from sentinel messages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A function invocation.
    #[default]
    Call,
    /// The empty sentinel returned by non-blocking result queries that found
    /// nothing.
    Empty,
}

/// A single function invocation.
///
/// Messages are created on the master host and travel with their batch to
/// whichever host executes them; the result then travels back keyed by the
/// message id. Ids are non-zero: zero is reserved to mean "no message".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, non-zero for real messages.
    pub id: u32,
    /// The application this invocation belongs to.
    pub app_id: u32,
    /// Collective group id, or zero when the message is not part of a group.
    pub group_id: i32,
    /// This message's index within its group.
    pub group_idx: i32,
    /// Total size of the group.
    pub group_size: i32,
    /// Owning user.
    pub user: String,
    /// Function name.
    pub function: String,
    /// The host that originated the batch and owns its result collection.
    pub master_host: String,
    /// Set by the executing host when the result is published.
    pub executed_host: String,
    /// Return value of the invocation, set on completion.
    pub return_value: i32,
    /// Result-queue key in the shared store.
    pub result_key: String,
    /// Status-blob key in the shared store.
    pub status_key: String,
    /// Whether the caller will poll rather than block for the result.
    pub is_async: bool,
    /// Whether the result should be delivered through the local slot table
    /// rather than the shared store.
    pub executes_locally: bool,
    /// If non-empty, the host whose local slot table should receive the
    /// result directly, bypassing the shared store.
    pub direct_result_host: String,
    /// Whether this message is an MPI rank.
    pub is_mpi: bool,
    /// World size for MPI messages.
    pub mpi_world_size: i32,
    /// Whether this invocation must run on a storage host.
    pub is_storage: bool,
    /// Topology hint in wire form; parsed via [`TopologyHint`] at the edge.
    ///
    /// [`TopologyHint`]: crate::decision::TopologyHint
    pub topology_hint: String,
    /// Interval in seconds between migration checks for this app, or zero to
    /// opt out of migration.
    pub migration_check_period: i32,
    /// Key of the snapshot to execute from, if any.
    pub snapshot_key: String,
    /// Millis since epoch at which the executing host finished the task.
    pub finish_timestamp: u64,
    /// Input payload.
    pub input_data: Vec<u8>,
    /// Output payload.
    pub output_data: Vec<u8>,
    /// Whether this is a real invocation or a sentinel.
    pub kind: MessageKind,
}

impl Message {
    /// Creates a message for invoking `user/function`, with a fresh id and
    /// the store keys derived from it.
    pub fn new(user: &str, function: &str) -> Message {
        let id = rand::thread_rng().gen_range(1..u32::MAX);
        Message {
            id,
            app_id: id,
            user: user.to_string(),
            function: function.to_string(),
            result_key: result_key_from_message_id(id),
            status_key: status_key_from_message_id(id),
            ..Default::default()
        }
    }

    /// Creates the empty sentinel message.
    pub fn empty() -> Message {
        Message {
            kind: MessageKind::Empty,
            ..Default::default()
        }
    }

    /// Returns the function key `user/function` that names this message's
    /// function in the executor pool and registered-host maps.
    pub fn function_key(&self) -> String {
        format!("{}/{}", self.user, self.function)
    }

    /// Serializes the message for the shared store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, anyhow::Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a message from the shared store.
    pub fn from_bytes(bytes: &[u8]) -> Result<Message, anyhow::Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Returns the result-queue key for a message id.
pub fn result_key_from_message_id(id: u32) -> String {
    format!("result_{id}")
}

/// Returns the status-blob key for a message id.
pub fn status_key_from_message_id(id: u32) -> String {
    format!("status_{id}")
}

/// Returns the store set that records calls chained from a message.
pub fn chained_key_from_message_id(id: u32) -> String {
    format!("chained_{id}")
}

/// Returns the snapshot key under which a function's main thread publishes
/// its memory to other hosts.
pub fn main_thread_snapshot_key(msg: &Message) -> String {
    format!("snap_main_{}_{}", msg.user, msg.function)
}

/// The kind of work a batch carries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum BatchType {
    /// Independent function invocations.
    #[default]
    Functions,
    /// Fork-join threads of a single function.
    Threads,
    /// Invocations restored from another host mid-flight.
    Migration,
}

/// An ordered set of messages submitted for scheduling as a unit.
///
/// All messages in a batch share a function and a master host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// The messages to schedule, in order. Decision host vectors are indexed
    /// by position in this list.
    pub messages: Vec<Message>,
    /// What kind of work this is.
    pub batch_type: BatchType,
    /// Free-form subtype understood by the function runtime.
    pub subtype: i32,
    /// Snapshot to execute from, for FUNCTIONS batches.
    pub snapshot_key: String,
    /// Opaque context forwarded to the runtime.
    pub context_data: Vec<u8>,
    /// Whether every message landed on the master host; set by the
    /// dispatcher when single-host optimisations are enabled.
    pub single_host: bool,
}

impl BatchRequest {
    /// Creates a FUNCTIONS batch from `messages`.
    pub fn new(messages: Vec<Message>) -> BatchRequest {
        BatchRequest {
            messages,
            ..Default::default()
        }
    }

    /// Creates a batch of the given type from `messages`.
    pub fn of_type(batch_type: BatchType, messages: Vec<Message>) -> BatchRequest {
        BatchRequest {
            messages,
            batch_type,
            ..Default::default()
        }
    }

    /// Returns the first message.
    ///
    /// # Panics
    ///
    /// Panics if the batch is empty. Batches handed to the scheduler are
    /// never empty.
    pub fn first_message(&self) -> &Message {
        &self.messages[0]
    }

    /// The number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A host's advertised capacity.
///
/// `used_slots` may exceed `slots` when the host has been overloaded;
/// consumers floor the difference at zero rather than erroring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    /// Total executor slots.
    pub slots: i32,
    /// Slots currently claimed.
    pub used_slots: i32,
    /// One-minute load average, for load-balance policies.
    pub load_average: f32,
}

impl HostResources {
    /// Creates resources with the given total slots and nothing in use.
    pub fn with_slots(slots: i32) -> HostResources {
        HostResources {
            slots,
            ..Default::default()
        }
    }

    /// The number of free slots, floored at zero.
    pub fn available_slots(&self) -> i32 {
        (self.slots - self.used_slots).max(0)
    }
}

/// A request to remove a host from a function's registered set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    /// The host being removed.
    pub host: String,
    /// Owning user of the function.
    pub user: String,
    /// Function name.
    pub function: String,
}

/// A single planned migration of an in-flight message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Host the message currently runs on.
    pub src_host: String,
    /// Host the message should move to.
    pub dst_host: String,
    /// The message to move.
    pub msg: Message,
}

/// The set of migrations planned for one application, broadcast to every
/// host involved in it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingMigrations {
    /// The application being re-packed.
    pub app_id: u32,
    /// The planned moves.
    pub migrations: Vec<Migration>,
}
