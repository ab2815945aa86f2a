// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scheduler errors.

use std::error::Error;
use std::fmt;

/// An error surfaced by a public scheduler operation.
///
/// Remote resource queries made while computing a decision are deliberately
/// absent: the decision engine absorbs those failures by treating the host
/// as contributing zero slots.
#[derive(Debug)]
pub enum SchedulingError {
    /// A decision's host vector does not match the batch it was made for.
    InvalidSchedule {
        /// Hosts in the decision.
        decision: usize,
        /// Messages in the batch.
        batch: usize,
    },
    /// The first message of a batch names no master host.
    NoMasterHost,
    /// A result was requested for message id zero.
    ZeroMessageId,
    /// A thread result was awaited for an id never registered.
    UnregisteredThread(u32),
    /// A direct result arrived but no slot was pre-registered for it.
    DirectResultMissing(u32),
    /// A blocking dequeue on the shared result queue timed out.
    NoResponse(u32),
    /// More than one executor exists for a THREADS function.
    ExecutorBusy {
        /// The function key.
        function_key: String,
        /// How many executors were found.
        count: usize,
    },
    /// A second set of pending migrations arrived for an app that already
    /// has one.
    MigrationConflict(u32),
    /// A collaborator (store, transport, snapshot subsystem) failed.
    Internal(anyhow::Error),
}

impl fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedulingError::InvalidSchedule { decision, batch } => write!(
                f,
                "scheduling decision has {decision} hosts but batch has {batch} messages"
            ),
            SchedulingError::NoMasterHost => f.write_str("message has no master host"),
            SchedulingError::ZeroMessageId => {
                f.write_str("must provide a non-zero message id")
            }
            SchedulingError::UnregisteredThread(id) => {
                write!(f, "thread {id} not registered on this host")
            }
            SchedulingError::DirectResultMissing(id) => {
                write!(f, "direct result for message {id} has no registered slot")
            }
            SchedulingError::NoResponse(id) => {
                write!(f, "timed out waiting for the result of message {id}")
            }
            SchedulingError::ExecutorBusy {
                function_key,
                count,
            } => write!(
                f,
                "expected at most one executor for threaded function {function_key}, found {count}"
            ),
            SchedulingError::MigrationConflict(app_id) => write!(
                f,
                "pending migrations already recorded for app {app_id}"
            ),
            SchedulingError::Internal(e) => write!(f, "{e:#}"),
        }
    }
}

impl Error for SchedulingError {}

impl From<anyhow::Error> for SchedulingError {
    fn from(e: anyhow::Error) -> SchedulingError {
        SchedulingError::Internal(e)
    }
}
