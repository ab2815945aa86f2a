// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Execution graphs.
//!
//! Every dispatched message leaves a status blob in the shared store, and
//! every call chained from it is logged into a `chained_<id>` set. Walking
//! the two recursively reconstructs the call tree of an invocation after
//! the fact.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use stratus_scheduler_client::message::{chained_key_from_message_id, status_key_from_message_id};
use stratus_scheduler_client::Message;
use tokio::time;
use tracing::warn;

use crate::error::SchedulingError;
use crate::scheduler::Scheduler;

const GET_EXEC_GRAPH_SLEEP: Duration = Duration::from_millis(500);
const MAX_GET_EXEC_GRAPH_RETRIES: usize = 3;

/// One invocation and the calls chained from it.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecGraphNode {
    /// The invocation's result message.
    pub msg: Message,
    /// The invocations it chained.
    pub children: Vec<ExecGraphNode>,
}

/// The call tree rooted at one invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecGraph {
    /// The root invocation.
    pub root: ExecGraphNode,
}

impl Scheduler {
    /// Records that `parent` chained a call to `chained`.
    pub async fn log_chained_function(
        &self,
        parent_msg_id: u32,
        chained_msg_id: u32,
    ) -> Result<(), SchedulingError> {
        let key = chained_key_from_message_id(parent_msg_id);
        self.store
            .set_add(&key, &chained_msg_id.to_string())
            .await?;
        self.store
            .expire(&key, self.config.status_key_ttl)
            .await?;
        Ok(())
    }

    /// The ids of the calls chained from a message.
    pub async fn get_chained_functions(
        &self,
        msg_id: u32,
    ) -> Result<BTreeSet<u32>, SchedulingError> {
        let key = chained_key_from_message_id(msg_id);
        let members = self.store.set_members(&key).await?;
        let mut chained = BTreeSet::new();
        for member in members {
            match member.parse() {
                Ok(id) => {
                    chained.insert(id);
                }
                Err(_) => warn!("ignoring malformed chained id {member:?} under {key}"),
            }
        }
        Ok(chained)
    }

    /// Reconstructs the call tree rooted at `msg_id` from the store.
    pub async fn get_function_exec_graph(
        &self,
        msg_id: u32,
    ) -> Result<ExecGraph, SchedulingError> {
        let root = self.exec_graph_node(msg_id).await?;
        Ok(ExecGraph { root })
    }

    fn exec_graph_node(
        &self,
        msg_id: u32,
    ) -> BoxFuture<'_, Result<ExecGraphNode, SchedulingError>> {
        async move {
            let status_key = status_key_from_message_id(msg_id);

            // The status blob may not have been populated yet by the time a
            // caller starts walking the graph, so missing blobs are retried
            // a few times before giving up.
            let mut bytes = self.store.get(&status_key).await?;
            let mut retries = 0;
            while bytes.is_none() && retries < MAX_GET_EXEC_GRAPH_RETRIES {
                warn!(
                    "retrying GET of message {msg_id} for exec graph node (retry {}/{MAX_GET_EXEC_GRAPH_RETRIES})",
                    retries + 1
                );
                time::sleep(GET_EXEC_GRAPH_SLEEP).await;
                bytes = self.store.get(&status_key).await?;
                retries += 1;
            }
            let bytes = bytes.ok_or_else(|| {
                SchedulingError::Internal(anyhow::anyhow!(
                    "message for exec graph not in store (id: {msg_id}, key: {status_key})"
                ))
            })?;
            let msg = Message::from_bytes(&bytes)?;

            let mut children = Vec::new();
            for chained_id in self.get_chained_functions(msg_id).await? {
                children.push(self.exec_graph_node(chained_id).await?);
            }

            Ok(ExecGraphNode { msg, children })
        }
        .boxed()
    }
}
