// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The served side of the function-call surface.
//!
//! Transports decode incoming frames into [`FunctionCallRequest`]s and hand
//! them here; everything else is the scheduler's business. Batches arriving
//! through this surface have already been placed by their master, so they
//! are pinned to this host with a FORCE_LOCAL hint before dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratus_scheduler_client::{FunctionCallRequest, FunctionCallResponse, TopologyHint};
use tokio::time;
use tracing::{debug, error, warn};

use crate::error::SchedulingError;
use crate::scheduler::Scheduler;

/// A function that produces the NDP delta registered under an id.
pub type NdpDeltaHandler = Box<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Serves the function-call verbs for one host.
pub struct FunctionCallServer {
    scheduler: Arc<Scheduler>,
    ndp_delta_handlers: Mutex<HashMap<u32, NdpDeltaHandler>>,
}

impl FunctionCallServer {
    /// Creates a server for `scheduler`.
    pub fn new(scheduler: Arc<Scheduler>) -> FunctionCallServer {
        FunctionCallServer {
            scheduler,
            ndp_delta_handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the handler serving NDP delta requests for `id`.
    pub fn register_ndp_delta_handler(&self, id: u32, handler: NdpDeltaHandler) {
        let mut handlers = self.ndp_delta_handlers.lock().expect("lock poisoned");
        handlers.insert(id, handler);
    }

    /// Removes the NDP delta handler for `id`.
    pub fn remove_ndp_delta_handler(&self, id: u32) {
        let mut handlers = self.ndp_delta_handlers.lock().expect("lock poisoned");
        handlers.remove(&id);
    }

    /// Handles one request.
    pub async fn handle(
        &self,
        req: FunctionCallRequest,
    ) -> Result<FunctionCallResponse, SchedulingError> {
        match req {
            FunctionCallRequest::ExecuteFunctions(mut batch) => {
                if batch.is_empty() {
                    return Err(SchedulingError::Internal(anyhow::anyhow!(
                        "received an empty batch"
                    )));
                }
                // This host has now been told to execute these functions no
                // matter what.
                batch.messages[0].topology_hint = TopologyHint::ForceLocal.to_string();
                self.scheduler.call_functions(batch, None).await?;
                Ok(FunctionCallResponse::Empty)
            }
            FunctionCallRequest::Flush => {
                self.scheduler.flush_locally().await;
                Ok(FunctionCallResponse::Empty)
            }
            FunctionCallRequest::GetResources => Ok(FunctionCallResponse::Resources(
                self.scheduler.get_this_host_resources().await,
            )),
            FunctionCallRequest::Unregister(req) => {
                debug!(
                    "unregistering host {} for {}/{}",
                    req.host, req.user, req.function
                );
                self.scheduler
                    .remove_registered_host(&req.host, &req.user, &req.function)
                    .await;
                Ok(FunctionCallResponse::Empty)
            }
            FunctionCallRequest::DirectResult(msg) => {
                // The sending executor can beat the receiver's slot
                // registration; give the slot one more chance to appear
                // before dropping the result.
                let msg_id = msg.id;
                let mut attempts = 0;
                loop {
                    match self.scheduler.set_function_result(msg.clone()).await {
                        Ok(()) => break,
                        Err(SchedulingError::DirectResultMissing(_)) => {
                            attempts += 1;
                            if attempts >= 2 {
                                error!(
                                    "dropping direct result for message {msg_id}: no registered slot"
                                );
                                break;
                            }
                            warn!(
                                "direct result for message {msg_id} has no slot yet, retrying"
                            );
                            time::sleep(Duration::from_millis(100)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(FunctionCallResponse::Empty)
            }
            FunctionCallRequest::PendingMigrations(pending) => {
                self.scheduler.add_pending_migration(pending).await?;
                Ok(FunctionCallResponse::Empty)
            }
            FunctionCallRequest::NdpDeltaRequest(id) => {
                let handlers = self.ndp_delta_handlers.lock().expect("lock poisoned");
                match handlers.get(&id) {
                    Some(handler) => Ok(FunctionCallResponse::NdpDelta(handler())),
                    None => {
                        error!("no NDP delta handler found for id {id}");
                        Ok(FunctionCallResponse::NdpDelta(Vec::new()))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use stratus_scheduler_client::{
        HostResources, Message, Migration, PendingMigrations,
    };

    use crate::testing::TestEnv;

    use super::*;

    #[tokio::test]
    async fn test_get_resources() {
        let env = TestEnv::new("hostA", 4).await;
        let server = FunctionCallServer::new(env.scheduler.clone());
        let response = server.handle(FunctionCallRequest::GetResources).await.unwrap();
        assert_eq!(
            response,
            FunctionCallResponse::Resources(HostResources::with_slots(4))
        );
    }

    #[tokio::test]
    async fn test_unregister_removes_host() {
        let env = TestEnv::new("hostA", 4).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        let server = FunctionCallServer::new(env.scheduler.clone());
        server
            .handle(FunctionCallRequest::Unregister(
                stratus_scheduler_client::UnregisterRequest {
                    host: "hostB".to_string(),
                    user: "alpha".to_string(),
                    function: "beta".to_string(),
                },
            ))
            .await
            .unwrap();
        assert!(env
            .scheduler
            .get_function_registered_hosts("alpha", "beta")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_direct_result_fulfills_registered_slot() {
        let env = TestEnv::new("hostA", 4).await;
        let server = FunctionCallServer::new(env.scheduler.clone());

        let mut msg = Message::new("alpha", "beta");
        msg.direct_result_host = "hostA".to_string();
        msg.return_value = 17;
        env.scheduler.add_local_result_slot(msg.id);

        server
            .handle(FunctionCallRequest::DirectResult(msg.clone()))
            .await
            .unwrap();
        let result = env
            .scheduler
            .get_function_result(msg.id, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(result.return_value, 17);
    }

    #[tokio::test]
    async fn test_direct_result_without_slot_is_dropped() {
        let env = TestEnv::new("hostA", 4).await;
        let server = FunctionCallServer::new(env.scheduler.clone());
        let mut msg = Message::new("alpha", "beta");
        msg.direct_result_host = "hostA".to_string();
        // No slot registered: the server retries once, then drops without
        // surfacing an error.
        let response = server
            .handle(FunctionCallRequest::DirectResult(msg))
            .await
            .unwrap();
        assert_eq!(response, FunctionCallResponse::Empty);
    }

    #[tokio::test]
    async fn test_second_pending_migration_conflicts() {
        let env = TestEnv::new("hostA", 4).await;
        let server = FunctionCallServer::new(env.scheduler.clone());
        let pending = PendingMigrations {
            app_id: 99,
            migrations: vec![Migration {
                src_host: "hostB".to_string(),
                dst_host: "hostA".to_string(),
                msg: Message::new("alpha", "beta"),
            }],
        };
        server
            .handle(FunctionCallRequest::PendingMigrations(pending.clone()))
            .await
            .unwrap();
        let err = server
            .handle(FunctionCallRequest::PendingMigrations(pending))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::MigrationConflict(99)));
    }

    #[tokio::test]
    async fn test_ndp_delta_request() {
        let env = TestEnv::new("hostA", 4).await;
        let server = FunctionCallServer::new(env.scheduler.clone());
        server.register_ndp_delta_handler(7, Box::new(|| b"delta".to_vec()));
        assert_eq!(
            server
                .handle(FunctionCallRequest::NdpDeltaRequest(7))
                .await
                .unwrap(),
            FunctionCallResponse::NdpDelta(b"delta".to_vec())
        );
        // Unknown ids answer with empty bytes rather than failing the call.
        assert_eq!(
            server
                .handle(FunctionCallRequest::NdpDeltaRequest(8))
                .await
                .unwrap(),
            FunctionCallResponse::NdpDelta(Vec::new())
        );
        server.remove_ndp_delta_handler(7);
        assert_eq!(
            server
                .handle(FunctionCallRequest::NdpDeltaRequest(7))
                .await
                .unwrap(),
            FunctionCallResponse::NdpDelta(Vec::new())
        );
    }
}
