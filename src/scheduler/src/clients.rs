// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-remote client pool.
//!
//! Connection setup is amortized across dispatches: a client is created the
//! first time a remote is addressed and kept for the life of the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stratus_scheduler_client::{ClientFactory, FunctionCallClient, SnapshotClient};
use tracing::debug;

#[derive(Debug)]
pub(crate) struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    function_call: Mutex<HashMap<String, Arc<dyn FunctionCallClient>>>,
    snapshot: Mutex<HashMap<String, Arc<dyn SnapshotClient>>>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>) -> ClientPool {
        ClientPool {
            factory,
            function_call: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(HashMap::new()),
        }
    }

    pub fn function_call_client(&self, host: &str) -> Arc<dyn FunctionCallClient> {
        let mut clients = self.function_call.lock().expect("lock poisoned");
        Arc::clone(clients.entry(host.to_string()).or_insert_with(|| {
            debug!("adding new function call client for {host}");
            self.factory.function_call_client(host)
        }))
    }

    pub fn snapshot_client(&self, host: &str) -> Arc<dyn SnapshotClient> {
        let mut clients = self.snapshot.lock().expect("lock poisoned");
        Arc::clone(clients.entry(host.to_string()).or_insert_with(|| {
            debug!("adding new snapshot client for {host}");
            self.factory.snapshot_client(host)
        }))
    }
}
