// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Test utilities: a mock fleet for exercising the scheduler in-process.
//!
//! [`MockNetwork`] stands in for every remote host at once, recording the
//! traffic the scheduler would have put on the wire and answering resource
//! queries from a table the test controls. [`TestEnv`] wires a scheduler to
//! the mock network, an in-memory store, a recording broker/snapshot
//! registry, and a [`RecordingRuntime`] that logs the tasks it executes.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use stratus_ore::now::{NowFn, SYSTEM_TIME};
use stratus_scheduler_client::{
    BatchRequest, Broker, ClientFactory, FunctionCallClient, HostResources, Message,
    PendingMigrations, SchedulingDecision, Snapshot, SnapshotClient, SnapshotDiff,
    SnapshotRegistry, UnregisterRequest,
};
use stratus_store::{KeyValueStore, MemoryStore};
use tokio::time;

use crate::config::SchedulerConfig;
use crate::executor::{Executor, ExecutorFactory, FunctionRuntime};
use crate::registry;
use crate::scheduler::{Scheduler, SchedulerContext};

/// Records every call the scheduler makes to its peers and answers resource
/// queries from a test-controlled table.
#[derive(Debug, Default)]
pub struct MockNetwork {
    resources: Mutex<HashMap<String, HostResources>>,
    failing_hosts: Mutex<BTreeSet<String>>,
    events: Mutex<Vec<String>>,
    executed_batches: Mutex<Vec<(String, BatchRequest)>>,
    flushes: Mutex<Vec<String>>,
    unregisters: Mutex<Vec<(String, UnregisterRequest)>>,
    direct_results: Mutex<Vec<(String, Message)>>,
    pending_migrations: Mutex<Vec<(String, PendingMigrations)>>,
    snapshot_pushes: Mutex<Vec<(String, String)>>,
    snapshot_updates: Mutex<Vec<(String, String, usize)>>,
    snapshot_deletes: Mutex<Vec<(String, String)>>,
    thread_results: Mutex<Vec<(String, u32, i32, String)>>,
}

impl MockNetwork {
    /// Creates an empty mock fleet.
    pub fn new() -> Arc<MockNetwork> {
        Arc::new(MockNetwork::default())
    }

    /// Sets the resources `host` reports when queried.
    pub fn set_host_resources(&self, host: &str, resources: HostResources) {
        let mut table = self.resources.lock().expect("lock poisoned");
        table.insert(host.to_string(), resources);
    }

    /// Makes resource queries to `host` fail.
    pub fn fail_resource_queries(&self, host: &str) {
        let mut failing = self.failing_hosts.lock().expect("lock poisoned");
        failing.insert(host.to_string());
    }

    /// Appends to the shared event log (also fed by [`RecordingRuntime`]).
    pub fn note_event(&self, event: impl Into<String>) {
        self.events.lock().expect("lock poisoned").push(event.into());
    }

    /// The event log so far.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// Batches forwarded to remote hosts, in send order.
    pub fn executed_batches(&self) -> Vec<(String, BatchRequest)> {
        self.executed_batches.lock().expect("lock poisoned").clone()
    }

    /// Hosts that were told to flush.
    pub fn flushes(&self) -> Vec<String> {
        self.flushes.lock().expect("lock poisoned").clone()
    }

    /// Unregister calls, with their target host.
    pub fn unregisters(&self) -> Vec<(String, UnregisterRequest)> {
        self.unregisters.lock().expect("lock poisoned").clone()
    }

    /// Direct results sent to remote hosts.
    pub fn direct_results(&self) -> Vec<(String, Message)> {
        self.direct_results.lock().expect("lock poisoned").clone()
    }

    /// Pending-migration broadcasts, with their target host.
    pub fn pending_migrations(&self) -> Vec<(String, PendingMigrations)> {
        self.pending_migrations.lock().expect("lock poisoned").clone()
    }

    /// Full snapshot pushes as `(host, key)`.
    pub fn snapshot_pushes(&self) -> Vec<(String, String)> {
        self.snapshot_pushes.lock().expect("lock poisoned").clone()
    }

    /// Snapshot diff pushes as `(host, key, diff count)`.
    pub fn snapshot_updates(&self) -> Vec<(String, String, usize)> {
        self.snapshot_updates.lock().expect("lock poisoned").clone()
    }

    /// Snapshot deletions as `(host, key)`.
    pub fn snapshot_deletes(&self) -> Vec<(String, String)> {
        self.snapshot_deletes.lock().expect("lock poisoned").clone()
    }

    /// Thread results pushed to remote masters as
    /// `(host, msg id, return value, snapshot key)`.
    pub fn thread_results(&self) -> Vec<(String, u32, i32, String)> {
        self.thread_results.lock().expect("lock poisoned").clone()
    }
}

#[derive(Debug)]
struct MockFunctionCallClient {
    host: String,
    network: Arc<MockNetwork>,
}

#[async_trait]
impl FunctionCallClient for MockFunctionCallClient {
    async fn execute_functions(&self, req: BatchRequest) -> Result<(), anyhow::Error> {
        self.network
            .note_event(format!("execute_functions:{}", self.host));
        let mut batches = self.network.executed_batches.lock().expect("lock poisoned");
        batches.push((self.host.clone(), req));
        Ok(())
    }

    async fn send_flush(&self) -> Result<(), anyhow::Error> {
        let mut flushes = self.network.flushes.lock().expect("lock poisoned");
        flushes.push(self.host.clone());
        Ok(())
    }

    async fn get_resources(&self) -> Result<HostResources, anyhow::Error> {
        if self
            .network
            .failing_hosts
            .lock()
            .expect("lock poisoned")
            .contains(&self.host)
        {
            bail!("injected resource query failure for {}", self.host);
        }
        let table = self.network.resources.lock().expect("lock poisoned");
        match table.get(&self.host) {
            Some(resources) => Ok(*resources),
            None => bail!("no resources recorded for {}", self.host),
        }
    }

    async fn unregister(&self, req: UnregisterRequest) -> Result<(), anyhow::Error> {
        let mut unregisters = self.network.unregisters.lock().expect("lock poisoned");
        unregisters.push((self.host.clone(), req));
        Ok(())
    }

    async fn send_direct_result(&self, msg: Message) -> Result<(), anyhow::Error> {
        let mut results = self.network.direct_results.lock().expect("lock poisoned");
        results.push((self.host.clone(), msg));
        Ok(())
    }

    async fn send_pending_migrations(
        &self,
        pending: PendingMigrations,
    ) -> Result<(), anyhow::Error> {
        let mut migrations = self
            .network
            .pending_migrations
            .lock()
            .expect("lock poisoned");
        migrations.push((self.host.clone(), pending));
        Ok(())
    }

    async fn ndp_delta_request(&self, _id: u32) -> Result<Vec<u8>, anyhow::Error> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct MockSnapshotClient {
    host: String,
    network: Arc<MockNetwork>,
}

#[async_trait]
impl SnapshotClient for MockSnapshotClient {
    async fn push_snapshot(
        &self,
        key: &str,
        _snap: Arc<dyn Snapshot>,
    ) -> Result<(), anyhow::Error> {
        let mut pushes = self.network.snapshot_pushes.lock().expect("lock poisoned");
        pushes.push((self.host.clone(), key.to_string()));
        Ok(())
    }

    async fn push_snapshot_update(
        &self,
        key: &str,
        _snap: Arc<dyn Snapshot>,
        diffs: Vec<SnapshotDiff>,
    ) -> Result<(), anyhow::Error> {
        let mut updates = self.network.snapshot_updates.lock().expect("lock poisoned");
        updates.push((self.host.clone(), key.to_string(), diffs.len()));
        Ok(())
    }

    async fn delete_snapshot(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut deletes = self.network.snapshot_deletes.lock().expect("lock poisoned");
        deletes.push((self.host.clone(), key.to_string()));
        Ok(())
    }

    async fn push_thread_result(
        &self,
        msg_id: u32,
        return_value: i32,
        key: &str,
        _diffs: Vec<SnapshotDiff>,
    ) -> Result<(), anyhow::Error> {
        let mut results = self.network.thread_results.lock().expect("lock poisoned");
        results.push((self.host.clone(), msg_id, return_value, key.to_string()));
        Ok(())
    }
}

/// Hands out clients that talk to a [`MockNetwork`].
#[derive(Debug)]
pub struct MockClientFactory {
    network: Arc<MockNetwork>,
}

impl MockClientFactory {
    /// Creates a factory for `network`.
    pub fn new(network: Arc<MockNetwork>) -> MockClientFactory {
        MockClientFactory { network }
    }
}

impl ClientFactory for MockClientFactory {
    fn function_call_client(&self, host: &str) -> Arc<dyn FunctionCallClient> {
        Arc::new(MockFunctionCallClient {
            host: host.to_string(),
            network: Arc::clone(&self.network),
        })
    }

    fn snapshot_client(&self, host: &str) -> Arc<dyn SnapshotClient> {
        Arc::new(MockSnapshotClient {
            host: host.to_string(),
            network: Arc::clone(&self.network),
        })
    }
}

/// A broker that records the mappings it is asked to publish.
#[derive(Debug, Default)]
pub struct RecordingBroker {
    mappings: Mutex<Vec<SchedulingDecision>>,
    clears: AtomicUsize,
}

impl RecordingBroker {
    /// The decisions published so far.
    pub fn mappings(&self) -> Vec<SchedulingDecision> {
        self.mappings.lock().expect("lock poisoned").clone()
    }

    /// How many times the broker has been cleared.
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn set_and_send_mappings(
        &self,
        decision: &SchedulingDecision,
    ) -> Result<(), anyhow::Error> {
        let mut mappings = self.mappings.lock().expect("lock poisoned");
        mappings.push(decision.clone());
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::AcqRel);
    }
}

/// A snapshot that tracks what the scheduler does to it.
#[derive(Debug, Default)]
pub struct MockSnapshot {
    tracked: Mutex<Vec<SnapshotDiff>>,
    queued: Mutex<Vec<SnapshotDiff>>,
    clear_count: AtomicUsize,
}

impl MockSnapshot {
    /// Pretends the snapshot's memory changed.
    pub fn add_tracked_change(&self, diff: SnapshotDiff) {
        self.tracked.lock().expect("lock poisoned").push(diff);
    }

    /// The diffs queued for merging so far.
    pub fn queued_diffs(&self) -> Vec<SnapshotDiff> {
        self.queued.lock().expect("lock poisoned").clone()
    }

    /// How many times tracking was reset.
    pub fn clear_count(&self) -> usize {
        self.clear_count.load(Ordering::Acquire)
    }
}

impl Snapshot for MockSnapshot {
    fn tracked_changes(&self) -> Vec<SnapshotDiff> {
        self.tracked.lock().expect("lock poisoned").clone()
    }

    fn clear_tracked_changes(&self) {
        self.tracked.lock().expect("lock poisoned").clear();
        self.clear_count.fetch_add(1, Ordering::AcqRel);
    }

    fn queue_diffs(&self, diffs: Vec<SnapshotDiff>) {
        self.queued.lock().expect("lock poisoned").extend(diffs);
    }
}

/// A registry that materializes snapshots on first use.
#[derive(Debug, Default)]
pub struct MockSnapshotRegistry {
    snapshots: Mutex<HashMap<String, Arc<MockSnapshot>>>,
}

impl MockSnapshotRegistry {
    /// The snapshot under `key`, if the scheduler ever touched it.
    pub fn get(&self, key: &str) -> Option<Arc<MockSnapshot>> {
        self.snapshots
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(Arc::clone)
    }

    /// Returns the snapshot under `key`, creating it if needed.
    pub fn get_or_create(&self, key: &str) -> Arc<MockSnapshot> {
        let mut snapshots = self.snapshots.lock().expect("lock poisoned");
        Arc::clone(
            snapshots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(MockSnapshot::default())),
        )
    }
}

impl SnapshotRegistry for MockSnapshotRegistry {
    fn get_snapshot(&self, key: &str) -> Result<Arc<dyn Snapshot>, anyhow::Error> {
        Ok(self.get_or_create(key))
    }
}

/// A runtime that records the tasks it runs and returns `msg.id % 1000`.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    delay: Mutex<Option<Duration>>,
    executed: Mutex<Vec<(usize, u32)>>,
    event_sink: Mutex<Option<Arc<MockNetwork>>>,
}

impl RecordingRuntime {
    /// Makes every task sleep for `delay` before completing.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock poisoned") = Some(delay);
    }

    /// Mirrors task-start events into `network`'s event log.
    pub fn sink_events_to(&self, network: &Arc<MockNetwork>) {
        *self.event_sink.lock().expect("lock poisoned") = Some(Arc::clone(network));
    }

    /// The `(msg index, msg id)` pairs executed so far.
    pub fn executed(&self) -> Vec<(usize, u32)> {
        self.executed.lock().expect("lock poisoned").clone()
    }

    /// The batch indices executed so far.
    pub fn executed_indices(&self) -> Vec<usize> {
        self.executed().into_iter().map(|(idx, _)| idx).collect()
    }

    /// Waits until at least `n` tasks have completed.
    ///
    /// # Panics
    ///
    /// Panics after five seconds of waiting.
    pub async fn wait_for_tasks(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.executed.lock().expect("lock poisoned").len() >= n {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {n} tasks to complete"
            );
            time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl FunctionRuntime for RecordingRuntime {
    async fn execute_task(
        &self,
        _pool_idx: usize,
        msg_idx: usize,
        batch: &BatchRequest,
    ) -> Result<i32, anyhow::Error> {
        let msg = &batch.messages[msg_idx];
        let sink = self.event_sink.lock().expect("lock poisoned").clone();
        if let Some(sink) = sink {
            sink.note_event(format!("task:{}", msg.id));
        }
        let delay = *self.delay.lock().expect("lock poisoned");
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        self.executed
            .lock()
            .expect("lock poisoned")
            .push((msg_idx, msg.id));
        Ok((msg.id % 1000) as i32)
    }
}

/// An [`ExecutorFactory`] backing executors with a shared runtime.
#[derive(Debug)]
pub struct TestExecutorFactory {
    runtime: Arc<dyn FunctionRuntime>,
    pool_size: usize,
    now: NowFn,
    flushes: AtomicUsize,
}

impl TestExecutorFactory {
    /// Creates a factory producing executors with `pool_size` workers.
    pub fn new(runtime: Arc<dyn FunctionRuntime>, pool_size: usize) -> TestExecutorFactory {
        TestExecutorFactory {
            runtime,
            pool_size,
            now: SYSTEM_TIME.clone(),
            flushes: AtomicUsize::new(0),
        }
    }

    /// How many times the host has been flushed.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }
}

impl ExecutorFactory for TestExecutorFactory {
    fn create(&self, msg: &Message) -> Result<Arc<Executor>, anyhow::Error> {
        Ok(Executor::new(
            msg,
            Arc::clone(&self.runtime),
            self.pool_size,
            self.now.clone(),
        ))
    }

    fn flush_host(&self) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }
}

/// A scheduler wired to an entirely in-process fleet.
pub struct TestEnv {
    /// The scheduler under test.
    pub scheduler: Arc<Scheduler>,
    /// The mock remote fleet.
    pub network: Arc<MockNetwork>,
    /// The recording broker.
    pub broker: Arc<RecordingBroker>,
    /// The mock snapshot registry.
    pub snapshots: Arc<MockSnapshotRegistry>,
    /// The in-memory shared store.
    pub store: Arc<MemoryStore>,
    /// The runtime executing local tasks.
    pub runtime: Arc<RecordingRuntime>,
    /// The executor factory.
    pub factory: Arc<TestExecutorFactory>,
}

impl TestEnv {
    /// Creates an environment whose local host is `host` with `slots`
    /// executor slots.
    pub async fn new(host: &str, slots: i32) -> TestEnv {
        TestEnv::with_config(SchedulerConfig::for_tests(host, slots)).await
    }

    /// Creates an environment from an explicit configuration.
    pub async fn with_config(config: SchedulerConfig) -> TestEnv {
        let network = MockNetwork::new();
        let runtime = Arc::new(RecordingRuntime::default());
        runtime.sink_events_to(&network);
        let broker = Arc::new(RecordingBroker::default());
        let snapshots = Arc::new(MockSnapshotRegistry::default());
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(TestExecutorFactory::new(
            Arc::clone(&runtime) as Arc<dyn FunctionRuntime>,
            config.executor_pool_size,
        ));

        let context = SchedulerContext {
            store: Arc::clone(&store) as Arc<dyn KeyValueStore>,
            client_factory: Arc::new(MockClientFactory::new(Arc::clone(&network))),
            executor_factory: Arc::clone(&factory) as Arc<dyn ExecutorFactory>,
            snapshots: Arc::clone(&snapshots) as Arc<dyn SnapshotRegistry>,
            broker: Arc::clone(&broker) as Arc<dyn Broker>,
            now: SYSTEM_TIME.clone(),
        };
        let scheduler = Scheduler::new(config, context)
            .await
            .expect("scheduler init");

        TestEnv {
            scheduler,
            network,
            broker,
            snapshots,
            store,
            runtime,
            factory,
        }
    }

    /// Adds a remote host to the available-host set and the resource table.
    pub async fn add_available_host(&self, host: &str, resources: HostResources) {
        self.network.set_host_resources(host, resources);
        self.store
            .set_add(registry::AVAILABLE_HOST_SET, host)
            .await
            .expect("memory store is infallible");
    }
}

/// Builds `n` messages for `user/function` mastered on `master`, sharing a
/// fresh app id.
pub fn messages(user: &str, function: &str, n: usize, master: &str) -> Vec<Message> {
    let app_id = rand::random::<u32>() | 1;
    (0..n)
        .map(|_| {
            let mut msg = Message::new(user, function);
            msg.app_id = app_id;
            msg.master_host = master.to_string();
            msg
        })
        .collect()
}

/// Builds a FUNCTIONS batch of `n` locally awaited messages mastered on
/// `master`.
pub fn local_batch(user: &str, function: &str, n: usize, master: &str) -> BatchRequest {
    let mut msgs = messages(user, function, n, master);
    for msg in &mut msgs {
        msg.executes_locally = true;
    }
    BatchRequest::new(msgs)
}
