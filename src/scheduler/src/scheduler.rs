// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-host scheduler: decisions are realized here.
//!
//! [`Scheduler::call_functions`] is the main entry point. It forwards
//! batches that belong to another master, computes a scheduling decision for
//! the ones that belong here, and then dispatches: snapshots and
//! point-to-point mappings first, then the remote shares of the batch (so
//! that peers start working while we do), and the local share last, onto
//! claimed executors.
//!
//! Locking: one read-write lock (`state`) protects all scheduler maps, and a
//! separate plain mutex protects the local-results table. The state lock may
//! be held across the dispatch RPCs (a finite broadcast), but never across a
//! result wait; the local-results mutex is only ever held for map lookups
//! and never while acquiring the state lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use stratus_ore::now::NowFn;
use stratus_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use stratus_scheduler_client::message::result_key_from_message_id;
use stratus_scheduler_client::{
    BatchRequest, BatchType, Broker, ClientFactory, FunctionCallClient, HostResources, Message,
    PendingMigrations, SchedulingDecision, SnapshotClient, SnapshotRegistry, TopologyHint,
};
use stratus_store::KeyValueStore;
use tokio::sync::{Notify, RwLock};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::clients::ClientPool;
use crate::config::SchedulerConfig;
use crate::decision::DecisionCache;
use crate::error::SchedulingError;
use crate::executor::{Executor, ExecutorFactory};
use crate::monitor::Monitor;
use crate::registry::{self, HostRegistry, ALL_STORAGE_HOST_SET};

/// A one-shot result rendezvous.
///
/// The first `set` wins and wakes every waiter; later sets are dropped, so a
/// duplicate delivery of the same result is harmless. Waiters that race the
/// set re-check under the lock, so there is no lost-wakeup window.
#[derive(Debug)]
pub(crate) struct ResultCell<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> ResultCell<T> {
    pub fn new() -> ResultCell<T> {
        ResultCell {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn set(&self, value: T) {
        let mut slot = self.value.lock().expect("lock poisoned");
        if slot.is_some() {
            debug!("dropping duplicate result delivery");
            return;
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.value.lock().expect("lock poisoned").clone() {
                return value;
            }
            notified.await;
        }
    }
}

/// Everything guarded by the scheduler's read-write lock.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub this_host_resources: HostResources,
    pub available_hosts_cache: BTreeSet<String>,
    /// Function key to the hosts keeping that function warm, in registration
    /// order.
    pub registered_hosts: HashMap<String, Vec<String>>,
    pub executors: HashMap<String, Vec<Arc<Executor>>>,
    pub suspended_executors: HashMap<String, Arc<AtomicI32>>,
    pub thread_results: HashMap<u32, Arc<ResultCell<i32>>>,
    /// Snapshot key to the hosts that already hold a full copy.
    pub pushed_snapshots: HashMap<String, BTreeSet<String>>,
    pub in_flight: HashMap<u32, (BatchRequest, SchedulingDecision)>,
    pub pending_migrations: HashMap<u32, PendingMigrations>,
    pub decision_cache: DecisionCache,
    pub migration_task: Option<(AbortOnDropHandle<()>, i32)>,
    pub reaper_task: Option<AbortOnDropHandle<()>>,
    pub recorded_all: Vec<Message>,
    pub recorded_local: Vec<Message>,
    pub recorded_shared: Vec<(String, Message)>,
}

impl SchedulerState {
    pub fn registered_hosts_for(&self, function_key: &str) -> Vec<String> {
        self.registered_hosts
            .get(function_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_registered_host(&mut self, function_key: &str, host: &str) {
        let hosts = self
            .registered_hosts
            .entry(function_key.to_string())
            .or_default();
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
}

/// The scheduler's collaborators, all reached through trait objects.
#[derive(Clone, Debug)]
pub struct SchedulerContext {
    /// The deployment-wide key-value store.
    pub store: Arc<dyn KeyValueStore>,
    /// Creates transports to peer hosts.
    pub client_factory: Arc<dyn ClientFactory>,
    /// Creates executors for locally claimed work.
    pub executor_factory: Arc<dyn ExecutorFactory>,
    /// The snapshot subsystem.
    pub snapshots: Arc<dyn SnapshotRegistry>,
    /// The point-to-point broker for grouped messages.
    pub broker: Arc<dyn Broker>,
    /// The wall clock.
    pub now: NowFn,
}

/// The per-host scheduler.
///
/// Create exactly one per process with [`Scheduler::new`] and hand the `Arc`
/// down to everything that needs it; executors and background tasks hold
/// only weak references back.
#[derive(Debug)]
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) registry: HostRegistry,
    pub(crate) clients: ClientPool,
    pub(crate) executor_factory: Arc<dyn ExecutorFactory>,
    pub(crate) snapshots: Arc<dyn SnapshotRegistry>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) now: NowFn,
    pub(crate) state: RwLock<SchedulerState>,
    pub(crate) local_results: Mutex<HashMap<u32, Arc<ResultCell<Message>>>>,
    pub(crate) this_host_used_slots: AtomicI32,
    pub(crate) monitor: Option<Monitor>,
    pub(crate) monitor_locally_scheduled_tasks: AtomicI32,
    pub(crate) monitor_started_tasks: AtomicI32,
    pub(crate) monitor_waiting_tasks: AtomicI32,
}

impl Scheduler {
    /// Creates the scheduler for this host, joins the fleet, and starts the
    /// executor reaper.
    pub async fn new(
        config: SchedulerConfig,
        context: SchedulerContext,
    ) -> Result<Arc<Scheduler>, anyhow::Error> {
        let monitor = match &config.scheduler_monitor_file {
            Some(path) => Some(Monitor::open(path)?),
            None => None,
        };
        let state = SchedulerState {
            this_host_resources: HostResources::with_slots(config.slots),
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler {
            registry: HostRegistry::new(Arc::clone(&context.store)),
            clients: ClientPool::new(context.client_factory),
            store: context.store,
            executor_factory: context.executor_factory,
            snapshots: context.snapshots,
            broker: context.broker,
            now: context.now,
            state: RwLock::new(state),
            local_results: Mutex::new(HashMap::new()),
            this_host_used_slots: AtomicI32::new(0),
            monitor,
            monitor_locally_scheduled_tasks: AtomicI32::new(0),
            monitor_started_tasks: AtomicI32::new(0),
            monitor_waiting_tasks: AtomicI32::new(0),
            config,
        });

        let this_host = scheduler.this_host().to_string();
        scheduler
            .registry
            .add_host(
                registry::global_set_name(scheduler.config.is_storage_node),
                &this_host,
            )
            .await?;
        if scheduler.config.is_storage_node {
            scheduler
                .registry
                .add_host(ALL_STORAGE_HOST_SET, &this_host)
                .await?;
        }

        scheduler.start_reaper().await;
        scheduler.update_monitoring();
        Ok(scheduler)
    }

    /// This host's identity in the fleet.
    pub fn this_host(&self) -> &str {
        &self.config.endpoint_host
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn executor_factory(&self) -> &Arc<dyn ExecutorFactory> {
        &self.executor_factory
    }

    pub(crate) fn function_call_client(&self, host: &str) -> Arc<dyn FunctionCallClient> {
        self.clients.function_call_client(host)
    }

    pub(crate) fn snapshot_client(&self, host: &str) -> Arc<dyn SnapshotClient> {
        self.clients.snapshot_client(host)
    }

    async fn start_reaper(self: &Arc<Self>) {
        let scheduler = Arc::downgrade(self);
        let interval = self.config.reaper_interval;
        let handle = task::spawn(|| "scheduler-reaper", async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match scheduler.upgrade() {
                    Some(scheduler) => {
                        scheduler.reap_stale_executors().await;
                    }
                    None => break,
                }
            }
        })
        .abort_on_drop();
        self.state.write().await.reaper_task = Some(handle);
    }

    /// Schedules and dispatches a single message, wrapped in a FUNCTIONS
    /// batch of one.
    pub async fn call_function(
        self: &Arc<Self>,
        mut msg: Message,
        force_local: bool,
        caller: Option<&Message>,
    ) -> Result<SchedulingDecision, SchedulingError> {
        if force_local {
            msg.topology_hint = TopologyHint::ForceLocal.to_string();
        }
        self.call_functions(BatchRequest::new(vec![msg]), caller).await
    }

    /// Schedules and dispatches a batch.
    ///
    /// All messages in the batch are assumed to share a function and a
    /// master host. If this host is not the master (and the batch is not
    /// forced local), the whole batch is forwarded to the master and the
    /// returned decision carries `return_host`.
    pub async fn call_functions(
        self: &Arc<Self>,
        req: BatchRequest,
        caller: Option<&Message>,
    ) -> Result<SchedulingDecision, SchedulingError> {
        if req.is_empty() {
            return Err(SchedulingError::Internal(anyhow!(
                "cannot schedule an empty batch"
            )));
        }
        let first = req.first_message();
        let hint: TopologyHint = first
            .topology_hint
            .parse()
            .map_err(SchedulingError::Internal)?;
        let master_host = first.master_host.clone();
        if master_host.is_empty() {
            return Err(SchedulingError::NoMasterHost);
        }

        // Nested batch executions land on whichever host the parent ran on;
        // hand them back to their master.
        if hint != TopologyHint::ForceLocal && master_host != self.this_host() {
            debug!(
                "forwarding {} back to master {master_host}",
                first.function_key()
            );
            let mut decision = SchedulingDecision::new(first.app_id, first.group_id);
            decision.return_host = Some(master_host.clone());
            self.function_call_client(&master_host)
                .execute_functions(req)
                .await
                .map_err(SchedulingError::Internal)?;
            return Ok(decision);
        }

        let mut req = req;
        let mut state = self.state.write().await;
        let decision = self
            .do_scheduling_decision(&mut state, &mut req, hint)
            .await?;
        self.do_call_functions(&mut state, req, decision, caller, hint)
            .await
    }

    /// Realizes a decision: point-to-point mappings, migration tracking,
    /// snapshot distribution, then per-host dispatch with the local share
    /// last.
    pub(crate) async fn do_call_functions(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        mut req: BatchRequest,
        decision: SchedulingDecision,
        caller: Option<&Message>,
        hint: TopologyHint,
    ) -> Result<SchedulingDecision, SchedulingError> {
        let first = req.first_message().clone();
        let function_key = first.function_key();
        let n_messages = req.len();
        let this_host = self.this_host().to_string();
        let is_master = first.master_host == this_host;
        let is_force_local = hint == TopologyHint::ForceLocal;
        let is_migration = req.batch_type == BatchType::Migration;
        let is_threads = req.batch_type == BatchType::Threads;

        if decision.hosts.len() != n_messages {
            return Err(SchedulingError::InvalidSchedule {
                decision: decision.hosts.len(),
                batch: n_messages,
            });
        }
        if first.master_host.is_empty() {
            return Err(SchedulingError::NoMasterHost);
        }

        if let Some(caller) = caller {
            for msg in &req.messages {
                if let Err(e) = self.log_chained_function(caller.id, msg.id).await {
                    warn!("failed to log chained call {} -> {}: {e}", caller.id, msg.id);
                }
            }
        }

        // Send out point-to-point mappings if necessary (unless being forced
        // to execute locally, in which case they will be transmitted from
        // the master).
        if !is_force_local && !is_migration && first.group_id > 0 {
            if first.is_mpi {
                // Rank 0 is the one scheduling the remaining worldSize - 1
                // ranks, so it is absent from the batch but must still appear
                // in the group. The published mapping gets a synthetic rank-0
                // entry on this host; the returned decision stays untouched.
                let mut broker_decision = decision.clone();
                let mut rank_zero = first.clone();
                rank_zero.group_idx = 0;
                broker_decision.add_message(this_host.clone(), &rank_zero);
                self.broker
                    .set_and_send_mappings(&broker_decision)
                    .await
                    .map_err(SchedulingError::Internal)?;
            } else {
                self.broker
                    .set_and_send_mappings(&decision)
                    .await
                    .map_err(SchedulingError::Internal)?;
            }
        }

        if !is_migration && first.migration_check_period > 0 {
            self.track_in_flight(state, &req, &decision)?;
        }

        // We want to schedule things on this host _last_, otherwise
        // functions may start executing before all messages have been
        // dispatched, thus slowing the remaining scheduling.
        let unique_hosts: BTreeSet<String> = decision.hosts.iter().cloned().collect();
        let has_local_messages = unique_hosts.contains(&this_host);
        if !self.config.no_single_host_optimisations {
            req.single_host =
                is_master && has_local_messages && unique_hosts.len() == 1;
        }
        let mut ordered_hosts: Vec<String> = unique_hosts
            .iter()
            .filter(|h| **h != this_host)
            .cloned()
            .collect();
        if has_local_messages {
            ordered_hosts.push(this_host.clone());
        }

        if is_threads {
            for msg in &req.messages {
                state
                    .thread_results
                    .entry(msg.id)
                    .or_insert_with(|| Arc::new(ResultCell::new()));
            }
        }

        // Push out snapshot diffs to registered hosts. This happens for
        // *all* registered hosts, regardless of whether they will be
        // executing functions, which greatly simplifies the reasoning about
        // which hosts hold which diffs.
        let snapshot_key = if is_threads {
            if req.single_host {
                String::new()
            } else {
                stratus_scheduler_client::message::main_thread_snapshot_key(&first)
            }
        } else {
            first.snapshot_key.clone()
        };
        if !snapshot_key.is_empty() {
            let snap = self
                .snapshots
                .get_snapshot(&snapshot_key)
                .map_err(SchedulingError::Internal)?;
            for host in state.registered_hosts_for(&function_key) {
                let pushed = state
                    .pushed_snapshots
                    .entry(snapshot_key.clone())
                    .or_default();
                if pushed.contains(&host) {
                    let diffs = snap.tracked_changes();
                    self.snapshot_client(&host)
                        .push_snapshot_update(&snapshot_key, Arc::clone(&snap), diffs)
                        .await
                        .map_err(SchedulingError::Internal)?;
                } else {
                    self.snapshot_client(&host)
                        .push_snapshot(&snapshot_key, Arc::clone(&snap))
                        .await
                        .map_err(SchedulingError::Internal)?;
                    pushed.insert(host);
                }
            }
            snap.clear_tracked_changes();
        }

        if self.config.test_mode {
            state.recorded_all.extend(req.messages.iter().cloned());
        }

        // A direct result aimed at this very host is just a local result.
        for (i, msg) in req.messages.iter_mut().enumerate() {
            if decision.hosts[i] == this_host && msg.direct_result_host == this_host {
                msg.direct_result_host.clear();
            }
        }

        let batch = Arc::new(req);
        for host in &ordered_hosts {
            let host_idxs: Vec<usize> = decision
                .hosts
                .iter()
                .enumerate()
                .filter(|(_, h)| *h == host)
                .map(|(i, _)| i)
                .collect();

            if *host == this_host {
                debug!(
                    "scheduling {}/{n_messages} calls to {function_key} locally",
                    host_idxs.len()
                );
                self.this_host_used_slots
                    .fetch_add(host_idxs.len() as i32, Ordering::AcqRel);
                self.monitor_locally_scheduled_tasks
                    .fetch_add(host_idxs.len() as i32, Ordering::AcqRel);
                self.update_monitoring();

                if is_threads {
                    // Threads share one executor; more than one means
                    // something went badly wrong earlier.
                    let n_executors = state
                        .executors
                        .get(&function_key)
                        .map_or(0, |execs| execs.len());
                    let executor = match n_executors {
                        0 => self.claim_executor(state, &batch.messages[host_idxs[0]])?,
                        1 => Arc::clone(&state.executors[&function_key][0]),
                        count => {
                            return Err(SchedulingError::ExecutorBusy {
                                function_key,
                                count,
                            })
                        }
                    };
                    executor.execute_tasks(host_idxs, &batch, Arc::downgrade(self));
                } else {
                    for i in host_idxs {
                        let msg = &batch.messages[i];
                        if msg.executes_locally {
                            self.add_local_result_slot(msg.id);
                        }
                        let executor = self.claim_executor(state, msg)?;
                        executor.execute_tasks(vec![i], &batch, Arc::downgrade(self));
                    }
                }
            } else {
                debug!(
                    "scheduling {}/{n_messages} calls to {function_key} on {host}",
                    host_idxs.len()
                );
                let mut host_req = BatchRequest {
                    messages: Vec::with_capacity(host_idxs.len()),
                    batch_type: batch.batch_type,
                    subtype: batch.subtype,
                    snapshot_key: batch.snapshot_key.clone(),
                    context_data: batch.context_data.clone(),
                    single_host: false,
                };
                for &i in &host_idxs {
                    let mut msg = batch.messages[i].clone();
                    msg.executes_locally = false;
                    if !msg.direct_result_host.is_empty() {
                        self.add_local_result_slot(msg.id);
                    }
                    host_req.messages.push(msg);
                }
                self.function_call_client(host)
                    .execute_functions(host_req)
                    .await
                    .map_err(SchedulingError::Internal)?;
            }
        }

        if self.config.test_mode {
            for (i, host) in decision.hosts.iter().enumerate() {
                let msg = batch.messages[i].clone();
                if host.is_empty() || *host == this_host {
                    state.recorded_local.push(msg);
                } else {
                    state.recorded_shared.push((host.clone(), msg));
                }
            }
        }

        Ok(decision)
    }

    /// Tells every host registered for `msg`'s function to delete its copy
    /// of a snapshot. Best-effort per host.
    pub async fn broadcast_snapshot_delete(&self, msg: &Message, snapshot_key: &str) {
        let hosts = {
            let state = self.state.read().await;
            state.registered_hosts_for(&msg.function_key())
        };
        for host in hosts {
            if let Err(e) = self
                .snapshot_client(&host)
                .delete_snapshot(snapshot_key)
                .await
            {
                warn!("failed to delete snapshot {snapshot_key} on {host}: {e:#}");
            }
        }
    }

    /// Pre-registers a local result slot for a message id.
    pub fn add_local_result_slot(&self, msg_id: u32) {
        let mut local_results = self.local_results.lock().expect("lock poisoned");
        local_results
            .entry(msg_id)
            .or_insert_with(|| Arc::new(ResultCell::new()));
    }

    /// Returns a just-completed slot, freeing the local accounting that went
    /// with the task.
    pub fn vacate_slot(&self) {
        self.this_host_used_slots.fetch_sub(1, Ordering::AcqRel);
    }

    /// Publishes the result of a finished message.
    ///
    /// Depending on the message this fulfills a local slot, pushes the
    /// result directly to the host that asked for it, or publishes it to the
    /// shared store for whoever dequeues it.
    pub async fn set_function_result(&self, mut msg: Message) -> Result<(), SchedulingError> {
        let this_host = self.this_host().to_string();

        if !msg.direct_result_host.is_empty() && msg.direct_result_host == this_host {
            let slot = {
                let local_results = self.local_results.lock().expect("lock poisoned");
                local_results.get(&msg.id).map(Arc::clone)
            };
            return match slot {
                Some(slot) => {
                    slot.set(msg);
                    Ok(())
                }
                None => Err(SchedulingError::DirectResultMissing(msg.id)),
            };
        }

        msg.executed_host = this_host.clone();
        msg.finish_timestamp = (self.now)();

        // The app can no longer be migrated once results start arriving at
        // its master.
        if msg.master_host == this_host {
            self.remove_pending_migration(msg.app_id).await;
        }

        if !msg.direct_result_host.is_empty() {
            let client = self.function_call_client(&msg.direct_result_host);
            client
                .send_direct_result(msg)
                .await
                .map_err(SchedulingError::Internal)?;
            return Ok(());
        }

        if msg.executes_locally {
            let slot = {
                let local_results = self.local_results.lock().expect("lock poisoned");
                local_results.get(&msg.id).map(Arc::clone)
            };
            if let Some(slot) = slot {
                slot.set(msg);
            }
            return Ok(());
        }

        if msg.result_key.is_empty() {
            return Err(SchedulingError::Internal(anyhow!(
                "result key empty, cannot publish result for message {}",
                msg.id
            )));
        }
        let payload = msg.to_bytes()?;
        self.store
            .publish_result(
                &msg.result_key,
                &msg.status_key,
                payload,
                self.config.result_key_ttl,
                self.config.status_key_ttl,
            )
            .await?;
        Ok(())
    }

    /// Waits up to `timeout` for the result of a message.
    ///
    /// Messages with a local slot resolve through it; anything else falls
    /// back to a blocking dequeue on the shared result queue. With a zero
    /// timeout the call polls instead of blocking and returns the empty
    /// sentinel when nothing has arrived.
    pub async fn get_function_result(
        &self,
        msg_id: u32,
        timeout: Duration,
        caller: Option<&Message>,
    ) -> Result<Message, SchedulingError> {
        if msg_id == 0 {
            return Err(SchedulingError::ZeroMessageId);
        }
        let suspended = match caller {
            Some(caller) => Some(self.suspended_counter(&caller.function_key()).await),
            None => None,
        };
        if let Some(counter) = &suspended {
            counter.fetch_add(1, Ordering::AcqRel);
            self.monitor_waiting_tasks.fetch_add(1, Ordering::AcqRel);
            self.update_monitoring();
        }
        let result = self.do_get_function_result(msg_id, timeout).await;
        if let Some(counter) = &suspended {
            counter.fetch_sub(1, Ordering::AcqRel);
            self.monitor_waiting_tasks.fetch_sub(1, Ordering::AcqRel);
            self.update_monitoring();
        }
        result
    }

    /// Waits for a result in the background and hands it to `handler`.
    pub fn get_function_result_async<F>(
        self: &Arc<Self>,
        msg_id: u32,
        timeout: Duration,
        handler: F,
    ) -> Result<(), SchedulingError>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        if msg_id == 0 {
            return Err(SchedulingError::ZeroMessageId);
        }
        let scheduler = Arc::clone(self);
        task::spawn(
            || format!("get-function-result-{msg_id}"),
            async move {
                match scheduler.do_get_function_result(msg_id, timeout).await {
                    Ok(msg) => handler(msg),
                    Err(e) => warn!("async result wait for message {msg_id} failed: {e}"),
                }
            },
        );
        Ok(())
    }

    async fn do_get_function_result(
        &self,
        msg_id: u32,
        timeout: Duration,
    ) -> Result<Message, SchedulingError> {
        let slot = {
            let local_results = self.local_results.lock().expect("lock poisoned");
            local_results.get(&msg_id).map(Arc::clone)
        };
        if let Some(slot) = slot {
            return match time::timeout(timeout, slot.wait()).await {
                Ok(msg) => {
                    let mut local_results =
                        self.local_results.lock().expect("lock poisoned");
                    local_results.remove(&msg_id);
                    Ok(msg)
                }
                Err(_) => Ok(Message::empty()),
            };
        }

        let result_key = result_key_from_message_id(msg_id);
        if timeout.is_zero() {
            match self.store.dequeue(&result_key, Duration::ZERO).await? {
                Some(bytes) => Ok(Message::from_bytes(&bytes)?),
                None => Ok(Message::empty()),
            }
        } else {
            match self.store.dequeue(&result_key, timeout).await? {
                Some(bytes) => Ok(Message::from_bytes(&bytes)?),
                None => Err(SchedulingError::NoResponse(msg_id)),
            }
        }
    }

    async fn suspended_counter(&self, function_key: &str) -> Arc<AtomicI32> {
        {
            let state = self.state.read().await;
            if let Some(counter) = state.suspended_executors.get(function_key) {
                return Arc::clone(counter);
            }
        }
        let mut state = self.state.write().await;
        Arc::clone(
            state
                .suspended_executors
                .entry(function_key.to_string())
                .or_insert_with(|| Arc::new(AtomicI32::new(0))),
        )
    }

    // ------------------------------------------------------------------
    // Thread results
    // ------------------------------------------------------------------

    /// Reserves a thread-result slot so callers can start waiting before the
    /// thread runs.
    pub async fn register_thread(&self, msg_id: u32) {
        let mut state = self.state.write().await;
        state
            .thread_results
            .entry(msg_id)
            .or_insert_with(|| Arc::new(ResultCell::new()));
    }

    /// Drops the thread-result slots for every message of a batch.
    pub async fn deregister_threads(&self, req: &BatchRequest) {
        let mut state = self.state.write().await;
        for msg in &req.messages {
            state.thread_results.remove(&msg.id);
        }
    }

    /// Returns the registered thread ids, sorted.
    pub async fn get_registered_threads(&self) -> Vec<u32> {
        let state = self.state.read().await;
        let mut ids: Vec<u32> = state.thread_results.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Reports a thread's result, queueing its memory diffs onto the named
    /// snapshot. On the master this resolves locally; elsewhere result and
    /// diffs travel to the master together.
    pub async fn set_thread_result(
        &self,
        msg: &Message,
        return_value: i32,
        key: &str,
        diffs: Vec<stratus_scheduler_client::SnapshotDiff>,
    ) -> Result<(), SchedulingError> {
        if msg.master_host == self.this_host() {
            if !diffs.is_empty() && !key.is_empty() {
                debug!(
                    "queueing {} diffs for {} to snapshot {key} (group {})",
                    diffs.len(),
                    msg.function_key(),
                    msg.group_id
                );
                let snap = self
                    .snapshots
                    .get_snapshot(key)
                    .map_err(SchedulingError::Internal)?;
                snap.queue_diffs(diffs);
            }
            self.set_thread_result_locally(msg.id, return_value).await
        } else {
            self.snapshot_client(&msg.master_host)
                .push_thread_result(msg.id, return_value, key, diffs)
                .await
                .map_err(SchedulingError::Internal)?;
            Ok(())
        }
    }

    /// Resolves a registered thread-result slot.
    pub async fn set_thread_result_locally(
        &self,
        msg_id: u32,
        return_value: i32,
    ) -> Result<(), SchedulingError> {
        debug!("setting result for thread {msg_id} to {return_value}");
        let cell = {
            let state = self.state.read().await;
            state.thread_results.get(&msg_id).map(Arc::clone)
        };
        match cell {
            Some(cell) => {
                cell.set(return_value);
                Ok(())
            }
            None => Err(SchedulingError::UnregisteredThread(msg_id)),
        }
    }

    /// Blocks until the registered thread's result arrives.
    pub async fn await_thread_result(&self, msg_id: u32) -> Result<i32, SchedulingError> {
        let cell = {
            let state = self.state.read().await;
            state.thread_results.get(&msg_id).map(Arc::clone)
        };
        match cell {
            Some(cell) => Ok(cell.wait().await),
            None => Err(SchedulingError::UnregisteredThread(msg_id)),
        }
    }

    /// Awaits each message of a batch in order, returning `(id, result)`
    /// pairs in batch order.
    pub async fn await_thread_results(
        &self,
        req: &BatchRequest,
    ) -> Result<Vec<(u32, i32)>, SchedulingError> {
        let mut results = Vec::with_capacity(req.len());
        for msg in &req.messages {
            let result = self.await_thread_result(msg.id).await?;
            results.push((msg.id, result));
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Host resources and registered hosts
    // ------------------------------------------------------------------

    /// Snapshots this host's advertised resources and current slot usage.
    pub async fn get_this_host_resources(&self) -> HostResources {
        let mut resources = self.state.read().await.this_host_resources;
        resources.used_slots = self.this_host_used_slots.load(Ordering::Acquire);
        resources
    }

    /// Overrides this host's advertised resources.
    pub async fn set_this_host_resources(&self, resources: HostResources) {
        let mut state = self.state.write().await;
        state.this_host_resources = resources;
        self.this_host_used_slots
            .store(resources.used_slots, Ordering::Release);
    }

    /// Asks a host for its resources. Never cached; the source of truth is
    /// always consulted.
    pub(crate) async fn get_host_resources(
        &self,
        host: &str,
    ) -> Result<HostResources, anyhow::Error> {
        trace!("requesting resources from {host}");
        self.function_call_client(host).get_resources().await
    }

    /// The hosts currently keeping `user/function` warm, in registration
    /// order.
    pub async fn get_function_registered_hosts(&self, user: &str, function: &str) -> Vec<String> {
        let state = self.state.read().await;
        state.registered_hosts_for(&format!("{user}/{function}"))
    }

    /// The number of hosts currently keeping `msg`'s function warm.
    pub async fn get_function_registered_host_count(&self, msg: &Message) -> usize {
        self.get_function_registered_hosts(&msg.user, &msg.function)
            .await
            .len()
    }

    /// The number of executors this host keeps for `msg`'s function.
    pub async fn get_function_executor_count(&self, msg: &Message) -> usize {
        let state = self.state.read().await;
        state
            .executors
            .get(&msg.function_key())
            .map_or(0, |execs| execs.len())
    }

    /// Records that `host` keeps `user/function` warm.
    pub async fn add_registered_host(&self, host: &str, user: &str, function: &str) {
        let mut state = self.state.write().await;
        state.add_registered_host(&format!("{user}/{function}"), host);
    }

    /// Forgets that `host` keeps `user/function` warm.
    pub async fn remove_registered_host(&self, host: &str, user: &str, function: &str) {
        let mut state = self.state.write().await;
        if let Some(hosts) = state.registered_hosts.get_mut(&format!("{user}/{function}")) {
            hosts.retain(|h| h != host);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Returns the scheduler to its just-started state: background tasks
    /// stopped and restarted, executors shut down, every map cleared.
    pub async fn reset(self: &Arc<Self>) {
        debug!("resetting scheduler");
        let executors: Vec<Arc<Executor>> = {
            let mut state = self.state.write().await;
            state.migration_task = None;
            state.reaper_task = None;
            state.executors.drain().flat_map(|(_, execs)| execs).collect()
        };
        for executor in &executors {
            executor.shutdown().await;
        }
        self.broker.clear();

        {
            let mut state = self.state.write().await;
            state.this_host_resources = HostResources::with_slots(self.config.slots);
            self.this_host_used_slots.store(0, Ordering::Release);
            state.available_hosts_cache.clear();
            state.registered_hosts.clear();
            state.suspended_executors.clear();
            state.thread_results.clear();
            state.pushed_snapshots.clear();
            state.in_flight.clear();
            state.pending_migrations.clear();
            state.decision_cache.clear();
            state.recorded_all.clear();
            state.recorded_local.clear();
            state.recorded_shared.clear();
        }

        self.start_reaper().await;
    }

    /// Resets the scheduler and leaves the fleet.
    pub async fn shutdown(self: &Arc<Self>) {
        self.reset().await;
        self.state.write().await.reaper_task = None;

        let this_host = self.this_host().to_string();
        let set = registry::global_set_name(self.config.is_storage_node);
        if let Err(e) = self.registry.remove_host(set, &this_host).await {
            warn!("failed to leave {set}: {e:#}");
        }
        if self.config.is_storage_node {
            if let Err(e) = self
                .registry
                .remove_host(ALL_STORAGE_HOST_SET, &this_host)
                .await
            {
                warn!("failed to leave {ALL_STORAGE_HOST_SET}: {e:#}");
            }
        }
    }

    /// Tells every other host in the fleet to flush, then flushes here.
    pub async fn broadcast_flush(self: &Arc<Self>) -> Result<(), SchedulingError> {
        let mut all_hosts = self
            .registry
            .list_hosts(registry::AVAILABLE_HOST_SET, registry::HOST_CACHE_TTL)
            .await
            .map_err(SchedulingError::Internal)?;
        all_hosts.extend(
            self.registry
                .list_hosts(
                    registry::AVAILABLE_STORAGE_HOST_SET,
                    registry::HOST_CACHE_TTL,
                )
                .await
                .map_err(SchedulingError::Internal)?,
        );
        all_hosts.remove(self.this_host());

        for host in all_hosts {
            self.function_call_client(&host)
                .send_flush()
                .await
                .map_err(SchedulingError::Internal)?;
        }

        self.flush_locally().await;
        Ok(())
    }

    /// Resets the scheduler and clears host-wide function state.
    pub async fn flush_locally(self: &Arc<Self>) {
        info!("flushing host {}", self.this_host());
        self.reset().await;
        self.executor_factory.flush_host();
    }

    // ------------------------------------------------------------------
    // Recorded messages (test mode)
    // ------------------------------------------------------------------

    /// Every message dispatched since the last clear (test mode only).
    pub async fn get_recorded_messages_all(&self) -> Vec<Message> {
        self.state.read().await.recorded_all.clone()
    }

    /// Messages dispatched locally (test mode only).
    pub async fn get_recorded_messages_local(&self) -> Vec<Message> {
        self.state.read().await.recorded_local.clone()
    }

    /// Messages dispatched to other hosts, with the host (test mode only).
    pub async fn get_recorded_messages_shared(&self) -> Vec<(String, Message)> {
        self.state.read().await.recorded_shared.clone()
    }

    /// Clears the recorded messages.
    pub async fn clear_recorded_messages(&self) {
        let mut state = self.state.write().await;
        state.recorded_all.clear();
        state.recorded_local.clear();
        state.recorded_shared.clear();
    }
}
