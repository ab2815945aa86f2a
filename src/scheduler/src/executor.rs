// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Executors: warm per-function workers.
//!
//! An [`Executor`] binds a function runtime to a small pool of worker tasks,
//! each draining its own queue. The scheduler keeps executors warm between
//! invocations, keyed by function; dispatch claims one (an atomic
//! compare-and-set on its `claimed` flag), hands it the batch indices to
//! run, and the claim is released when the last index completes. Executors
//! never hold an owning reference back to the scheduler: each task carries a
//! weak handle that is upgraded only for the duration of the task.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use stratus_ore::now::NowFn;
use stratus_ore::task;
use stratus_scheduler_client::message::main_thread_snapshot_key;
use stratus_scheduler_client::{BatchRequest, BatchType, Message, SnapshotDiff, UnregisterRequest};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::SchedulingError;
use crate::scheduler::{Scheduler, SchedulerState};

/// Executes tasks for one function.
///
/// Implementations are supplied by the function runtime; the scheduler only
/// ever drives them through this trait.
#[async_trait]
pub trait FunctionRuntime: Debug + Send + Sync {
    /// Runs the message at `msg_idx` of `batch` on pool worker `pool_idx`
    /// and returns its result value.
    async fn execute_task(
        &self,
        pool_idx: usize,
        msg_idx: usize,
        batch: &BatchRequest,
    ) -> Result<i32, anyhow::Error>;

    /// Restores the runtime to a clean state between unrelated invocations.
    fn reset(&self, _msg: &Message) {}

    /// Returns the memory diffs produced since the runtime last started from
    /// its snapshot. Only consulted for thread tasks that must push their
    /// changes back to the master.
    fn take_snapshot_diffs(&self, _msg: &Message) -> Vec<SnapshotDiff> {
        Vec::new()
    }
}

/// Creates executors on demand.
pub trait ExecutorFactory: Debug + Send + Sync {
    /// Creates an executor bound to `msg`'s function.
    fn create(&self, msg: &Message) -> Result<Arc<Executor>, anyhow::Error>;

    /// Clears all function state held outside the scheduler on this host.
    fn flush_host(&self) {}
}

/// One queued unit of executor work.
#[derive(Debug)]
pub struct ExecutorTask {
    /// Index of the message within the batch.
    pub message_index: usize,
    /// The batch the message belongs to.
    pub batch: Arc<BatchRequest>,
    /// Countdown shared by all tasks of one `execute_tasks` call; the task
    /// that brings it to zero releases the executor's claim.
    pub batch_counter: Arc<AtomicUsize>,
    /// Whether the task's memory diffs must travel with its thread result.
    pub needs_snapshot_push: bool,
    /// Whether the runtime reset between invocations should be skipped.
    pub skip_reset: bool,
    pub(crate) scheduler: Weak<Scheduler>,
}

/// Shared between an executor's handle and its worker tasks.
#[derive(Debug)]
struct ExecutorShared {
    id: String,
    runtime: Arc<dyn FunctionRuntime>,
    claimed: Arc<AtomicBool>,
    last_exec: Arc<AtomicU64>,
    executing: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    now: NowFn,
}

/// A warm, claimable worker bound to one function.
#[derive(Debug)]
pub struct Executor {
    /// Unique identifier, for logs.
    pub id: String,
    bound_message: Message,
    shared: Arc<ExecutorShared>,
    task_txs: Mutex<Vec<UnboundedSender<ExecutorTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_queue: AtomicUsize,
}

static NEXT_EXECUTOR_SEQ: AtomicUsize = AtomicUsize::new(0);

impl Executor {
    /// Creates an executor bound to `msg`'s function, with `pool_size`
    /// worker tasks driving `runtime`.
    pub fn new(
        msg: &Message,
        runtime: Arc<dyn FunctionRuntime>,
        pool_size: usize,
        now: NowFn,
    ) -> Arc<Executor> {
        let seq = NEXT_EXECUTOR_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}-{}", msg.user, msg.function, seq);
        let shared = Arc::new(ExecutorShared {
            id: id.clone(),
            runtime,
            claimed: Arc::new(AtomicBool::new(false)),
            last_exec: Arc::new(AtomicU64::new(now())),
            executing: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            now,
        });

        let mut task_txs = Vec::with_capacity(pool_size.max(1));
        let mut workers = Vec::with_capacity(pool_size.max(1));
        for pool_idx in 0..pool_size.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            task_txs.push(tx);
            let shared = Arc::clone(&shared);
            let worker_id = id.clone();
            workers.push(task::spawn(
                || format!("executor-{worker_id}-{pool_idx}"),
                async move { worker_loop(pool_idx, rx, shared).await },
            ));
        }

        Arc::new(Executor {
            id,
            bound_message: msg.clone(),
            shared,
            task_txs: Mutex::new(task_txs),
            workers: Mutex::new(workers),
            next_queue: AtomicUsize::new(0),
        })
    }

    /// The message this executor was created for.
    pub fn bound_message(&self) -> &Message {
        &self.bound_message
    }

    /// Attempts to claim the executor. Returns whether the caller now holds
    /// the claim; at most one caller can until [`Executor::release_claim`].
    pub fn try_claim(&self) -> bool {
        self.shared
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the claim.
    pub fn release_claim(&self) {
        self.shared.claimed.store(false, Ordering::Release);
    }

    /// Whether the executor is currently claimed.
    pub fn is_claimed(&self) -> bool {
        self.shared.claimed.load(Ordering::Acquire)
    }

    /// The number of tasks queued but not yet started.
    pub fn queue_length(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Whether the executor has tasks queued or running.
    pub fn is_executing(&self) -> bool {
        self.shared.executing.load(Ordering::Acquire) > 0 || self.queue_length() > 0
    }

    /// Milliseconds since a task last finished on this executor.
    pub fn millis_since_last_exec(&self) -> u64 {
        (self.shared.now)().saturating_sub(self.shared.last_exec.load(Ordering::Acquire))
    }

    /// Enqueues the given batch indices onto the worker queues.
    ///
    /// The claim currently held on this executor is released when the last
    /// of these tasks completes.
    pub fn execute_tasks(
        &self,
        msg_idxs: Vec<usize>,
        batch: &Arc<BatchRequest>,
        scheduler: Weak<Scheduler>,
    ) {
        let is_threads = batch.batch_type == BatchType::Threads;
        let needs_snapshot_push = is_threads && !batch.single_host;
        let batch_counter = Arc::new(AtomicUsize::new(msg_idxs.len()));

        let task_txs = self.task_txs.lock().expect("lock poisoned");
        if task_txs.is_empty() {
            warn!(
                "executor {} already shut down; dropping {} tasks",
                self.id,
                msg_idxs.len()
            );
            return;
        }
        for msg_idx in msg_idxs {
            let queue = self.next_queue.fetch_add(1, Ordering::Relaxed) % task_txs.len();
            self.shared.queued.fetch_add(1, Ordering::AcqRel);
            let task = ExecutorTask {
                message_index: msg_idx,
                batch: Arc::clone(batch),
                batch_counter: Arc::clone(&batch_counter),
                needs_snapshot_push,
                // Threads deliberately share runtime state, so never reset
                // between them.
                skip_reset: is_threads,
                scheduler: scheduler.clone(),
            };
            if task_txs[queue].send(task).is_err() {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                warn!("executor {} worker {queue} is gone", self.id);
            }
        }
    }

    /// Shuts the executor down, draining its worker queues. In-flight tasks
    /// run to completion.
    pub async fn shutdown(&self) {
        debug!("shutting down executor {}", self.id);
        self.task_txs.lock().expect("lock poisoned").clear();
        let workers = {
            let mut workers = self.workers.lock().expect("lock poisoned");
            workers.drain(..).collect::<Vec<_>>()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    error!("executor {} worker panicked: {e}", self.id);
                }
            }
        }
    }
}

async fn worker_loop(
    pool_idx: usize,
    mut rx: UnboundedReceiver<ExecutorTask>,
    shared: Arc<ExecutorShared>,
) {
    while let Some(task) = rx.recv().await {
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        shared.executing.fetch_add(1, Ordering::AcqRel);

        let msg = task.batch.messages[task.message_index].clone();
        let scheduler = task.scheduler.upgrade();
        if let Some(scheduler) = &scheduler {
            scheduler.note_task_started();
        }

        trace!(
            "executor {} worker {pool_idx} running message {} ({})",
            shared.id,
            msg.id,
            msg.function_key()
        );
        let return_value = match shared
            .runtime
            .execute_task(pool_idx, task.message_index, &task.batch)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                error!(
                    "task {} for {} failed: {e:#}",
                    msg.id,
                    msg.function_key()
                );
                1
            }
        };
        shared.last_exec.store((shared.now)(), Ordering::Release);
        if !task.skip_reset {
            shared.runtime.reset(&msg);
        }

        if let Some(scheduler) = &scheduler {
            if task.batch.batch_type == BatchType::Threads {
                let key = if task.batch.single_host {
                    String::new()
                } else {
                    main_thread_snapshot_key(&msg)
                };
                let diffs = if task.needs_snapshot_push {
                    shared.runtime.take_snapshot_diffs(&msg)
                } else {
                    Vec::new()
                };
                if let Err(e) = scheduler
                    .set_thread_result(&msg, return_value, &key, diffs)
                    .await
                {
                    error!("failed to set result for thread {}: {e}", msg.id);
                }
            } else {
                let mut result = msg;
                result.return_value = return_value;
                let msg_id = result.id;
                if let Err(e) = scheduler.set_function_result(result).await {
                    error!("failed to set result for message {msg_id}: {e}");
                }
            }
            scheduler.vacate_slot();
            scheduler.note_task_finished();
        }

        shared.executing.fetch_sub(1, Ordering::AcqRel);
        if task.batch_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.claimed.store(false, Ordering::Release);
        }
    }
}

impl Scheduler {
    /// Returns a claimed (or, when oversubscribed, merely least-loaded)
    /// executor for `msg`'s function, creating one if no warm executor is
    /// available. Runs under the caller's write lock.
    pub(crate) fn claim_executor(
        &self,
        state: &mut SchedulerState,
        msg: &Message,
    ) -> Result<Arc<Executor>, SchedulingError> {
        let function_key = msg.function_key();
        if !state.executors.contains_key(&function_key) {
            state.suspended_executors.insert(
                function_key.clone(),
                Arc::new(std::sync::atomic::AtomicI32::new(0)),
            );
        }
        let executors = state.executors.entry(function_key.clone()).or_default();

        for executor in executors.iter() {
            if executor.try_claim() {
                debug!("reusing warm executor {} for {function_key}", executor.id);
                return Ok(Arc::clone(executor));
            }
        }

        // No warm executor available, so scale up, unless the function is
        // so oversubscribed that queueing onto an existing executor is the
        // better deal.
        let n_executors = executors.len();
        let n_suspended = state
            .suspended_executors
            .get(&function_key)
            .map_or(0, |ctr| ctr.load(Ordering::Acquire))
            .max(0) as usize;
        let max_subscription = 2 * std::thread::available_parallelism().map_or(1, |n| n.get());
        if n_executors.saturating_sub(n_suspended.min(max_subscription * 6))
            > max_subscription.max(1)
        {
            let mut min_queue_idx = 0;
            let mut min_queue_size = executors[0].queue_length();
            for (i, executor) in executors.iter().enumerate().skip(1) {
                if min_queue_size == 0 {
                    break;
                }
                let queue_size = executor.queue_length();
                if queue_size < min_queue_size {
                    min_queue_size = queue_size;
                    min_queue_idx = i;
                }
            }
            debug!("queueing {function_key} onto oversubscribed executor {min_queue_idx}");
            return Ok(Arc::clone(&executors[min_queue_idx]));
        }

        debug!(
            "scaling {function_key} from {n_executors} -> {}",
            n_executors + 1
        );
        let executor = self.executor_factory().create(msg)?;
        executor.try_claim();
        executors.push(Arc::clone(&executor));
        Ok(executor)
    }

    /// Retires executors that have sat idle past the bound timeout.
    ///
    /// When the last executor for a function goes, this host no longer keeps
    /// the function warm, so a non-master host also unregisters itself with
    /// the function's master. Returns how many executors were reaped.
    pub async fn reap_stale_executors(&self) -> usize {
        let bound_timeout = self.config().bound_timeout.as_millis() as u64;
        let mut reaped = Vec::new();
        let mut unregister = Vec::new();
        {
            let mut state = self.state.write().await;
            if state.executors.is_empty() {
                trace!("no executors to check for reaping");
                return 0;
            }

            let mut keys_to_remove = Vec::new();
            for (function_key, executors) in state.executors.iter_mut() {
                if executors.is_empty() {
                    continue;
                }
                trace!(
                    "checking {} executors for {function_key} for reaping",
                    executors.len()
                );
                let bound = executors
                    .last()
                    .expect("non-empty by check above")
                    .bound_message()
                    .clone();

                let mut keep = Vec::with_capacity(executors.len());
                for executor in executors.drain(..) {
                    let idle_millis = executor.millis_since_last_exec();
                    if idle_millis < bound_timeout || executor.is_executing() {
                        trace!(
                            "not reaping {}, last exec {idle_millis}ms ago (limit {bound_timeout}ms)",
                            executor.id
                        );
                        keep.push(executor);
                    } else {
                        debug!(
                            "reaping {}, last exec {idle_millis}ms ago (limit {bound_timeout}ms)",
                            executor.id
                        );
                        reaped.push(executor);
                    }
                }
                *executors = keep;

                if executors.is_empty() {
                    trace!("no remaining executors for {function_key}");
                    if bound.master_host != self.this_host() {
                        unregister.push(bound);
                    }
                    keys_to_remove.push(function_key.clone());
                }
            }
            for key in keys_to_remove {
                trace!("removing scheduler record for {key}, no more executors");
                state.executors.remove(&key);
            }
        }

        for executor in &reaped {
            executor.shutdown().await;
        }
        for bound in unregister {
            let req = UnregisterRequest {
                host: self.this_host().to_string(),
                user: bound.user.clone(),
                function: bound.function.clone(),
            };
            if let Err(e) = self
                .function_call_client(&bound.master_host)
                .unregister(req)
                .await
            {
                warn!(
                    "failed to unregister {} from {}: {e:#}",
                    bound.function_key(),
                    bound.master_host
                );
            }
        }
        reaped.len()
    }
}

#[cfg(test)]
mod tests {
    use stratus_ore::now::SYSTEM_TIME;
    use stratus_scheduler_client::BatchRequest;

    use crate::testing::RecordingRuntime;

    use super::*;

    fn test_executor(runtime: Arc<RecordingRuntime>) -> (Arc<Executor>, Message) {
        let msg = Message::new("alpha", "beta");
        let executor = Executor::new(&msg, runtime, 2, SYSTEM_TIME.clone());
        (executor, msg)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let (executor, _msg) = test_executor(Arc::new(RecordingRuntime::default()));
        assert!(executor.try_claim());
        assert!(!executor.try_claim());
        executor.release_claim();
        assert!(executor.try_claim());
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_completion_releases_claim() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (executor, msg) = test_executor(Arc::clone(&runtime));
        let batch = Arc::new(BatchRequest::new(vec![msg.clone(), msg.clone(), msg]));

        assert!(executor.try_claim());
        executor.execute_tasks(vec![0, 1, 2], &batch, Weak::new());
        runtime.wait_for_tasks(3).await;
        // The claim is released by whichever worker finishes last.
        stratus_ore::retry::Retry::default()
            .max_tries(50)
            .initial_backoff(std::time::Duration::from_millis(2))
            .retry_async(|_| async {
                if executor.is_claimed() {
                    Err(anyhow::anyhow!("still claimed"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(executor.queue_length(), 0);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queues() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (executor, msg) = test_executor(Arc::clone(&runtime));
        let batch = Arc::new(BatchRequest::new(vec![msg.clone(), msg]));
        executor.execute_tasks(vec![0, 1], &batch, Weak::new());
        executor.shutdown().await;
        assert_eq!(runtime.executed_indices().len(), 2);
        // Late dispatch after shutdown is dropped, not queued.
        executor.execute_tasks(vec![0], &batch, Weak::new());
        assert_eq!(executor.queue_length(), 0);
    }
}
