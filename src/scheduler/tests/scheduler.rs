// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Integration tests for the scheduler: full call → decision → dispatch →
//! result round trips against an in-process mock fleet.

use std::future::Future;
use std::time::{Duration, Instant};

use stratus_scheduler::error::SchedulingError;
use stratus_scheduler::testing::{local_batch, messages, TestEnv};
use stratus_scheduler::SchedulerConfig;
use stratus_scheduler_client::{
    BatchRequest, BatchType, HostResources, Message, MessageKind, Snapshot, TopologyHint,
};
use tokio::time;

fn free(slots: i32, used: i32) -> HostResources {
    HostResources {
        slots,
        used_slots: used,
        load_average: 0.0,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_local_single_message() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;

    let req = local_batch("alpha", "beta", 1, "hostA");
    let msg = req.messages[0].clone();
    let decision = env.scheduler.call_functions(req, None).await.unwrap();
    assert_eq!(decision.hosts, vec!["hostA"]);

    let result = env
        .scheduler
        .get_function_result(msg.id, Duration::from_secs(1), None)
        .await
        .unwrap();
    assert_eq!(result.id, msg.id);
    assert_eq!(result.return_value, (msg.id % 1000) as i32);
    assert_eq!(result.executed_host, "hostA");

    assert_eq!(env.scheduler.get_function_executor_count(&msg).await, 1);
    // At steady state, with no in-flight local tasks, all slots are vacated.
    eventually("slots to be vacated", || async {
        env.scheduler.get_this_host_resources().await.used_slots == 0
    })
    .await;
}

#[tokio::test]
async fn test_pack_across_registered_hosts_dispatches_remote_first() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 2).await;
    env.scheduler
        .add_registered_host("hostR1", "alpha", "beta")
        .await;
    env.network.set_host_resources("hostR1", free(3, 1));

    let req = BatchRequest::new(messages("alpha", "beta", 4, "hostA"));
    let decision = env.scheduler.call_functions(req, None).await.unwrap();
    assert_eq!(decision.hosts, vec!["hostA", "hostA", "hostR1", "hostR1"]);

    let batches = env.network.executed_batches();
    assert_eq!(batches.len(), 1);
    let (host, sub_batch) = &batches[0];
    assert_eq!(host, "hostR1");
    assert_eq!(sub_batch.len(), 2);
    assert!(sub_batch.messages.iter().all(|m| !m.executes_locally));

    // The remote share went out before any local execution began.
    env.runtime.wait_for_tasks(2).await;
    let events = env.network.events();
    let remote_send = events
        .iter()
        .position(|e| e == "execute_functions:hostR1")
        .expect("remote dispatch event");
    let first_task = events
        .iter()
        .position(|e| e.starts_with("task:"))
        .expect("local task event");
    assert!(remote_send < first_task);
}

#[tokio::test]
async fn test_force_local_overrides_resources() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 1).await;
    env.runtime.set_delay(Duration::from_millis(200));

    let mut req = local_batch("alpha", "beta", 3, "hostA");
    req.messages[0].topology_hint = TopologyHint::ForceLocal.to_string();
    let decision = env.scheduler.call_functions(req, None).await.unwrap();
    assert_eq!(decision.hosts, vec!["hostA", "hostA", "hostA"]);

    // All three slots are consumed despite the host advertising one.
    assert_eq!(env.scheduler.get_this_host_resources().await.used_slots, 3);
    env.runtime.wait_for_tasks(3).await;
    eventually("slots to be vacated", || async {
        env.scheduler.get_this_host_resources().await.used_slots == 0
    })
    .await;
}

#[tokio::test]
async fn test_forwarding_to_master() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;

    let req = BatchRequest::new(messages("alpha", "beta", 3, "hostM"));
    let decision = env.scheduler.call_functions(req, None).await.unwrap();
    assert_eq!(decision.return_host.as_deref(), Some("hostM"));
    assert!(decision.hosts.is_empty());

    let batches = env.network.executed_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, "hostM");
    assert_eq!(batches[0].1.len(), 3);
    // Forwarding consumes no local slots.
    assert_eq!(env.scheduler.get_this_host_resources().await.used_slots, 0);
}

#[tokio::test]
async fn test_missing_master_host_is_fatal() {
    let env = TestEnv::new("hostA", 4).await;
    let mut msgs = messages("alpha", "beta", 1, "hostA");
    msgs[0].master_host.clear();
    let err = env
        .scheduler
        .call_functions(BatchRequest::new(msgs), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulingError::NoMasterHost));
}

#[tokio::test]
async fn test_result_round_trip_via_store() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;

    let mut msg = Message::new("alpha", "beta");
    msg.master_host = "hostA".to_string();
    msg.return_value = 42;
    msg.output_data = b"out".to_vec();
    env.scheduler.set_function_result(msg.clone()).await.unwrap();

    let result = env
        .scheduler
        .get_function_result(msg.id, Duration::from_secs(1), None)
        .await
        .unwrap();
    assert_eq!(result.id, msg.id);
    assert_eq!(result.return_value, 42);
    assert_eq!(result.output_data, b"out".to_vec());
    assert_eq!(result.executed_host, "hostA");
    assert_ne!(result.finish_timestamp, 0);
}

#[tokio::test]
async fn test_get_function_result_timeouts() {
    let env = TestEnv::new("hostA", 4).await;

    assert!(matches!(
        env.scheduler.get_function_result(0, Duration::ZERO, None).await,
        Err(SchedulingError::ZeroMessageId)
    ));

    // Blocking waits surface the timeout...
    let err = env
        .scheduler
        .get_function_result(12345, Duration::from_millis(20), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulingError::NoResponse(12345)));

    // ...while non-blocking polls return the empty sentinel.
    let empty = env
        .scheduler
        .get_function_result(12345, Duration::ZERO, None)
        .await
        .unwrap();
    assert_eq!(empty.kind, MessageKind::Empty);

    // Same for an unfulfilled local slot.
    env.scheduler.add_local_result_slot(777);
    let empty = env
        .scheduler
        .get_function_result(777, Duration::ZERO, None)
        .await
        .unwrap();
    assert_eq!(empty.kind, MessageKind::Empty);
}

#[tokio::test]
async fn test_get_function_result_async_delivers_to_handler() {
    let env = TestEnv::new("hostA", 4).await;
    let (tx, rx) = tokio::sync::oneshot::channel();

    let mut msg = Message::new("alpha", "beta");
    msg.master_host = "hostA".to_string();
    msg.executes_locally = true;
    env.scheduler.add_local_result_slot(msg.id);
    env.scheduler
        .get_function_result_async(msg.id, Duration::from_secs(1), move |result| {
            tx.send(result).unwrap();
        })
        .unwrap();

    env.scheduler.set_function_result(msg.clone()).await.unwrap();
    let delivered = rx.await.unwrap();
    assert_eq!(delivered.id, msg.id);
}

#[tokio::test]
async fn test_thread_results_rendezvous() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;

    let req = BatchRequest::of_type(BatchType::Threads, messages("alpha", "beta", 2, "hostA"));
    let expected: Vec<(u32, i32)> = req
        .messages
        .iter()
        .map(|m| (m.id, (m.id % 1000) as i32))
        .collect();
    env.scheduler.call_functions(req.clone(), None).await.unwrap();

    let results = env.scheduler.await_thread_results(&req).await.unwrap();
    assert_eq!(results, expected);

    // Threads share a single executor.
    assert_eq!(
        env.scheduler
            .get_function_executor_count(&req.messages[0])
            .await,
        1
    );

    // Unknown ids error rather than hang.
    assert!(matches!(
        env.scheduler.await_thread_result(999_999).await,
        Err(SchedulingError::UnregisteredThread(999_999))
    ));
    env.scheduler.deregister_threads(&req).await;
    assert!(matches!(
        env.scheduler.await_thread_result(expected[0].0).await,
        Err(SchedulingError::UnregisteredThread(_))
    ));
}

#[tokio::test]
async fn test_group_mappings_published_before_dispatch() {
    let env = TestEnv::new("hostA", 4).await;

    let mut msgs = messages("alpha", "beta", 2, "hostA");
    for (i, msg) in msgs.iter_mut().enumerate() {
        msg.group_id = 9;
        msg.group_idx = i as i32 + 1;
    }
    let decision = env
        .scheduler
        .call_functions(BatchRequest::new(msgs), None)
        .await
        .unwrap();

    let mappings = env.broker.mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].hosts, decision.hosts);
}

#[tokio::test]
async fn test_mpi_rank_zero_joins_broker_mapping_only() {
    let env = TestEnv::new("hostA", 4).await;

    let mut msgs = messages("alpha", "beta", 2, "hostA");
    for (i, msg) in msgs.iter_mut().enumerate() {
        msg.group_id = 9;
        msg.group_idx = i as i32 + 1;
        msg.is_mpi = true;
        msg.mpi_world_size = 3;
    }
    let decision = env
        .scheduler
        .call_functions(BatchRequest::new(msgs), None)
        .await
        .unwrap();

    // The returned decision covers the two scheduled ranks; the published
    // mapping carries the synthetic rank-0 entry on this host as well.
    assert_eq!(decision.len(), 2);
    let mappings = env.broker.mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].len(), 3);
    assert_eq!(mappings[0].hosts[2], "hostA");
    assert_eq!(mappings[0].group_idxs[2], 0);
}

#[tokio::test]
async fn test_snapshot_distribution_pushes_then_updates() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 8).await;
    env.scheduler
        .add_registered_host("hostR1", "alpha", "beta")
        .await;
    env.network.set_host_resources("hostR1", free(4, 0));
    let snap = env.snapshots.get_or_create("snap-key");

    let mut req = BatchRequest::new(messages("alpha", "beta", 1, "hostA"));
    req.messages[0].snapshot_key = "snap-key".to_string();
    env.scheduler.call_functions(req, None).await.unwrap();
    assert_eq!(
        env.network.snapshot_pushes(),
        vec![("hostR1".to_string(), "snap-key".to_string())]
    );

    // The second dispatch finds the snapshot already pushed and sends only
    // the tracked changes, which are cleared afterwards.
    snap.add_tracked_change(stratus_scheduler_client::SnapshotDiff {
        offset: 0,
        data: b"delta".to_vec(),
    });
    let mut req = BatchRequest::new(messages("alpha", "beta", 1, "hostA"));
    req.messages[0].snapshot_key = "snap-key".to_string();
    env.scheduler.call_functions(req, None).await.unwrap();
    assert_eq!(
        env.network.snapshot_updates(),
        vec![("hostR1".to_string(), "snap-key".to_string(), 1)]
    );
    assert!(snap.tracked_changes().is_empty());
}

#[tokio::test]
async fn test_migration_detection_and_removal() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 1).await;
    env.scheduler
        .add_registered_host("hostR1", "alpha", "beta")
        .await;
    env.network.set_host_resources("hostR1", free(2, 0));
    env.runtime.set_delay(Duration::from_secs(2));

    let mut msgs = messages("alpha", "beta", 3, "hostA");
    for msg in &mut msgs {
        msg.migration_check_period = 60;
    }
    let app_id = msgs[0].app_id;
    let decision = env
        .scheduler
        .call_functions(BatchRequest::new(msgs), None)
        .await
        .unwrap();
    assert_eq!(decision.hosts, vec!["hostA", "hostR1", "hostR1"]);

    // Capacity frees up here: both messages on hostR1 can be repacked.
    env.scheduler
        .set_this_host_resources(free(4, 1))
        .await;
    env.scheduler.check_for_migration_opportunities().await;

    let pending = env
        .scheduler
        .get_pending_app_migrations(app_id)
        .await
        .expect("migration opportunity");
    assert_eq!(pending.migrations.len(), 2);
    for migration in &pending.migrations {
        assert_eq!(migration.src_host, "hostR1");
        assert_eq!(migration.dst_host, "hostA");
    }
    // The plan was broadcast to the function's registered hosts.
    let broadcast = env.network.pending_migrations();
    assert_eq!(broadcast.len(), 1);
    assert_eq!(broadcast[0].0, "hostR1");

    // A second tick does not double-report the same app.
    env.scheduler.check_for_migration_opportunities().await;
    assert_eq!(env.network.pending_migrations().len(), 1);

    env.scheduler.remove_pending_migration(app_id).await;
    assert!(env
        .scheduler
        .get_pending_app_migrations(app_id)
        .await
        .is_none());
}

#[tokio::test]
async fn test_reaper_unregisters_non_master_host() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;

    // A batch arriving from its master runs here under FORCE_LOCAL; once
    // its executor goes idle past the bound timeout, the reaper retires it
    // and tells the master this host is no longer warm.
    let mut req = BatchRequest::new(messages("alpha", "beta", 1, "hostM"));
    req.messages[0].topology_hint = TopologyHint::ForceLocal.to_string();
    let msg = req.messages[0].clone();
    env.scheduler.call_functions(req, None).await.unwrap();
    env.runtime.wait_for_tasks(1).await;

    assert_eq!(env.scheduler.get_function_executor_count(&msg).await, 1);
    time::sleep(Duration::from_millis(250)).await;
    let reaped = env.scheduler.reap_stale_executors().await;
    assert_eq!(reaped, 1);
    assert_eq!(env.scheduler.get_function_executor_count(&msg).await, 0);

    let unregisters = env.network.unregisters();
    assert_eq!(unregisters.len(), 1);
    assert_eq!(unregisters[0].0, "hostM");
    assert_eq!(unregisters[0].1.host, "hostA");
    assert_eq!(unregisters[0].1.user, "alpha");
    assert_eq!(unregisters[0].1.function, "beta");
}

#[tokio::test]
async fn test_broadcast_flush_reaches_fleet_and_factory() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;
    env.add_available_host("hostB", free(1, 0)).await;
    env.add_available_host("hostC", free(1, 0)).await;

    env.scheduler.broadcast_flush().await.unwrap();

    let mut flushed = env.network.flushes();
    flushed.sort();
    assert_eq!(flushed, vec!["hostB".to_string(), "hostC".to_string()]);
    assert_eq!(env.factory.flush_count(), 1);
    assert!(env.broker.clears() >= 1);
}

#[tokio::test]
async fn test_exec_graph_follows_chained_calls() {
    stratus_ore::test::init_logging();
    let env = TestEnv::new("hostA", 4).await;

    let mut parent = Message::new("alpha", "beta");
    parent.master_host = "hostA".to_string();
    let mut child = Message::new("alpha", "beta");
    child.master_host = "hostA".to_string();

    env.scheduler
        .set_function_result(parent.clone())
        .await
        .unwrap();
    env.scheduler
        .set_function_result(child.clone())
        .await
        .unwrap();
    env.scheduler
        .log_chained_function(parent.id, child.id)
        .await
        .unwrap();

    assert_eq!(
        env.scheduler.get_chained_functions(parent.id).await.unwrap(),
        std::collections::BTreeSet::from([child.id])
    );
    let graph = env.scheduler.get_function_exec_graph(parent.id).await.unwrap();
    assert_eq!(graph.root.msg.id, parent.id);
    assert_eq!(graph.root.children.len(), 1);
    assert_eq!(graph.root.children[0].msg.id, child.id);
}

#[tokio::test]
async fn test_recorded_messages_split_local_and_shared() {
    let env = TestEnv::new("hostA", 1).await;
    env.scheduler
        .add_registered_host("hostR1", "alpha", "beta")
        .await;
    env.network.set_host_resources("hostR1", free(1, 0));

    let req = BatchRequest::new(messages("alpha", "beta", 2, "hostA"));
    env.scheduler.call_functions(req, None).await.unwrap();

    assert_eq!(env.scheduler.get_recorded_messages_all().await.len(), 2);
    assert_eq!(env.scheduler.get_recorded_messages_local().await.len(), 1);
    let shared = env.scheduler.get_recorded_messages_shared().await;
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].0, "hostR1");

    env.scheduler.clear_recorded_messages().await;
    assert!(env.scheduler.get_recorded_messages_all().await.is_empty());
}

#[tokio::test]
async fn test_monitor_file_tracks_task_counters() {
    stratus_ore::test::init_logging();
    let path = std::env::temp_dir().join(format!("stratus-monitor-{}", rand_suffix()));
    let mut config = SchedulerConfig::for_tests("hostA", 4);
    config.scheduler_monitor_file = Some(path.clone());
    let env = TestEnv::with_config(config).await;

    let req = local_batch("alpha", "beta", 2, "hostA");
    env.scheduler.call_functions(req, None).await.unwrap();
    env.runtime.wait_for_tasks(2).await;

    eventually("monitor counters to settle", || async {
        std::fs::read_to_string(&path).map_or(false, |contents| {
            contents == "local_sched,0,waiting_queued,0,started,0,waiting,0,active,0\n"
        })
    })
    .await;
    std::fs::remove_file(&path).unwrap();
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .subsec_nanos() as u64
}
