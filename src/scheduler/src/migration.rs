// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Migration detection: re-packing in-flight applications.
//!
//! Applications opt in by setting a migration check period on their
//! messages. While any of their messages are still running, a periodic
//! detector walks the original scheduling decision with two cursors: the
//! left one is a candidate destination (decisions pack the fullest hosts
//! first), the right one a candidate source. Whenever the two point at
//! different hosts and the destination has a free slot, the rightmost
//! message can move. Detected opportunities are broadcast to every host
//! involved in the function and recorded locally; the app's first result
//! arriving at the master clears them.

use std::sync::Arc;
use std::time::Duration;

use stratus_ore::task::{self, JoinHandleExt};
use stratus_scheduler_client::{
    BatchRequest, Migration, PendingMigrations, SchedulingDecision,
};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::error::SchedulingError;
use crate::scheduler::{Scheduler, SchedulerState};

impl Scheduler {
    /// Records an in-flight request for migration tracking and makes sure a
    /// detector task is running at the smallest active check period.
    ///
    /// MPI applications arrive as two requests (the original single message,
    /// then world-size - 1 more at world creation); the second request is
    /// appended to the existing entry so the detector sees the whole world.
    pub(crate) fn track_in_flight(
        self: &Arc<Self>,
        state: &mut SchedulerState,
        req: &BatchRequest,
        decision: &SchedulingDecision,
    ) -> Result<(), SchedulingError> {
        let first = req.first_message();
        match state.in_flight.get_mut(&decision.app_id) {
            Some((in_flight_req, in_flight_decision)) => {
                if !first.is_mpi {
                    return Err(SchedulingError::Internal(anyhow::anyhow!(
                        "there is already an in-flight request for app {}",
                        decision.app_id
                    )));
                }
                for (i, msg) in req.messages.iter().enumerate() {
                    in_flight_req.messages.push(msg.clone());
                    in_flight_decision.add_message(decision.hosts[i].clone(), msg);
                }
            }
            None => {
                state
                    .in_flight
                    .insert(decision.app_id, (req.clone(), decision.clone()));
            }
        }

        let period = first.migration_check_period;
        match &state.migration_task {
            Some((_, current_period)) if *current_period <= period => {
                if *current_period != period {
                    warn!(
                        "keeping migration check period {current_period}s for app {} \
                         (requested {period}s)",
                        decision.app_id
                    );
                }
            }
            _ => {
                let handle = self.start_migration_detector(period);
                state.migration_task = Some((handle, period));
            }
        }
        Ok(())
    }

    fn start_migration_detector(
        self: &Arc<Self>,
        period_secs: i32,
    ) -> stratus_ore::task::AbortOnDropHandle<()> {
        let scheduler = Arc::downgrade(self);
        task::spawn(|| "scheduler-migration-detector", async move {
            let period = Duration::from_secs(period_secs.max(1) as u64);
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match scheduler.upgrade() {
                    Some(scheduler) => scheduler.check_for_migration_opportunities().await,
                    None => break,
                }
            }
        })
        .abort_on_drop()
    }

    /// One detector tick: find opportunities under the read lock, then
    /// broadcast and record them under the write lock.
    pub async fn check_for_migration_opportunities(&self) {
        let found = {
            let state = self.state.read().await;
            self.find_migration_opportunities(&state).await
        };
        if found.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        for pending in found {
            self.broadcast_pending_migrations(&state, &pending).await;
            state.pending_migrations.insert(pending.app_id, pending);
        }
    }

    async fn find_migration_opportunities(
        &self,
        state: &SchedulerState,
    ) -> Vec<PendingMigrations> {
        let mut found = Vec::new();

        'apps: for (app_id, (req, decision)) in &state.in_flight {
            if state.pending_migrations.contains_key(app_id) {
                trace!(
                    "skipping app {app_id} as migration opportunity has already been recorded"
                );
                continue;
            }
            if decision.hosts.is_empty() {
                continue;
            }

            // The batch was originally bin-packed, so the decision has the
            // most loaded hosts on the left and the least loaded on the
            // right: the left cursor is a migration destination, the right
            // cursor a source.
            let hosts = &decision.hosts;
            let mut left = 0;
            let mut right = hosts.len() - 1;
            let mut resources = match self.migration_host_resources(state, &hosts[left]).await {
                Some(resources) => resources,
                None => continue 'apps,
            };
            let mut migrations = Vec::new();

            while left < right {
                if hosts[left] == hosts[right] {
                    // Same host on both sides: nothing to gain, look for
                    // another source.
                    right -= 1;
                    continue;
                }
                if resources.available_slots() == 0 {
                    // Destination is full, move on to the next one.
                    let previous = left;
                    left += 1;
                    if hosts[left] != hosts[previous] {
                        resources =
                            match self.migration_host_resources(state, &hosts[left]).await {
                                Some(resources) => resources,
                                None => continue 'apps,
                            };
                    }
                    continue;
                }
                migrations.push(Migration {
                    src_host: hosts[right].clone(),
                    dst_host: hosts[left].clone(),
                    msg: req.messages[right].clone(),
                });
                resources.used_slots += 1;
                right -= 1;
            }

            if migrations.is_empty() {
                debug!("no migration opportunity detected for app {app_id}");
            } else {
                debug!("detected migration opportunity for app {app_id}");
                found.push(PendingMigrations {
                    app_id: *app_id,
                    migrations,
                });
            }
        }

        found
    }

    // Local resources come from the already-held state rather than
    // `get_this_host_resources`, which would re-acquire the state lock.
    async fn migration_host_resources(
        &self,
        state: &SchedulerState,
        host: &str,
    ) -> Option<stratus_scheduler_client::HostResources> {
        if host == self.this_host() {
            let mut resources = state.this_host_resources;
            resources.used_slots = self
                .this_host_used_slots
                .load(std::sync::atomic::Ordering::Acquire);
            return Some(resources);
        }
        match self.get_host_resources(host).await {
            Ok(resources) => Some(resources),
            Err(e) => {
                warn!("skipping migration pass, resource query to {host} failed: {e:#}");
                None
            }
        }
    }

    async fn broadcast_pending_migrations(
        &self,
        state: &SchedulerState,
        pending: &PendingMigrations,
    ) {
        let msg = match pending.migrations.first() {
            Some(migration) => &migration.msg,
            None => return,
        };
        for host in state.registered_hosts_for(&msg.function_key()) {
            if host == self.this_host() {
                continue;
            }
            if let Err(e) = self
                .function_call_client(&host)
                .send_pending_migrations(pending.clone())
                .await
            {
                warn!("failed to send pending migrations for app {} to {host}: {e:#}", pending.app_id);
            }
        }
    }

    /// Accepts pending migrations broadcast by another host. A second
    /// arrival for the same app is an error.
    pub async fn add_pending_migration(
        &self,
        pending: PendingMigrations,
    ) -> Result<(), SchedulingError> {
        let mut state = self.state.write().await;
        if state.pending_migrations.contains_key(&pending.app_id) {
            return Err(SchedulingError::MigrationConflict(pending.app_id));
        }
        state.pending_migrations.insert(pending.app_id, pending);
        Ok(())
    }

    /// The migrations currently planned for an app, if any.
    pub async fn get_pending_app_migrations(&self, app_id: u32) -> Option<PendingMigrations> {
        let state = self.state.read().await;
        state.pending_migrations.get(&app_id).cloned()
    }

    /// Clears the in-flight and pending-migration records for an app.
    pub async fn remove_pending_migration(&self, app_id: u32) {
        let mut state = self.state.write().await;
        state.in_flight.remove(&app_id);
        state.pending_migrations.remove(&app_id);
    }
}
