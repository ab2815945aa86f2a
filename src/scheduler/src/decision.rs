// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The decision engine: maps a batch onto the fleet.
//!
//! Packing is greedy and deterministic: local slots first, then hosts
//! already registered for the function in registration order, then the rest
//! of the available fleet in sorted order, and as a last resort an overload
//! host. Determinism matters because the cached-decision table assumes that
//! identical input produces identical output.
//!
//! Remote resource queries that fail are absorbed: the host simply
//! contributes zero slots to this pass. Only a structural mismatch between
//! batch and host vector is fatal.

use std::collections::HashMap;
use std::iter;

use rand::Rng;
use stratus_scheduler_client::{BatchRequest, SchedulingDecision, TopologyHint};
use tracing::{debug, error, trace, warn};

use crate::error::SchedulingError;
use crate::registry::{self, HOST_CACHE_TTL};
use crate::scheduler::{Scheduler, SchedulerState};

/// A previously computed host vector, reusable for batches of the same
/// shape.
#[derive(Clone, Debug)]
pub(crate) struct CachedDecision {
    pub hosts: Vec<String>,
    pub group_id: i32,
}

/// Remembers decisions keyed by function and batch size.
#[derive(Debug, Default)]
pub(crate) struct DecisionCache {
    decisions: HashMap<String, CachedDecision>,
}

impl DecisionCache {
    fn key(req: &BatchRequest) -> String {
        format!("{}_x{}", req.first_message().function_key(), req.len())
    }

    pub fn get(&self, req: &BatchRequest) -> Option<&CachedDecision> {
        self.decisions.get(&Self::key(req))
    }

    pub fn insert(&mut self, req: &BatchRequest, decision: &SchedulingDecision) {
        // Grouped batches keep their group id; ungrouped ones get a fresh
        // one so that replays of the decision can re-form the group.
        let group_id = if decision.group_id != 0 {
            decision.group_id
        } else {
            rand::thread_rng().gen_range(1..i32::MAX)
        };
        self.decisions.insert(
            Self::key(req),
            CachedDecision {
                hosts: decision.hosts.clone(),
                group_id,
            },
        );
    }

    pub fn clear(&mut self) {
        self.decisions.clear();
    }
}

impl Scheduler {
    /// Computes a decision for a batch without dispatching it.
    pub async fn make_scheduling_decision(
        &self,
        req: &mut BatchRequest,
        hint: TopologyHint,
    ) -> Result<SchedulingDecision, SchedulingError> {
        let mut state = self.state.write().await;
        self.do_scheduling_decision(&mut state, req, hint).await
    }

    pub(crate) async fn do_scheduling_decision(
        &self,
        state: &mut SchedulerState,
        req: &mut BatchRequest,
        mut hint: TopologyHint,
    ) -> Result<SchedulingDecision, SchedulingError> {
        let n_messages = req.len();
        let first = req.first_message().clone();
        let function_key = first.function_key();
        let this_host = self.this_host().to_string();
        let host_kind_different = first.is_storage != self.config.is_storage_node;

        if self.config.no_topology_hints && hint != TopologyHint::None {
            warn!("ignoring topology hint {hint} passed to scheduler as hints are disabled");
            hint = TopologyHint::None;
        }

        if hint == TopologyHint::Cached {
            if let Some(cached) = state.decision_cache.get(req).cloned() {
                debug!(
                    "using cached decision for {function_key} {}, group {}",
                    first.app_id, cached.group_id
                );
                let mut decision = SchedulingDecision::new(first.app_id, cached.group_id);
                for (i, msg) in req.messages.iter_mut().enumerate() {
                    // Reuse the group id.
                    msg.group_id = cached.group_id;
                    msg.group_size = n_messages as i32;
                    decision.add_message(cached.hosts[i].clone(), msg);
                }
                return Ok(decision);
            }
            debug!(
                "no cached decision found for {n_messages} x {function_key} in app {}",
                first.app_id
            );
        }

        let mut hosts: Vec<String> = Vec::with_capacity(n_messages);

        if hint == TopologyHint::ForceLocal {
            trace!("scheduling {n_messages}/{n_messages} of {function_key} locally (force local)");
            hosts.extend(iter::repeat(this_host.clone()).take(n_messages));
        } else {
            // At this point we know we're the master host, and we've not
            // been asked to force full local execution.
            let mut slots = state.this_host_resources.slots;
            if hint == TopologyHint::Underfull {
                slots /= 2;
            }
            let available = (slots
                - self
                    .this_host_used_slots
                    .load(std::sync::atomic::Ordering::Acquire))
            .max(0) as usize;
            let n_locally = if host_kind_different {
                // Never execute the wrong kind (storage/compute) of call
                // locally.
                0
            } else {
                available.min(n_messages)
            };

            trace!("scheduling {n_locally}/{n_messages} of {function_key} locally");
            hosts.extend(iter::repeat(this_host.clone()).take(n_locally));

            // If some are left, distribute over already registered hosts
            // first.
            let mut remainder = n_messages - n_locally;
            if !host_kind_different && remainder > 0 {
                for host in state.registered_hosts_for(&function_key) {
                    if remainder == 0 {
                        break;
                    }
                    let resources = match self.get_host_resources(&host).await {
                        Ok(resources) => resources,
                        Err(e) => {
                            warn!("resource query to {host} failed, counting zero slots: {e:#}");
                            continue;
                        }
                    };
                    let n_on_host = (resources.available_slots() as usize).min(remainder);
                    // Under NEVER_ALONE we never choose a host unless we can
                    // schedule at least two requests on it.
                    if hint == TopologyHint::NeverAlone && n_on_host < 2 {
                        continue;
                    }
                    trace!(
                        "scheduling {n_on_host}/{n_messages} of {function_key} on {host} (registered)"
                    );
                    hosts.extend(iter::repeat(host).take(n_on_host));
                    remainder -= n_on_host;
                }
            }

            // Then over unregistered available hosts.
            let mut last_host = None;
            if remainder > 0 {
                let unregistered: Vec<String> = if host_kind_different {
                    self.registry
                        .list_hosts_for_message(&first)
                        .await
                        .map_err(SchedulingError::Internal)?
                        .into_iter()
                        .collect()
                } else {
                    self.unregistered_hosts(state, &function_key).await?
                };
                for host in unregistered {
                    if remainder == 0 {
                        break;
                    }
                    if host == this_host {
                        continue;
                    }
                    last_host = Some(host.clone());
                    let resources = match self.get_host_resources(&host).await {
                        Ok(resources) => resources,
                        Err(e) => {
                            warn!("resource query to {host} failed, counting zero slots: {e:#}");
                            continue;
                        }
                    };
                    let n_on_host = (resources.available_slots() as usize).min(remainder);
                    if hint == TopologyHint::NeverAlone && n_on_host < 2 {
                        continue;
                    }
                    trace!(
                        "scheduling {n_on_host}/{n_messages} of {function_key} on {host} (unregistered)"
                    );
                    if n_on_host > 0 && !host_kind_different {
                        state.add_registered_host(&function_key, &host);
                    }
                    hosts.extend(iter::repeat(host).take(n_on_host));
                    remainder -= n_on_host;
                }
            }

            // No more capacity anywhere; overload as a last resort.
            if remainder > 0 {
                let mut overloaded_host = if host_kind_different {
                    last_host.unwrap_or_else(|| this_host.clone())
                } else {
                    this_host.clone()
                };
                // Under NEVER_ALONE, pile onto the last host we actually
                // chose rather than the local host.
                if hint == TopologyHint::NeverAlone {
                    if let Some(last) = hosts.last() {
                        overloaded_host = last.clone();
                    }
                }
                debug!(
                    "overloading {remainder}/{n_messages} {function_key} onto {overloaded_host}"
                );
                hosts.extend(iter::repeat(overloaded_host).take(remainder));
            }
        }

        if hosts.len() != n_messages {
            error!(
                "serious scheduling error: {} != {n_messages}",
                hosts.len()
            );
            return Err(SchedulingError::InvalidSchedule {
                decision: hosts.len(),
                batch: n_messages,
            });
        }

        let mut decision = SchedulingDecision::new(first.app_id, first.group_id);
        for (i, msg) in req.messages.iter().enumerate() {
            decision.add_message(hosts[i].clone(), msg);
        }

        if hint == TopologyHint::Cached {
            state.decision_cache.insert(req, &decision);
        }

        Ok(decision)
    }

    /// Returns the available hosts not yet registered for the function,
    /// refreshing the cached fleet view once if the difference comes up
    /// empty.
    async fn unregistered_hosts(
        &self,
        state: &mut SchedulerState,
        function_key: &str,
    ) -> Result<Vec<String>, SchedulingError> {
        let set = registry::global_set_name(self.config.is_storage_node);
        for no_cache in [false, true] {
            if state.available_hosts_cache.is_empty() || no_cache {
                state.available_hosts_cache = self
                    .registry
                    .list_hosts(set, HOST_CACHE_TTL)
                    .await
                    .map_err(SchedulingError::Internal)?;
            }
            let registered = state.registered_hosts_for(function_key);
            let unregistered: Vec<String> = state
                .available_hosts_cache
                .iter()
                .filter(|host| !registered.iter().any(|r| r == *host))
                .cloned()
                .collect();
            if !unregistered.is_empty() || no_cache {
                return Ok(unregistered);
            }
        }
        unreachable!("loop returns on its second pass")
    }
}

#[cfg(test)]
mod tests {
    use stratus_scheduler_client::{BatchRequest, HostResources, TopologyHint};
    use stratus_store::KeyValueStore;

    use crate::registry::AVAILABLE_STORAGE_HOST_SET;
    use crate::testing::{messages, TestEnv};

    fn free(slots: i32, used: i32) -> HostResources {
        HostResources {
            slots,
            used_slots: used,
            load_average: 0.0,
        }
    }

    #[tokio::test]
    async fn test_normal_packs_local_then_registered() {
        let env = TestEnv::new("hostA", 2).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        env.network.set_host_resources("hostB", free(3, 1));

        let mut req = BatchRequest::new(messages("alpha", "beta", 4, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::None)
            .await
            .unwrap();
        assert_eq!(decision.hosts, vec!["hostA", "hostA", "hostB", "hostB"]);
    }

    #[tokio::test]
    async fn test_overloads_local_when_fleet_is_full() {
        let env = TestEnv::new("hostA", 1).await;
        let mut req = BatchRequest::new(messages("alpha", "beta", 3, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::None)
            .await
            .unwrap();
        assert_eq!(decision.hosts, vec!["hostA", "hostA", "hostA"]);
    }

    #[tokio::test]
    async fn test_underfull_halves_local_slots() {
        let env = TestEnv::new("hostA", 4).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        env.network.set_host_resources("hostB", free(2, 0));

        let mut req = BatchRequest::new(messages("alpha", "beta", 4, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::Underfull)
            .await
            .unwrap();
        assert_eq!(decision.hosts, vec!["hostA", "hostA", "hostB", "hostB"]);
    }

    #[tokio::test]
    async fn test_never_alone_skips_hosts_with_one_slot() {
        let env = TestEnv::new("hostA", 1).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        env.network.set_host_resources("hostB", free(1, 0));

        let mut req = BatchRequest::new(messages("alpha", "beta", 3, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::NeverAlone)
            .await
            .unwrap();
        // hostB would take a single message, so it is skipped and the
        // overload lands on the last chosen host.
        assert_eq!(decision.hosts, vec!["hostA", "hostA", "hostA"]);
    }

    #[tokio::test]
    async fn test_failed_resource_query_contributes_zero_slots() {
        let env = TestEnv::new("hostA", 1).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        env.scheduler
            .add_registered_host("hostC", "alpha", "beta")
            .await;
        env.network.fail_resource_queries("hostB");
        env.network.set_host_resources("hostC", free(2, 0));

        let mut req = BatchRequest::new(messages("alpha", "beta", 3, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::None)
            .await
            .unwrap();
        assert_eq!(decision.hosts, vec!["hostA", "hostC", "hostC"]);
    }

    #[tokio::test]
    async fn test_unregistered_hosts_get_packed_and_registered() {
        let env = TestEnv::new("hostA", 1).await;
        env.add_available_host("hostB", free(2, 0)).await;

        let mut req = BatchRequest::new(messages("alpha", "beta", 3, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::None)
            .await
            .unwrap();
        assert_eq!(decision.hosts, vec!["hostA", "hostB", "hostB"]);
        // A host that received messages is now registered for the function.
        assert_eq!(
            env.scheduler
                .get_function_registered_hosts("alpha", "beta")
                .await,
            vec!["hostB".to_string()]
        );
    }

    #[tokio::test]
    async fn test_storage_messages_never_run_on_compute_host() {
        let env = TestEnv::new("hostA", 4).await;
        env.store
            .set_add(AVAILABLE_STORAGE_HOST_SET, "storage1")
            .await
            .unwrap();
        env.network.set_host_resources("storage1", free(2, 0));

        let mut msgs = messages("alpha", "beta", 3, "hostA");
        for msg in &mut msgs {
            msg.is_storage = true;
        }
        let mut req = BatchRequest::new(msgs);
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::None)
            .await
            .unwrap();
        // Two fit on the storage host; the overflow lands on the last tried
        // remote, not on this (compute) host.
        assert_eq!(decision.hosts, vec!["storage1", "storage1", "storage1"]);
    }

    #[tokio::test]
    async fn test_cached_decision_is_reused_and_rewrites_group() {
        let env = TestEnv::new("hostA", 2).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        env.network.set_host_resources("hostB", free(2, 0));

        let mut first_req = BatchRequest::new(messages("alpha", "beta", 4, "hostA"));
        let first = env
            .scheduler
            .make_scheduling_decision(&mut first_req, TopologyHint::Cached)
            .await
            .unwrap();

        // Shrink the remote to prove the second decision comes from the
        // cache rather than a fresh pass.
        env.network.set_host_resources("hostB", free(0, 0));
        let mut second_req = BatchRequest::new(messages("alpha", "beta", 4, "hostA"));
        let second = env
            .scheduler
            .make_scheduling_decision(&mut second_req, TopologyHint::Cached)
            .await
            .unwrap();

        assert_eq!(first.hosts, second.hosts);
        assert_ne!(second.group_id, 0);
        for msg in &second_req.messages {
            assert_eq!(msg.group_id, second.group_id);
            assert_eq!(msg.group_size, 4);
        }
    }

    #[tokio::test]
    async fn test_no_topology_hints_coerces_to_none() {
        let mut config = crate::config::SchedulerConfig::for_tests("hostA", 1);
        config.no_topology_hints = true;
        let env = TestEnv::with_config(config).await;
        env.scheduler
            .add_registered_host("hostB", "alpha", "beta")
            .await;
        env.network.set_host_resources("hostB", free(2, 0));

        // FORCE_LOCAL would put all three here regardless of slots; with
        // hints disabled the batch goes through normal packing instead.
        let mut req = BatchRequest::new(messages("alpha", "beta", 3, "hostA"));
        let decision = env
            .scheduler
            .make_scheduling_decision(&mut req, TopologyHint::ForceLocal)
            .await
            .unwrap();
        assert_eq!(decision.hosts, vec!["hostA", "hostB", "hostB"]);
    }
}
