// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Load-balance plug-point.
//!
//! A policy reorders the candidate hosts a decision pass will walk. The
//! greedy packing itself is unchanged; only the visiting order varies.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use stratus_scheduler_client::HostResources;

/// Orders candidate hosts for a packing pass.
pub trait LoadBalancePolicy: Debug + Send + Sync {
    /// Reorders `hosts` into visiting order.
    fn dispatch(&self, hosts: Vec<(String, HostResources)>) -> Vec<(String, HostResources)>;
}

/// Visits hosts in ascending order of load average.
#[derive(Debug, Default)]
pub struct LeastLoadPolicy;

impl LoadBalancePolicy for LeastLoadPolicy {
    fn dispatch(&self, mut hosts: Vec<(String, HostResources)>) -> Vec<(String, HostResources)> {
        hosts.sort_by(|a, b| {
            a.1.load_average
                .partial_cmp(&b.1.load_average)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hosts
    }
}

/// Visits hosts in descending order of free slots.
#[derive(Debug, Default)]
pub struct MostSlotsPolicy;

impl LoadBalancePolicy for MostSlotsPolicy {
    fn dispatch(&self, mut hosts: Vec<(String, HostResources)>) -> Vec<(String, HostResources)> {
        hosts.sort_by_key(|(_, r)| std::cmp::Reverse(r.available_slots()));
        hosts
    }
}

/// Rotates the starting host on every pass.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next: AtomicUsize,
}

impl LoadBalancePolicy for RoundRobinPolicy {
    fn dispatch(&self, mut hosts: Vec<(String, HostResources)>) -> Vec<(String, HostResources)> {
        if hosts.is_empty() {
            return hosts;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(start);
        hosts
    }
}
