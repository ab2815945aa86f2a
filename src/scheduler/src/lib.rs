// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Distributed scheduling and dispatch for the Stratus fleet.
//!
//! Every host in a Stratus deployment runs one [`Scheduler`]. A caller hands
//! it a batch of function invocations; the scheduler decides which host
//! should run each message, pushes snapshots and point-to-point mappings to
//! the hosts involved, forwards the remote shares, and executes the local
//! share on a pool of warm executors. Results flow back through a local
//! rendezvous table when caller and executor share a host, and through the
//! deployment-wide store otherwise. Two background tasks keep the host
//! honest: a reaper that retires idle executors, and a migration detector
//! that re-packs in-flight applications when capacity frees up.
//!
//! The scheduler's collaborators (transports, the shared store, the snapshot
//! subsystem, the function runtime itself) are reached exclusively through
//! the traits in `stratus-scheduler-client` and `stratus-store`, which keeps
//! this crate free of any wire or runtime specifics.

pub mod config;
pub mod error;
pub mod exec_graph;
pub mod executor;
pub mod loadbalance;
pub mod migration;
pub mod registry;
pub mod server;
pub mod testing;

mod clients;
mod decision;
mod monitor;
mod scheduler;

pub use crate::config::{LogLevel, SchedulerConfig};
pub use crate::error::SchedulingError;
pub use crate::exec_graph::{ExecGraph, ExecGraphNode};
pub use crate::executor::{Executor, ExecutorFactory, ExecutorTask, FunctionRuntime};
pub use crate::registry::HostRegistry;
pub use crate::scheduler::{Scheduler, SchedulerContext};
pub use crate::server::FunctionCallServer;
