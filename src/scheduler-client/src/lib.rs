// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The public API for the Stratus scheduling plane.
//!
//! This crate holds everything two hosts need to agree on in order to trade
//! work: the message and batch data model, scheduling decisions and topology
//! hints, and the client traits through which a scheduler reaches its
//! collaborators (peer schedulers, snapshot receivers, the point-to-point
//! broker). The scheduler itself lives in `stratus-scheduler`; transports
//! implement the traits defined here.

pub mod client;
pub mod decision;
pub mod message;

pub use crate::client::{
    Broker, ClientFactory, FunctionCallClient, FunctionCallRequest, FunctionCallResponse,
    Snapshot, SnapshotClient, SnapshotDiff, SnapshotRegistry,
};
pub use crate::decision::{SchedulingDecision, TopologyHint};
pub use crate::message::{
    BatchRequest, BatchType, HostResources, Message, MessageKind, Migration, PendingMigrations,
    UnregisterRequest,
};
