// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scheduling decisions and topology hints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// A caller's preference for how a batch should be spread over the fleet.
///
/// Hints form a closed set; the string form exists only at the wire boundary
/// (see [`Message::topology_hint`]).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TopologyHint {
    /// No preference. Scheduled identically to [`TopologyHint::Normal`].
    #[default]
    None,
    /// Greedy packing: local slots first, then registered hosts, then the
    /// rest of the fleet.
    Normal,
    /// Every message runs on the local host, regardless of slots.
    ForceLocal,
    /// Like `Normal`, but skip any host that would receive fewer than two
    /// messages.
    NeverAlone,
    /// Like `Normal`, but advertise only half the local slots.
    Underfull,
    /// Reuse a previously computed decision for an identically shaped batch.
    Cached,
}

impl FromStr for TopologyHint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<TopologyHint, Self::Err> {
        match s {
            "" | "NONE" => Ok(TopologyHint::None),
            "NORMAL" => Ok(TopologyHint::Normal),
            "FORCE_LOCAL" => Ok(TopologyHint::ForceLocal),
            "NEVER_ALONE" => Ok(TopologyHint::NeverAlone),
            "UNDERFULL" => Ok(TopologyHint::Underfull),
            "CACHED" => Ok(TopologyHint::Cached),
            other => Err(anyhow::anyhow!("unknown topology hint: {other}")),
        }
    }
}

impl fmt::Display for TopologyHint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TopologyHint::None => "NONE",
            TopologyHint::Normal => "NORMAL",
            TopologyHint::ForceLocal => "FORCE_LOCAL",
            TopologyHint::NeverAlone => "NEVER_ALONE",
            TopologyHint::Underfull => "UNDERFULL",
            TopologyHint::Cached => "CACHED",
        };
        f.write_str(s)
    }
}

/// A mapping from message index in a batch to destination host.
///
/// Produced once per batch by the decision engine and consumed by the
/// dispatcher. The parallel vectors are all indexed by message position;
/// `hosts.len()` always equals the batch length for a valid decision.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingDecision {
    /// The application the batch belongs to.
    pub app_id: u32,
    /// The collective group the batch belongs to, or zero.
    pub group_id: i32,
    /// Destination host per message.
    pub hosts: Vec<String>,
    /// Message id per message.
    pub message_ids: Vec<u32>,
    /// Group index per message.
    pub group_idxs: Vec<i32>,
    /// For decisions that forwarded the batch elsewhere, the host that now
    /// owns it.
    pub return_host: Option<String>,
}

impl SchedulingDecision {
    /// Creates an empty decision for the given app and group.
    pub fn new(app_id: u32, group_id: i32) -> SchedulingDecision {
        SchedulingDecision {
            app_id,
            group_id,
            ..Default::default()
        }
    }

    /// Appends a message scheduled onto `host`.
    pub fn add_message(&mut self, host: String, msg: &Message) {
        self.hosts.push(host);
        self.message_ids.push(msg.id);
        self.group_idxs.push(msg.group_idx);
    }

    /// The number of scheduled messages.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the decision schedules no messages.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_wire_round_trip() {
        for hint in [
            TopologyHint::None,
            TopologyHint::Normal,
            TopologyHint::ForceLocal,
            TopologyHint::NeverAlone,
            TopologyHint::Underfull,
            TopologyHint::Cached,
        ] {
            assert_eq!(hint.to_string().parse::<TopologyHint>().unwrap(), hint);
        }
        // The empty wire string means "no hint".
        assert_eq!("".parse::<TopologyHint>().unwrap(), TopologyHint::None);
        assert!("BOGUS".parse::<TopologyHint>().is_err());
    }

    #[test]
    fn test_decision_tracks_parallel_vectors() {
        let mut msg = Message::new("alpha", "beta");
        msg.group_idx = 3;
        let mut decision = SchedulingDecision::new(msg.app_id, 7);
        decision.add_message("hostA".to_string(), &msg);
        assert_eq!(decision.len(), 1);
        assert_eq!(decision.hosts, vec!["hostA".to_string()]);
        assert_eq!(decision.message_ids, vec![msg.id]);
        assert_eq!(decision.group_idxs, vec![3]);
    }
}
