// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility libraries for Stratus.
//!
//! **ore** (_n_): the raw material from which more valuable materials are
//! extracted. Extensions to the Rust standard library that are of the
//! quality and generality to be considered for inclusion upstream, but
//! which we maintain ourselves.

#![warn(missing_docs)]
#![warn(clippy::clone_on_ref_ptr)]

pub mod now;
pub mod retry;
pub mod task;
pub mod test;
