// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tokio task utilities.
//!
//! Tasks spawned through this module carry a human-readable name, which makes
//! runtime diagnostics legible. Names are computed lazily so that callers pay
//! nothing for them in the common case where no one is looking.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::trace;

/// Spawns a named asynchronous task.
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    trace!("spawning task {}", name.as_ref());
    tokio::spawn(future)
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts a [`JoinHandle`] into a handle that aborts the task on drop.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}

/// A wrapper around a [`JoinHandle`] that aborts the underlying task when the
/// handle is dropped.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> AbortOnDropHandle<T> {
    /// Aborts the underlying task immediately.
    pub fn abort(&self) {
        self.0.abort()
    }
}

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
