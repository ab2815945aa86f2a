// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! The design of this module is inspired by the retry utilities in
//! Materialize's `mz-ore`, trimmed down to the pieces the scheduler needs:
//! a fluent builder describing an exponential backoff schedule and an async
//! driver that reruns a fallible operation until it succeeds or the schedule
//! is exhausted.

use std::future::Future;
use std::time::Duration;

use tokio::time;

/// Configures a retry operation.
#[derive(Debug, Clone)]
pub struct Retry {
    initial_backoff: Duration,
    factor: f64,
    clamp_backoff: Duration,
    max_tries: usize,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
        }
    }
}

impl Retry {
    /// Sets the initial backoff for the retry operation.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the maximum backoff for the retry operation.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum number of tries.
    ///
    /// # Panics
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Retries the fallible async operation `f` according to the configured
    /// schedule.
    ///
    /// The operation is handed a [`RetryState`] describing which attempt this
    /// is and how long the next backoff will be, if any.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.initial_backoff.min(self.clamp_backoff);
        let mut i = 0;
        loop {
            let state = RetryState {
                i,
                next_backoff: (i + 1 < self.max_tries).then_some(backoff),
            };
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    if i + 1 >= self.max_tries {
                        return Err(e);
                    }
                    time::sleep(backoff).await;
                    backoff = backoff.mul_f64(self.factor).min(self.clamp_backoff);
                    i += 1;
                }
            }
        }
    }
}

/// The state of a retry operation constructed with [`Retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    /// The retry counter, starting from zero on the first try.
    pub i: usize,
    /// If this try fails, the amount of time that the operation will sleep
    /// before the next try, or `None` if this was the last try.
    pub next_backoff: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let tries = AtomicUsize::new(0);
        let res: Result<usize, &str> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(5)
            .retry_async(|_| async {
                let i = tries.fetch_add(1, Ordering::SeqCst);
                if i < 2 {
                    Err("not yet")
                } else {
                    Ok(i)
                }
            })
            .await;
        assert_eq!(res, Ok(2));
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let res: Result<(), &str> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(2)
            .retry_async(|state| async move {
                if state.i == 1 {
                    assert_eq!(state.next_backoff, None);
                }
                Err("nope")
            })
            .await;
        assert_eq!(res, Err("nope"));
    }
}
