// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scheduler configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

/// Minimum level at which the scheduler emits log events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogLevel {
    /// Everything, including per-message scheduling traces.
    Trace,
    /// Scheduling decisions and lifecycle events.
    Debug,
    /// Lifecycle events only.
    #[default]
    Info,
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<LogLevel, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            other => Err(anyhow::anyhow!("unknown log level: {other}")),
        }
    }
}

/// Configures a [`Scheduler`](crate::Scheduler).
///
/// [`SchedulerConfig::from_env`] reads each field from the correspondingly
/// named environment variable; unset variables fall back to the defaults
/// produced by [`SchedulerConfig::with_host`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// This host's identity in the fleet (`ENDPOINT_HOST`).
    pub endpoint_host: String,
    /// Port on which the function-call server listens (`ENDPOINT_PORT`).
    pub endpoint_port: u16,
    /// Threads serving the endpoint (`ENDPOINT_NUM_THREADS`).
    pub endpoint_num_threads: usize,
    /// Whether this host serves the storage role (`IS_STORAGE_NODE`).
    pub is_storage_node: bool,
    /// When on, coerce every topology hint to NONE (`NO_TOPOLOGY_HINTS`).
    pub no_topology_hints: bool,
    /// When set, skip marking batches that land entirely on the local master
    /// host (`NO_SINGLE_HOST_OPTIMISATIONS`).
    pub no_single_host_optimisations: bool,
    /// How long an executor may sit idle before the reaper retires it
    /// (`BOUND_TIMEOUT`, milliseconds).
    pub bound_timeout: Duration,
    /// Interval between reaper passes (`REAPER_INTERVAL_SECS`).
    pub reaper_interval: Duration,
    /// Default timeout for result waits (`GLOBAL_MESSAGE_TIMEOUT`,
    /// milliseconds).
    pub global_message_timeout: Duration,
    /// Threads serving the function-call server (`FUNCTION_SERVER_THREADS`).
    pub function_server_threads: usize,
    /// File the scheduler overwrites with task counters, if any
    /// (`SCHEDULER_MONITOR_FILE`).
    pub scheduler_monitor_file: Option<PathBuf>,
    /// Log verbosity (`LOG_LEVEL`).
    pub log_level: LogLevel,
    /// Executor slots this host advertises. Defaults to the number of
    /// available cores.
    pub slots: i32,
    /// Worker tasks per executor. Defaults to the number of available cores.
    pub executor_pool_size: usize,
    /// Expiry applied to result queues in the shared store.
    pub result_key_ttl: Duration,
    /// Expiry applied to status blobs in the shared store.
    pub status_key_ttl: Duration,
    /// When on, dispatch records every scheduled message for inspection.
    pub test_mode: bool,
}

const RESULT_KEY_TTL: Duration = Duration::from_secs(30);
const STATUS_KEY_TTL: Duration = Duration::from_secs(300);

fn usable_cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl SchedulerConfig {
    /// Returns the default configuration for a host named `endpoint_host`.
    pub fn with_host(endpoint_host: &str) -> SchedulerConfig {
        let cores = usable_cores();
        SchedulerConfig {
            endpoint_host: endpoint_host.to_string(),
            endpoint_port: 8080,
            endpoint_num_threads: 4,
            is_storage_node: false,
            no_topology_hints: false,
            no_single_host_optimisations: false,
            bound_timeout: Duration::from_millis(30_000),
            reaper_interval: Duration::from_secs(30),
            global_message_timeout: Duration::from_millis(60_000),
            function_server_threads: 2,
            scheduler_monitor_file: None,
            log_level: LogLevel::Info,
            slots: i32::try_from(cores).unwrap_or(i32::MAX),
            executor_pool_size: cores,
            result_key_ttl: RESULT_KEY_TTL,
            status_key_ttl: STATUS_KEY_TTL,
            test_mode: false,
        }
    }

    /// Builds a configuration from the environment.
    pub fn from_env() -> SchedulerConfig {
        let endpoint_host = env::var("ENDPOINT_HOST").unwrap_or_else(|_| "localhost".to_string());
        let defaults = SchedulerConfig::with_host(&endpoint_host);
        let monitor_file = env::var("SCHEDULER_MONITOR_FILE")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        SchedulerConfig {
            endpoint_host,
            endpoint_port: env_or("ENDPOINT_PORT", defaults.endpoint_port),
            endpoint_num_threads: env_or("ENDPOINT_NUM_THREADS", defaults.endpoint_num_threads),
            is_storage_node: env_or("IS_STORAGE_NODE", false),
            no_topology_hints: matches!(
                env::var("NO_TOPOLOGY_HINTS").as_deref(),
                Ok("on") | Ok("1") | Ok("true")
            ),
            no_single_host_optimisations: env_or::<i32>("NO_SINGLE_HOST_OPTIMISATIONS", 0) != 0,
            bound_timeout: Duration::from_millis(env_or(
                "BOUND_TIMEOUT",
                defaults.bound_timeout.as_millis() as u64,
            )),
            reaper_interval: Duration::from_secs(env_or(
                "REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )),
            global_message_timeout: Duration::from_millis(env_or(
                "GLOBAL_MESSAGE_TIMEOUT",
                defaults.global_message_timeout.as_millis() as u64,
            )),
            function_server_threads: env_or(
                "FUNCTION_SERVER_THREADS",
                defaults.function_server_threads,
            ),
            scheduler_monitor_file: monitor_file,
            log_level: env_or("LOG_LEVEL", LogLevel::Info),
            ..defaults
        }
    }

    /// Returns a configuration suitable for tests: recorded-message capture
    /// on, a long reaper interval so reaping never races a test, and an
    /// explicit slot count.
    pub fn for_tests(endpoint_host: &str, slots: i32) -> SchedulerConfig {
        SchedulerConfig {
            slots,
            executor_pool_size: 2,
            reaper_interval: Duration::from_secs(3600),
            bound_timeout: Duration::from_millis(200),
            test_mode: true,
            ..SchedulerConfig::with_host(endpoint_host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::with_host("hostA");
        assert_eq!(config.endpoint_host, "hostA");
        assert!(!config.is_storage_node);
        assert!(config.slots >= 1);
        assert_eq!(config.bound_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
