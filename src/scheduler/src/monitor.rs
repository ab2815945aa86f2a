// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The status monitor file.
//!
//! When configured, the scheduler keeps a small text file up to date with
//! its task counters so that outside tooling can watch a host without
//! talking to it. Every update truncates and rewrites the file under an exclusive file
//! lock; failures are logged and otherwise ignored.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use fs2::FileExt;
use tracing::warn;

use crate::scheduler::Scheduler;

#[derive(Debug)]
pub(crate) struct Monitor {
    file: Mutex<File>,
}

impl Monitor {
    pub fn open(path: &Path) -> Result<Monitor, anyhow::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Monitor {
            file: Mutex::new(file),
        })
    }

    fn write_line(&self, line: &str) -> Result<(), anyhow::Error> {
        let mut file = self.file.lock().expect("lock poisoned");
        file.lock_exclusive()?;
        let result = (|| -> Result<(), anyhow::Error> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
            Ok(())
        })();
        let unlocked = file.unlock().map_err(anyhow::Error::from);
        result.and(unlocked)
    }
}

impl Scheduler {
    pub(crate) fn note_task_started(&self) {
        self.monitor_started_tasks.fetch_add(1, Ordering::AcqRel);
        self.update_monitoring();
    }

    pub(crate) fn note_task_finished(&self) {
        self.monitor_started_tasks.fetch_sub(1, Ordering::AcqRel);
        self.monitor_locally_scheduled_tasks
            .fetch_sub(1, Ordering::AcqRel);
        self.update_monitoring();
    }

    /// Rewrites the monitor file with the current task counters.
    /// Best-effort: a write failure is logged and swallowed.
    pub(crate) fn update_monitoring(&self) {
        let monitor = match &self.monitor {
            Some(monitor) => monitor,
            None => return,
        };
        let locally_scheduled = self.monitor_locally_scheduled_tasks.load(Ordering::Acquire);
        let started = self.monitor_started_tasks.load(Ordering::Acquire);
        let waiting = self.monitor_waiting_tasks.load(Ordering::Acquire);
        let line = format!(
            "local_sched,{},waiting_queued,{},started,{},waiting,{},active,{}\n",
            locally_scheduled,
            locally_scheduled - started,
            started,
            waiting,
            started - waiting,
        );
        if let Err(e) = monitor.write_line(&line) {
            warn!("couldn't write monitoring data: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_rewrites_in_place() {
        let path = std::env::temp_dir().join(format!(
            "stratus-monitor-test-{}",
            rand::random::<u64>()
        ));
        let monitor = Monitor::open(&path).unwrap();
        monitor
            .write_line("local_sched,2,waiting_queued,1,started,1,waiting,0,active,1\n")
            .unwrap();
        monitor
            .write_line("local_sched,0,waiting_queued,0,started,0,waiting,0,active,0\n")
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "local_sched,0,waiting_queued,0,started,0,waiting,0,active,0\n"
        );
        std::fs::remove_file(&path).unwrap();
    }
}
