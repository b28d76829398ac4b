// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! A single managed job.

use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::api::{Details, JobRecord, ProcessState};
use crate::process;
use crate::state::JobStatus;
use crate::types::JobId;

/// One workload under management. Every read and write goes through the
/// lock, so callers only ever see whole snapshots. Reads hold the lock
/// shared; only a changed status is written back.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    record: RwLock<JobRecord>,
}

impl Job {
    pub fn new(id: JobId, type_tag: impl Into<String>, host: &str) -> Self {
        Self::from_record(JobRecord {
            jid: id,
            type_tag: type_tag.into(),
            state: ProcessState {
                host: host.to_string(),
                ..Default::default()
            },
            details: Details::default(),
            log: None,
        })
    }

    pub fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.jid.clone(),
            record: RwLock::new(record),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    fn read(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.record.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobRecord> {
        self.record.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn type_tag(&self) -> String {
        self.read().type_tag.clone()
    }

    pub fn snapshot(&self) -> JobRecord {
        self.read().clone()
    }

    pub fn pid(&self) -> u32 {
        self.read().state.pid
    }

    /// Re-derive liveness from the OS and return the resulting snapshot.
    pub fn refresh(&self, host: &str) -> JobRecord {
        let mut observed = self.snapshot();
        let seen = (observed.state.pid, observed.state.status, observed.state.is_running);
        derive_status(&mut observed.state, host);
        if (observed.state.status, observed.state.is_running) == (seen.1, seen.2) {
            return observed;
        }

        let mut record = self.write();
        // A concurrent set_pid or mark_done wins over this observation.
        if (record.state.pid, record.state.status, record.state.is_running) == seen {
            record.state.status = observed.state.status;
            record.state.is_running = observed.state.is_running;
        }
        record.clone()
    }

    /// Start tracking `pid` on `host`.
    pub fn set_pid(&self, pid: u32, host: &str) {
        let live = process::inspect(pid);
        let mut record = self.write();
        let state = &mut record.state;

        state.pid = pid;
        state.host = host.to_string();
        state.exit_code = None;
        match live {
            Some(live) => {
                state.is_running = true;
                state.status = JobStatus::Running;
                state.cmdline = live.cmdline;
                state.cwd = live.cwd;
                state.uid = live.uid;
                state.gid = live.gid;
                state.sid = live.sid;
            }
            None => {
                state.is_running = false;
                state.status = JobStatus::Halted;
            }
        }
    }

    pub fn set_type(&self, type_tag: &str) {
        self.write().type_tag = type_tag.to_string();
    }

    pub fn set_log(&self, log: Option<PathBuf>) {
        self.write().log = log;
    }

    pub fn set_details(&self, details: Details) {
        self.write().details = details;
    }

    pub fn set_gpu(&self, enabled: bool, controller: Option<crate::types::ControllerId>) {
        let mut record = self.write();
        record.state.gpu_enabled = enabled;
        record.state.gpu_controller = controller;
    }

    /// The tracked process exited with `code`.
    pub fn mark_done(&self, code: i32) {
        let mut record = self.write();
        record.state.is_running = false;
        record.state.status = JobStatus::Done;
        record.state.exit_code = Some(code);
    }
}

/// Compare the saved process identity with what runs at the PID now.
fn derive_status(state: &mut ProcessState, host: &str) {
    if !state.host.is_empty() && state.host != host {
        state.is_running = false;
        state.status = JobStatus::Remote;
        return;
    }
    if matches!(state.status, JobStatus::Done | JobStatus::Pending) || state.pid == 0 {
        state.is_running = false;
        return;
    }

    match process::inspect(state.pid) {
        Some(live) if live.cmdline == state.cmdline => {
            state.is_running = true;
            state.status = JobStatus::Running;
        }
        Some(_) => {
            state.is_running = false;
            state.status = JobStatus::Stale;
        }
        None => {
            state.is_running = false;
            state.status = JobStatus::Halted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "host-a";

    fn job() -> Job {
        Job::new(JobId::new("j1").unwrap(), "process", HOST)
    }

    #[test]
    fn test_new_job_is_pending() {
        let record = job().refresh(HOST);
        assert_eq!(record.state.status, JobStatus::Pending);
        assert!(!record.state.is_running);
    }

    #[test]
    fn test_running_self() {
        let job = job();
        job.set_pid(std::process::id(), HOST);
        let record = job.refresh(HOST);
        assert_eq!(record.state.status, JobStatus::Running);
        assert!(record.state.is_running);
    }

    #[test]
    fn test_cmdline_mismatch_is_stale() {
        let job = job();
        job.set_pid(std::process::id(), HOST);
        {
            let mut record = job.write();
            record.state.cmdline = "/usr/bin/something-else".to_string();
        }
        let record = job.refresh(HOST);
        assert_eq!(record.state.status, JobStatus::Stale);
        assert!(!record.state.is_running);
    }

    #[test]
    fn test_other_host_is_remote() {
        let job = job();
        job.set_pid(std::process::id(), HOST);
        let record = job.refresh("host-b");
        assert_eq!(record.state.status, JobStatus::Remote);
    }

    #[test]
    fn test_done_stays_done() {
        let job = job();
        job.set_pid(std::process::id(), HOST);
        job.mark_done(0);
        let record = job.refresh(HOST);
        assert_eq!(record.state.status, JobStatus::Done);
        assert_eq!(record.state.exit_code, Some(0));
    }

    #[test]
    fn test_refresh_does_not_block_readers() {
        let job = std::sync::Arc::new(job());
        job.set_pid(std::process::id(), HOST);
        assert!(job.refresh(HOST).state.is_running);

        let guard = job.read();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = job.clone();
        let handle = std::thread::spawn(move || {
            let record = reader.refresh(HOST);
            tx.send(record.state.status).unwrap();
        });

        let status = rx.recv_timeout(std::time::Duration::from_secs(5));
        drop(guard);
        handle.join().unwrap();
        assert_eq!(status.unwrap(), JobStatus::Running);
    }

    #[test]
    fn test_refresh_persists_status_change() {
        let job = job();
        job.set_pid(std::process::id(), HOST);
        job.write().state.cmdline = "/usr/bin/something-else".to_string();

        job.refresh(HOST);
        assert_eq!(job.snapshot().state.status, JobStatus::Stale);
    }
}
