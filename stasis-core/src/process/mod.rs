// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Live process inspection, signalling and exit tracking.
//!
//! Also hosts the built-in `process` workload type (see [`register`]).

mod adapters;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use procfs::net::TcpState;
use procfs::process::{FDTarget, Process};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::pipeline::{ExitSignal, UNKNOWN_EXIT_CODE};

pub use adapters::{
    detect_network_options, fill_process_state, register, reload_process_state,
    restore_network_options, save_process_state, PROCESS_STATE_FILE,
};

/// Poll period when the exit of a non-child process is observed by polling.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long polling continues after the lifetime ended.
const EXIT_GRACE: Duration = Duration::from_secs(10);

/// Snapshot of a live process read from `/proc`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveProcess {
    pub pid: u32,
    pub cmdline: String,
    pub sid: u32,
    pub pgid: u32,
    pub uid: u32,
    pub gid: u32,
    pub cwd: Option<PathBuf>,
}

/// Read the live process at `pid`. Zombies and dead processes yield `None`.
pub fn inspect(pid: u32) -> Option<LiveProcess> {
    if pid == 0 {
        return None;
    }
    let process = Process::new(pid as i32).ok()?;
    let stat = process.stat().ok()?;
    if matches!(stat.state, 'Z' | 'X' | 'x') {
        return None;
    }

    let cmdline = process
        .cmdline()
        .map(|args| args.join(" "))
        .unwrap_or_default();
    let (uid, gid) = process
        .status()
        .map(|s| (s.ruid, s.rgid))
        .unwrap_or((0, 0));

    Some(LiveProcess {
        pid,
        cmdline,
        sid: stat.session.max(0) as u32,
        pgid: stat.pgrp.max(0) as u32,
        uid,
        gid,
        cwd: process.cwd().ok(),
    })
}

pub fn is_alive(pid: u32) -> bool {
    inspect(pid).is_some()
}

/// Whether the process owns an established TCP connection.
pub fn has_established_tcp(pid: u32) -> bool {
    let Ok(process) = Process::new(pid as i32) else {
        return false;
    };
    let Ok(fds) = process.fd() else {
        return false;
    };
    let inodes: HashSet<u64> = fds
        .filter_map(Result::ok)
        .filter_map(|fd| match fd.target {
            FDTarget::Socket(inode) => Some(inode),
            _ => None,
        })
        .collect();
    if inodes.is_empty() {
        return false;
    }

    let mut entries = procfs::net::tcp().unwrap_or_default();
    entries.extend(procfs::net::tcp6().unwrap_or_default());
    entries
        .iter()
        .any(|e| e.state == TcpState::Established && inodes.contains(&e.inode))
}

/// Signal `pid`, or its whole process group when it leads one.
pub fn signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    let target = Pid::from_raw(pid as i32);
    match inspect(pid) {
        Some(live) if live.pgid == pid => killpg(target, signal),
        _ => kill(target, signal),
    }
}

/// Adopt orphaned descendants so restored process trees can be waited for.
pub fn become_subreaper() -> Result<(), Errno> {
    nix::sys::prctl::set_child_subreaper(true)
}

/// Reap `pid` if it is a zombie child of this process. Never blocks.
pub fn reap(pid: u32) {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => tracing::debug!(pid = pid, status = ?status, "Reaped process"),
        Err(e) => tracing::trace!(pid = pid, error = %e, "Nothing to reap"),
    }
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => UNKNOWN_EXIT_CODE,
    }
}

/// Track the exit of `pid` in a task owned by `tasks`.
///
/// Children (including orphans adopted while this daemon is a child
/// subreaper) are waited for; anything else is polled.
pub fn wait_for_exit(pid: u32, tasks: &TaskTracker, lifetime: &CancellationToken) -> ExitSignal {
    let (tx, exited) = ExitSignal::channel();
    let lifetime = lifetime.clone();

    tasks.spawn(async move {
        let waited =
            tokio::task::spawn_blocking(move || waitpid(Pid::from_raw(pid as i32), None)).await;

        let code = match waited {
            Ok(Ok(status)) => exit_code(status),
            Ok(Err(Errno::ECHILD)) => poll_exit(pid, &lifetime).await,
            Ok(Err(e)) => {
                tracing::warn!(pid = pid, error = %e, "waitpid failed");
                poll_exit(pid, &lifetime).await
            }
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "Exit waiter panicked");
                UNKNOWN_EXIT_CODE
            }
        };

        tracing::debug!(pid = pid, code = code, "Process exited");
        tx.send(code);
    });

    exited
}

async fn poll_exit(pid: u32, lifetime: &CancellationToken) -> i32 {
    loop {
        if !is_alive(pid) {
            return UNKNOWN_EXIT_CODE;
        }
        tokio::select! {
            _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
            _ = lifetime.cancelled() => break,
        }
    }

    let deadline = tokio::time::Instant::now() + EXIT_GRACE;
    while is_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    UNKNOWN_EXIT_CODE
}

/// Wait (bounded) for a non-child process to disappear.
pub async fn wait_gone(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while is_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    true
}
