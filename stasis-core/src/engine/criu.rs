// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `criu` command-line client.
//!
//! Restores run with `--restore-detached --leave-stopped` so the
//! post-restore and pre-resume phases see the restored tree before it is
//! continued with SIGCONT.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{drive_dump, drive_restore, Engine, NotifyCallbackMulti, RestoreIo};
use crate::api::EngineOptions;
use crate::error::{EngineError, StasisError, StasisResult};

/// Name of the pidfile written into the image directory on restore.
pub(crate) const RESTORE_PIDFILE: &str = "restore.pid";

#[derive(Debug, Clone)]
pub struct CriuBinary {
    path: PathBuf,
}

impl CriuBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use `configured` if given, else search the usual install locations.
    pub fn find(configured: Option<&Path>) -> Result<Self, EngineError> {
        if let Some(path) = configured {
            if path.exists() {
                return Ok(Self::new(path));
            }
            return Err(EngineError::BinaryNotFound);
        }

        let candidates = [
            "/usr/sbin/criu",
            "/usr/bin/criu",
            "/sbin/criu",
            "/bin/criu",
            "/usr/local/sbin/criu",
            "/usr/local/bin/criu",
        ];

        candidates
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .map(Self::new)
            .ok_or(EngineError::BinaryNotFound)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dump_args(opts: &EngineOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "dump".into(),
            "--tree".into(),
            opts.pid.to_string().into(),
            "--images-dir".into(),
            opts.images_dir.clone().into(),
            "--log-file".into(),
            "dump.log".into(),
            "-v4".into(),
        ];
        Self::common_args(opts, &mut args);
        if opts.leave_running {
            args.push("--leave-running".into());
        }
        args
    }

    fn restore_args(opts: &EngineOptions, log: Option<&Path>) -> Vec<OsString> {
        let log = log.map(Path::as_os_str).unwrap_or("restore.log".as_ref());
        let mut args: Vec<OsString> = vec![
            "restore".into(),
            "--images-dir".into(),
            opts.images_dir.clone().into(),
            "--log-file".into(),
            log.to_os_string(),
            "-v4".into(),
            "--restore-detached".into(),
            "--leave-stopped".into(),
            "--pidfile".into(),
            opts.images_dir.join(RESTORE_PIDFILE).into(),
        ];
        Self::common_args(opts, &mut args);
        args
    }

    fn common_args(opts: &EngineOptions, args: &mut Vec<OsString>) {
        if opts.shell_job {
            args.push("--shell-job".into());
        }
        if opts.tcp_established {
            args.push("--tcp-established".into());
        }
        if opts.file_locks {
            args.push("--file-locks".into());
        }
        for external in &opts.external {
            args.push("--external".into());
            args.push(external.into());
        }
    }

    async fn run_dump(&self, lifetime: &CancellationToken, args: Vec<OsString>) -> StasisResult<()> {
        self.exec(lifetime, args)
            .await
            .map_err(|reason| StasisError::from(EngineError::DumpFailed { reason }))
    }

    async fn run_restore(
        &self,
        lifetime: &CancellationToken,
        args: Vec<OsString>,
        pidfile: &Path,
    ) -> StasisResult<u32> {
        self.exec(lifetime, args)
            .await
            .map_err(|reason| EngineError::RestoreFailed { reason })?;
        read_pidfile(pidfile).ok_or_else(|| {
            StasisError::from(EngineError::RestoreFailed {
                reason: format!("no PID in {}", pidfile.display()),
            })
        })
    }

    async fn exec(&self, lifetime: &CancellationToken, args: Vec<OsString>) -> Result<(), String> {
        let mut command = Command::new(&self.path);
        command.args(&args).kill_on_drop(true);

        let output = tokio::select! {
            output = command.output() => output.map_err(|e| format!("failed to execute criu: {}", e))?,
            _ = lifetime.cancelled() => return Err("cancelled".to_string()),
        };

        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(())
    }
}

/// Parse `criu --version` output ("Version: 3.19" or "Version: 3.17.1").
fn parse_version(output: &str) -> Option<u32> {
    let line = output.lines().find(|l| l.starts_with("Version:"))?;
    let mut parts = line
        .trim_start_matches("Version:")
        .trim()
        .split('.')
        .map(|p| p.trim().parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().and_then(Result::ok).unwrap_or(0);
    let sublevel = parts.next().and_then(Result::ok).unwrap_or(0);
    Some(major * 10000 + minor * 100 + sublevel)
}

#[async_trait]
impl Engine for CriuBinary {
    async fn version(&self) -> StasisResult<u32> {
        let output = Command::new(&self.path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| StasisError::Io {
                context: "running criu --version",
                source: e,
            })?;

        parse_version(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            StasisError::internal("could not parse criu version output")
        })
    }

    async fn dump(
        &self,
        lifetime: &CancellationToken,
        opts: &EngineOptions,
        callbacks: &NotifyCallbackMulti,
    ) -> StasisResult<()> {
        let start = Instant::now();
        let args = Self::dump_args(opts);

        drive_dump(callbacks, lifetime, opts, self.run_dump(lifetime, args))
            .await?;

        tracing::info!(
            pid = opts.pid,
            dir = %opts.images_dir.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "CRIU dump completed"
        );
        Ok(())
    }

    async fn restore(
        &self,
        lifetime: &CancellationToken,
        opts: &EngineOptions,
        callbacks: &NotifyCallbackMulti,
        io: RestoreIo,
    ) -> StasisResult<u32> {
        let start = Instant::now();
        let args = Self::restore_args(opts, io.log.as_deref());
        let pidfile = opts.images_dir.join(RESTORE_PIDFILE);

        let pid = drive_restore(
            callbacks,
            lifetime,
            opts,
            self.run_restore(lifetime, args, &pidfile),
            |pid| async move {
                kill(Pid::from_raw(pid as i32), Signal::SIGCONT).map_err(|e| {
                    StasisError::Syscall {
                        syscall: "kill(SIGCONT)",
                        message: e.to_string(),
                    }
                })
            },
        )
        .await?;

        tracing::info!(
            pid = pid,
            dir = %opts.images_dir.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "CRIU restore completed"
        );
        Ok(pid)
    }
}

pub(crate) fn read_pidfile(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}
