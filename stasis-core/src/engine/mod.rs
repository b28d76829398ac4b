// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint/restore engine client.
//!
//! The engine itself is external. This module defines what the daemon
//! needs from it, the phase order every implementation must drive, and a
//! client for the `criu` command line.

mod adapters;
mod callback;
mod criu;

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::api::EngineOptions;
use crate::error::{StasisError, StasisResult};

pub use adapters::{
    attach_engine, check_dump_options, check_restore_options, dump_handler, restore_handler,
    MIN_CRIU_VERSION,
};
pub use callback::{phase, NotifyCallback, NotifyCallbackMulti, Phase, PhaseContext, PhaseFn};
pub use criu::CriuBinary;

/// Standard streams for a restored process tree.
#[derive(Debug, Default, Clone)]
pub struct RestoreIo {
    /// Engine log destination for this restore.
    pub log: Option<PathBuf>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine version as `major * 10000 + minor * 100 + sublevel`.
    async fn version(&self) -> StasisResult<u32>;

    /// Dump the process tree rooted at `opts.pid` into `opts.images_dir`.
    async fn dump(
        &self,
        lifetime: &CancellationToken,
        opts: &EngineOptions,
        callbacks: &NotifyCallbackMulti,
    ) -> StasisResult<()>;

    /// Restore from `opts.images_dir`, returning the restored root PID.
    async fn restore(
        &self,
        lifetime: &CancellationToken,
        opts: &EngineOptions,
        callbacks: &NotifyCallbackMulti,
        io: RestoreIo,
    ) -> StasisResult<u32>;
}

/// Drive the dump phases around `dump`.
///
/// initialize → pre-dump → dump → post-dump, stopping at the first error;
/// on error the on-dump-error phase runs. finalize-dump always runs and its
/// errors are joined to the result.
pub async fn drive_dump<F>(
    callbacks: &NotifyCallbackMulti,
    lifetime: &CancellationToken,
    opts: &EngineOptions,
    dump: F,
) -> StasisResult<()>
where
    F: Future<Output = StasisResult<()>>,
{
    let ctx = PhaseContext {
        lifetime: lifetime.clone(),
        opts: opts.clone(),
        pid: opts.pid,
    };

    let result: StasisResult<()> = async {
        callbacks.run(Phase::Initialize, &ctx).await?;
        callbacks.run(Phase::PreDump, &ctx).await?;
        dump.await?;
        callbacks.run(Phase::PostDump, &ctx).await
    }
    .await;

    let mut errors = Vec::new();
    if let Err(e) = result {
        if let Err(cleanup) = callbacks.run(Phase::OnDumpError, &ctx).await {
            tracing::warn!(error = %cleanup, "On-dump-error callbacks failed");
        }
        errors.push(e);
    }
    if let Err(e) = callbacks.run(Phase::FinalizeDump, &ctx).await {
        errors.push(e);
    }

    match StasisError::join(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Drive the restore phases around `restore` and `resume`.
///
/// initialize → pre-restore → restore → post-restore → pre-resume → resume
/// → post-resume. finalize-restore always runs and its errors are joined.
pub async fn drive_restore<F, R, RF>(
    callbacks: &NotifyCallbackMulti,
    lifetime: &CancellationToken,
    opts: &EngineOptions,
    restore: F,
    resume: R,
) -> StasisResult<u32>
where
    F: Future<Output = StasisResult<u32>>,
    R: FnOnce(u32) -> RF,
    RF: Future<Output = StasisResult<()>>,
{
    let mut ctx = PhaseContext {
        lifetime: lifetime.clone(),
        opts: opts.clone(),
        pid: 0,
    };

    let result: StasisResult<u32> = async {
        callbacks.run(Phase::Initialize, &ctx).await?;
        callbacks.run(Phase::PreRestore, &ctx).await?;
        let pid = restore.await?;
        ctx.pid = pid;
        callbacks.run(Phase::PostRestore, &ctx).await?;
        callbacks.run(Phase::PreResume, &ctx).await?;
        resume(pid).await?;
        callbacks.run(Phase::PostResume, &ctx).await?;
        Ok(pid)
    }
    .await;

    let finalized = callbacks.run(Phase::FinalizeRestore, &ctx).await;

    match (result, finalized) {
        (Ok(pid), Ok(())) => Ok(pid),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(fin)) => Err(StasisError::Joined(vec![e, fin])),
    }
}
