// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Engine callbacks that run the GPU side of a dump or restore.
//!
//! The GPU dump starts in pre-dump and the GPU restore in pre-restore, so
//! both overlap with the engine's own work. The paired finalize phase never
//! returns before the GPU result is known. The controller's termination
//! lock is held from the first phase until finalize so a concurrent detach
//! cannot tear the controller down mid-operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::sync::{oneshot, watch, OwnedMutexGuard};
use tokio_util::task::TaskTracker;

use super::controller::Controller;
use super::{FreezeType, RESTORED_PID_SIGNAL};
use crate::engine::{phase, NotifyCallback, PhaseContext};
use crate::error::{GpuError, StasisError, StasisResult};

type GpuResult = watch::Sender<Option<Result<(), GpuError>>>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BridgeSettings {
    pub freeze_type: FreezeType,
    pub parallel_dump: bool,
    pub parallel_restore: bool,
}

struct Bridge {
    controller: Arc<Controller>,
    settings: BridgeSettings,
    tasks: TaskTracker,
    termination: Mutex<Option<OwnedMutexGuard<()>>>,
    frozen: AtomicBool,
    dump_started: AtomicBool,
    dump: GpuResult,
    restore_started: AtomicBool,
    restore: GpuResult,
    restored: Mutex<Option<oneshot::Sender<u32>>>,
}

impl Bridge {
    async fn hold_termination(&self) {
        let guard = self.controller.termination.clone().lock_owned().await;
        if let Ok(mut slot) = self.termination.lock() {
            *slot = Some(guard);
        }
    }

    fn release_termination(&self) {
        if let Ok(mut slot) = self.termination.lock() {
            slot.take();
        }
    }

    fn take_restored(&self) -> Option<oneshot::Sender<u32>> {
        self.restored.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn pre_dump(self: Arc<Self>, ctx: PhaseContext) -> StasisResult<()> {
        self.hold_termination().await;

        self.controller
            .freeze(Some(&ctx.lifetime), self.settings.freeze_type)
            .await?;
        self.frozen.store(true, Ordering::SeqCst);
        tracing::debug!(controller = %self.controller.id, pid = ctx.pid, "GPU frozen");

        self.dump_started.store(true, Ordering::SeqCst);
        let task = self.clone();
        self.tasks.spawn(async move {
            let start = std::time::Instant::now();
            let result = task
                .controller
                .dump(Some(&ctx.lifetime), &ctx.opts.images_dir)
                .await;
            tracing::debug!(
                controller = %task.controller.id,
                ok = result.is_ok(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "GPU dump finished"
            );
            task.dump.send_replace(Some(result));
        });

        if !self.settings.parallel_dump {
            outcome(&self.dump).await?;
        }
        Ok(())
    }

    async fn post_dump(self: Arc<Self>) -> StasisResult<()> {
        outcome(&self.dump).await?;
        Ok(())
    }

    async fn finalize_dump(self: Arc<Self>) -> StasisResult<()> {
        if self.dump_started.load(Ordering::SeqCst) {
            if let Err(e) = outcome(&self.dump).await {
                // Surfaced by post-dump or by the engine's own failure.
                tracing::debug!(controller = %self.controller.id, error = %e, "GPU dump failed");
            }
        }

        let mut result = Ok(());
        if self.frozen.swap(false, Ordering::SeqCst) {
            // Detached from cancellation so the GPU never stays frozen.
            result = self
                .controller
                .unfreeze(None, self.settings.freeze_type)
                .await
                .map_err(StasisError::from);
        }

        self.release_termination();
        result
    }

    async fn pre_restore(self: Arc<Self>, ctx: PhaseContext) -> StasisResult<()> {
        self.hold_termination().await;

        self.restore_started.store(true, Ordering::SeqCst);
        let task = self.clone();
        self.tasks.spawn(async move {
            let start = std::time::Instant::now();
            let result = task
                .controller
                .restore(Some(&ctx.lifetime), &ctx.opts.images_dir)
                .await;
            tracing::debug!(
                controller = %task.controller.id,
                ok = result.is_ok(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "GPU restore finished"
            );
            task.restore.send_replace(Some(result));
        });
        Ok(())
    }

    async fn post_restore(self: Arc<Self>, ctx: PhaseContext) -> StasisResult<()> {
        if let Some(tx) = self.take_restored() {
            if tx.send(ctx.pid).is_err() {
                tracing::debug!(controller = %self.controller.id, pid = ctx.pid, "Nobody waits for the restored PID");
            }
        }
        if !self.settings.parallel_restore {
            outcome(&self.restore).await?;
        }
        Ok(())
    }

    async fn pre_resume(ctx: PhaseContext) -> StasisResult<()> {
        kill(Pid::from_raw(ctx.pid as i32), RESTORED_PID_SIGNAL).map_err(|e| {
            StasisError::from(e).context(format!("notifying restored PID {}", ctx.pid))
        })
    }

    async fn finalize_restore(self: Arc<Self>) -> StasisResult<()> {
        let result = if self.restore_started.load(Ordering::SeqCst) {
            outcome(&self.restore).await.map_err(StasisError::from)
        } else {
            Ok(())
        };
        self.release_termination();
        result
    }
}

/// Wait until the GPU task behind `result` has reported.
async fn outcome(result: &GpuResult) -> Result<(), GpuError> {
    let mut rx = result.subscribe();
    let reported = match rx.wait_for(|r| r.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    reported.unwrap_or(Ok(()))
}

pub(crate) fn callback(
    controller: Arc<Controller>,
    settings: BridgeSettings,
    restored: Option<oneshot::Sender<u32>>,
    tasks: TaskTracker,
) -> NotifyCallback {
    let bridge = Arc::new(Bridge {
        controller,
        settings,
        tasks,
        termination: Mutex::new(None),
        frozen: AtomicBool::new(false),
        dump_started: AtomicBool::new(false),
        dump: watch::channel(None).0,
        restore_started: AtomicBool::new(false),
        restore: watch::channel(None).0,
        restored: Mutex::new(restored),
    });

    let mut callback = NotifyCallback::named("gpu");

    let b = bridge.clone();
    callback.pre_dump = Some(phase(move |ctx| b.clone().pre_dump(ctx)));
    let b = bridge.clone();
    callback.post_dump = Some(phase(move |_| b.clone().post_dump()));
    let b = bridge.clone();
    callback.finalize_dump = Some(phase(move |_| b.clone().finalize_dump()));
    let b = bridge.clone();
    callback.pre_restore = Some(phase(move |ctx| b.clone().pre_restore(ctx)));
    let b = bridge.clone();
    callback.post_restore = Some(phase(move |ctx| b.clone().post_restore(ctx)));
    callback.pre_resume = Some(phase(Bridge::pre_resume));
    let b = bridge;
    callback.finalize_restore = Some(phase(move |_| b.clone().finalize_restore()));

    callback
}
