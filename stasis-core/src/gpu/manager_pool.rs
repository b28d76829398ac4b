// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pool manager: keeps a target number of FREE controllers warm.
//!
//! On a fixed interval the pool is reconciled with the socket directory and
//! the stored controller records, stale records are deleted, and idle
//! controllers are spawned or terminated to reach the target. Shutdown
//! forces the target to zero, draining every idle controller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::client::HealthReport;
use super::manager_simple::SimpleManager;
use super::GpuManager;
use crate::engine::NotifyCallback;
use crate::error::StasisResult;
use crate::state::ControllerState;
use crate::store::Store;
use crate::types::ControllerId;

pub struct PoolManager {
    inner: SimpleManager,
    target: AtomicUsize,
    store: Arc<dyn Store>,
    maintaining: tokio::sync::Mutex<()>,
}

impl PoolManager {
    /// Start maintaining `target` FREE controllers until `lifetime` ends.
    pub fn start(
        inner: SimpleManager,
        target: usize,
        store: Arc<dyn Store>,
        interval: Duration,
        lifetime: CancellationToken,
        tasks: &TaskTracker,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            inner,
            target: AtomicUsize::new(target),
            store,
            maintaining: tokio::sync::Mutex::new(()),
        });

        let worker = manager.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = worker.maintain(&lifetime).await {
                            tracing::warn!(error = %e, "GPU pool maintenance failed");
                        }
                    }
                    _ = lifetime.cancelled() => break,
                }
            }
            tracing::debug!("GPU pool maintenance stopped");
        });

        manager
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// One reconciliation pass.
    pub async fn maintain(&self, lifetime: &CancellationToken) -> StasisResult<()> {
        let _serialized = self.maintaining.lock().await;
        let pool = self.inner.pool();

        let records = match self.store.list_controllers().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load controller records");
                Vec::new()
            }
        };
        pool.sync(lifetime, &records).await?;

        let target = self.target();
        let free = pool.list_state(ControllerState::Free);
        if free.len() < target {
            for _ in free.len()..target {
                match pool.spawn(lifetime).await {
                    Ok(controller) => controller.booking.unlock(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to grow GPU pool");
                        break;
                    }
                }
            }
        } else {
            for controller in free.iter().skip(target) {
                if matches!(controller.booking.try_lock(), Ok(true)) {
                    pool.terminate(&controller.id).await;
                }
            }
        }

        self.persist(&records).await;

        let states = self.inner.states();
        crate::metrics::set_gpu_controllers(
            &states.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
        );
        let count = |state: ControllerState| states.iter().filter(|(_, s)| *s == state).count();
        tracing::debug!(
            free = count(ControllerState::Free),
            busy = count(ControllerState::Busy),
            stale = count(ControllerState::Stale),
            target = target,
            "GPU pool maintained"
        );
        Ok(())
    }

    /// Mirror the live pool into the store, deleting records that left it.
    async fn persist(&self, previous: &[crate::api::ControllerRecord]) {
        let pool = self.inner.pool();
        let mut live = HashSet::new();

        for (controller, state) in pool.list() {
            if state == ControllerState::Stale {
                continue;
            }
            live.insert(controller.id.clone());
            if let Err(e) = self.store.put_controller(&controller.record()).await {
                tracing::warn!(controller = %controller.id, error = %e, "Failed to persist controller");
            }
        }

        for record in previous {
            if live.contains(&record.id) {
                continue;
            }
            if let Err(e) = self.store.delete_controller(&record.id).await {
                tracing::warn!(controller = %record.id, error = %e, "Failed to delete controller record");
            }
        }
    }
}

#[async_trait]
impl GpuManager for PoolManager {
    async fn attach(
        &self,
        lifetime: &CancellationToken,
        pid: oneshot::Receiver<u32>,
    ) -> StasisResult<ControllerId> {
        self.inner.attach(lifetime, pid).await
    }

    async fn detach(&self, pid: u32) -> StasisResult<()> {
        self.inner.detach(pid).await
    }

    fn is_attached(&self, pid: u32) -> bool {
        self.inner.is_attached(pid)
    }

    fn controller_for(&self, pid: u32) -> Option<ControllerId> {
        self.inner.controller_for(pid)
    }

    async fn freeze(&self, lifetime: &CancellationToken, pid: u32) -> StasisResult<()> {
        self.inner.freeze(lifetime, pid).await
    }

    async fn unfreeze(&self, lifetime: &CancellationToken, pid: u32) -> StasisResult<()> {
        self.inner.unfreeze(lifetime, pid).await
    }

    fn criu_callback(
        &self,
        id: &ControllerId,
        restored: Option<oneshot::Sender<u32>>,
    ) -> StasisResult<NotifyCallback> {
        self.inner.criu_callback(id, restored)
    }

    async fn sync(&self, lifetime: &CancellationToken) -> StasisResult<()> {
        self.maintain(lifetime).await
    }

    async fn check(&self, lifetime: &CancellationToken) -> StasisResult<HealthReport> {
        self.inner.check(lifetime).await
    }

    fn states(&self) -> Vec<(ControllerId, ControllerState)> {
        self.inner.states()
    }

    async fn shutdown(&self) {
        self.target.store(0, Ordering::SeqCst);
        // The daemon lifetime is already over; drain under a fresh scope.
        if let Err(e) = self.maintain(&CancellationToken::new()).await {
            tracing::warn!(error = %e, "Failed to drain GPU pool");
        }
        tracing::info!(remaining = self.inner.pool().len(), "GPU pool drained");
    }
}
