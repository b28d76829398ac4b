// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! On-demand manager: books a free controller when one exists, otherwise
//! spawns one, and terminates it when its workload goes away.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::bridge::{self, BridgeSettings};
use super::client::HealthReport;
use super::controller::Controller;
use super::pool::ControllerPool;
use super::GpuManager;
use crate::config::GpuConfig;
use crate::engine::NotifyCallback;
use crate::error::{GpuError, StasisResult};
use crate::state::ControllerState;
use crate::types::ControllerId;

pub struct SimpleManager {
    pool: Arc<ControllerPool>,
    bridge: BridgeSettings,
    tasks: TaskTracker,
}

impl SimpleManager {
    pub fn new(pool: Arc<ControllerPool>, config: &GpuConfig, tasks: TaskTracker) -> Self {
        Self {
            pool,
            bridge: BridgeSettings {
                freeze_type: config.freeze_type,
                parallel_dump: config.parallel_dump,
                parallel_restore: config.parallel_restore,
            },
            tasks,
        }
    }

    pub fn pool(&self) -> &Arc<ControllerPool> {
        &self.pool
    }

    async fn acquire(&self, lifetime: &CancellationToken) -> Result<Arc<Controller>, GpuError> {
        if let Some(controller) = self.pool.book() {
            return Ok(controller);
        }
        tracing::debug!("No free GPU controller, spawning one");
        self.pool.spawn(lifetime).await
    }

    fn attached(&self, pid: u32) -> Result<Arc<Controller>, GpuError> {
        self.pool
            .find_attached(pid)
            .ok_or(GpuError::NotAttached { pid })
    }
}

#[async_trait]
impl GpuManager for SimpleManager {
    async fn attach(
        &self,
        lifetime: &CancellationToken,
        pid: oneshot::Receiver<u32>,
    ) -> StasisResult<ControllerId> {
        let controller = self.acquire(lifetime).await?;
        controller.set_pending(true);
        let id = controller.id.clone();

        let pool = self.pool.clone();
        let lifetime = lifetime.clone();
        self.tasks.spawn(async move {
            let pid = tokio::select! {
                pid = pid => pid.ok(),
                _ = lifetime.cancelled() => None,
            };

            let Some(pid) = pid else {
                tracing::debug!(controller = %controller.id, "Attach abandoned, terminating controller");
                controller.set_pending(false);
                pool.terminate(&controller.id).await;
                return;
            };

            match controller.attach(Some(&lifetime), pid).await {
                Ok(()) => {
                    controller.set_pending(false);
                    controller.booking.unlock();
                    tracing::info!(controller = %controller.id, pid = pid, "GPU controller attached");
                }
                Err(e) => {
                    tracing::warn!(controller = %controller.id, pid = pid, error = %e, "GPU attach failed");
                    controller.set_pending(false);
                    pool.terminate(&controller.id).await;
                }
            }
        });

        Ok(id)
    }

    async fn detach(&self, pid: u32) -> StasisResult<()> {
        let controller = self.attached(pid)?;
        tracing::debug!(controller = %controller.id, pid = pid, "Detaching GPU controller");
        self.pool.terminate(&controller.id).await;
        Ok(())
    }

    fn is_attached(&self, pid: u32) -> bool {
        self.pool.find_attached(pid).is_some()
    }

    fn controller_for(&self, pid: u32) -> Option<ControllerId> {
        self.pool.find_attached(pid).map(|c| c.id.clone())
    }

    async fn freeze(&self, lifetime: &CancellationToken, pid: u32) -> StasisResult<()> {
        let controller = self.attached(pid)?;
        controller
            .freeze(Some(lifetime), self.bridge.freeze_type)
            .await?;
        Ok(())
    }

    async fn unfreeze(&self, lifetime: &CancellationToken, pid: u32) -> StasisResult<()> {
        let controller = self.attached(pid)?;
        controller
            .unfreeze(Some(lifetime), self.bridge.freeze_type)
            .await?;
        Ok(())
    }

    fn criu_callback(
        &self,
        id: &ControllerId,
        restored: Option<oneshot::Sender<u32>>,
    ) -> StasisResult<NotifyCallback> {
        let controller = self
            .pool
            .get(id)
            .ok_or_else(|| GpuError::ControllerNotFound { id: id.to_string() })?;
        Ok(bridge::callback(
            controller,
            self.bridge,
            restored,
            self.tasks.clone(),
        ))
    }

    async fn sync(&self, lifetime: &CancellationToken) -> StasisResult<()> {
        self.pool.sync(lifetime, &[]).await?;
        Ok(())
    }

    async fn check(&self, lifetime: &CancellationToken) -> StasisResult<HealthReport> {
        Ok(self.pool.check(lifetime).await?)
    }

    fn states(&self) -> Vec<(ControllerId, ControllerState)> {
        self.pool
            .list()
            .into_iter()
            .map(|(c, state)| (c.id.clone(), state))
            .collect()
    }

    async fn shutdown(&self) {
        for controller in self.pool.list_state(ControllerState::Free) {
            if matches!(controller.booking.try_lock(), Ok(true)) {
                self.pool.terminate(&controller.id).await;
            }
        }
    }
}
