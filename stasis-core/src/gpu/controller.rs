// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One GPU controller process and the calls it answers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::client::{Connection, Connector, ControllerInfo, HealthReport, Reply, Request};
use super::lock::BookingLock;
use super::{
    bounded, FreezeType, ATTACH_TIMEOUT, DUMP_TIMEOUT, FREEZE_TIMEOUT, HEALTH_TIMEOUT,
    INFO_TIMEOUT, RESTORE_TIMEOUT, UNFREEZE_TIMEOUT,
};
use crate::api::ControllerRecord;
use crate::error::GpuError;
use crate::types::ControllerId;

pub struct Controller {
    pub id: ControllerId,
    address: RwLock<PathBuf>,
    info: RwLock<ControllerInfo>,
    /// Set between booking for a workload and learning its PID.
    pending: AtomicBool,
    sync_failures: AtomicU32,
    pub(crate) booking: BookingLock,
    /// Held while an engine callback works with this controller's files.
    pub(crate) termination: Arc<tokio::sync::Mutex<()>>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    /// Present only when this daemon spawned the controller.
    child: tokio::sync::Mutex<Option<Child>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write<T>(lock: &RwLock<T>, value: T) {
    match lock.write() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

impl Controller {
    pub fn new(id: ControllerId, address: PathBuf, booking: impl Into<PathBuf>) -> Self {
        Self {
            id,
            address: RwLock::new(address),
            info: RwLock::new(ControllerInfo::default()),
            pending: AtomicBool::new(false),
            sync_failures: AtomicU32::new(0),
            booking: BookingLock::new(booking),
            termination: Arc::new(tokio::sync::Mutex::new(())),
            connection: RwLock::new(None),
            child: tokio::sync::Mutex::new(None),
        }
    }

    pub fn info(&self) -> ControllerInfo {
        read(&self.info)
    }

    pub fn address(&self) -> PathBuf {
        read(&self.address)
    }

    pub fn pid(&self) -> u32 {
        self.info().pid
    }

    pub fn attached_pid(&self) -> u32 {
        self.info().attached_pid
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn sync_failures(&self) -> u32 {
        self.sync_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn record_sync_failure(&self) -> u32 {
        self.sync_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record(&self) -> ControllerRecord {
        let info = self.info();
        ControllerRecord {
            id: self.id.clone(),
            address: self.address(),
            pid: info.pid,
            attached_pid: info.attached_pid,
        }
    }

    pub(crate) async fn set_child(&self, child: Child) {
        if let Some(pid) = child.id() {
            self.update_info(|info| info.pid = pid);
        }
        *self.child.lock().await = Some(child);
    }

    pub(crate) async fn take_child(&self) -> Option<Child> {
        self.child.lock().await.take()
    }

    /// Whether this daemon spawned the controller.
    pub(crate) async fn has_child(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Whether the spawned child has already exited.
    pub(crate) async fn child_exited(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn update_info(&self, f: impl FnOnce(&mut ControllerInfo)) {
        match self.info.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn connection(&self, op: &'static str) -> Result<Arc<dyn Connection>, GpuError> {
        read(&self.connection).ok_or_else(|| GpuError::Rpc {
            op,
            id: self.id.to_string(),
            message: "not connected".to_string(),
        })
    }

    /// Connect to `address` and refresh what the controller reports.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        lifetime: Option<&CancellationToken>,
        address: &Path,
    ) -> Result<ControllerInfo, GpuError> {
        let connection = bounded(lifetime, "connect", &self.id, INFO_TIMEOUT, async {
            connector.connect(&self.id, address).await
        })
        .await?;
        write(&self.address, address.to_path_buf());
        write(&self.connection, Some(connection));
        self.refresh(lifetime).await
    }

    /// Re-read controller info over the open connection.
    pub async fn refresh(
        &self,
        lifetime: Option<&CancellationToken>,
    ) -> Result<ControllerInfo, GpuError> {
        let reply = self.call(lifetime, INFO_TIMEOUT, Request::Info).await?;
        let reported = reply.info.ok_or_else(|| GpuError::Rpc {
            op: "info",
            id: self.id.to_string(),
            message: "reply carried no info".to_string(),
        })?;

        // A controller we spawned is identified by its child PID.
        self.update_info(|info| {
            let pid = if info.pid != 0 { info.pid } else { reported.pid };
            *info = ControllerInfo { pid, ..reported };
        });
        self.sync_failures.store(0, Ordering::SeqCst);
        Ok(self.info())
    }

    async fn call(
        &self,
        lifetime: Option<&CancellationToken>,
        limit: Duration,
        request: Request,
    ) -> Result<Reply, GpuError> {
        let op = request.op();
        let connection = self.connection(op)?;
        let id = self.id.to_string();

        tracing::trace!(controller = %self.id, op = op, "Controller call");

        bounded(lifetime, op, &self.id, limit, async move {
            let reply = connection.call(request).await.map_err(|e| GpuError::Rpc {
                op,
                id: id.clone(),
                message: e.to_string(),
            })?;
            if !reply.ok {
                return Err(GpuError::Rpc {
                    op,
                    id,
                    message: reply
                        .error
                        .unwrap_or_else(|| "controller reported failure".to_string()),
                });
            }
            Ok(reply)
        })
        .await
    }

    /// Bind the controller to a workload PID, replacing any previous one.
    pub async fn attach(
        &self,
        lifetime: Option<&CancellationToken>,
        pid: u32,
    ) -> Result<(), GpuError> {
        self.call(lifetime, ATTACH_TIMEOUT, Request::Attach { pid })
            .await?;
        self.update_info(|info| info.attached_pid = pid);
        Ok(())
    }

    pub async fn freeze(
        &self,
        lifetime: Option<&CancellationToken>,
        freeze_type: FreezeType,
    ) -> Result<(), GpuError> {
        self.call(lifetime, FREEZE_TIMEOUT, Request::Freeze { freeze_type })
            .await
            .map(drop)
    }

    pub async fn unfreeze(
        &self,
        lifetime: Option<&CancellationToken>,
        freeze_type: FreezeType,
    ) -> Result<(), GpuError> {
        self.call(lifetime, UNFREEZE_TIMEOUT, Request::Unfreeze { freeze_type })
            .await
            .map(drop)
    }

    pub async fn dump(
        &self,
        lifetime: Option<&CancellationToken>,
        dir: &Path,
    ) -> Result<(), GpuError> {
        self.call(
            lifetime,
            DUMP_TIMEOUT,
            Request::Dump {
                dir: dir.to_path_buf(),
            },
        )
        .await
        .map(drop)
    }

    pub async fn restore(
        &self,
        lifetime: Option<&CancellationToken>,
        dir: &Path,
    ) -> Result<(), GpuError> {
        self.call(
            lifetime,
            RESTORE_TIMEOUT,
            Request::Restore {
                dir: dir.to_path_buf(),
            },
        )
        .await
        .map(drop)
    }

    pub async fn health(
        &self,
        lifetime: Option<&CancellationToken>,
    ) -> Result<HealthReport, GpuError> {
        let reply = self
            .call(lifetime, HEALTH_TIMEOUT, Request::HealthCheck)
            .await
            .map_err(|e| GpuError::Unhealthy {
                reason: e.to_string(),
            })?;
        Ok(reply.health.unwrap_or_default())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("info", &self.info())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
