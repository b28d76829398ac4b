// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! GPU controller pool.
//!
//! A controller is an external helper process that captures and restores
//! the GPU state of one workload. Controllers are spawned ahead of time or
//! on demand, booked by exactly one workload through a file lock, and
//! driven from the engine's callback phases so GPU and CPU capture overlap.
//!
//! Every call into a controller is bounded by a per-operation time limit
//! and by the caller's cancellation scope.

mod adapters;
mod bridge;
mod client;
mod controller;
mod lock;
mod manager_pool;
mod manager_simple;
mod pool;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::engine::NotifyCallback;
use crate::error::{GpuError, StasisError, StasisResult};
use crate::state::ControllerState;
use crate::types::ControllerId;

pub use adapters::{attach, dump, freeze, restore, unfreeze};
pub use client::{
    Connection, Connector, ControllerInfo, HealthReport, Reply, Request, UnixConnector,
};
pub use controller::Controller;
pub use lock::BookingLock;
pub use manager_pool::PoolManager;
pub use manager_simple::SimpleManager;
pub use pool::{ControllerPool, PoolSettings};

// ============================================================================
// Timeouts
// ============================================================================

pub const FREEZE_TIMEOUT: Duration = Duration::from_secs(60);
pub const UNFREEZE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DUMP_TIMEOUT: Duration = Duration::from_secs(300);
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(300);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const INFO_TIMEOUT: Duration = Duration::from_secs(30);
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for a controller this pool did not spawn to exit after SIGTERM.
pub const TERMINATION_WAIT: Duration = Duration::from_secs(10);

/// Shared memory used by the throwaway health-check controller (100 MiB).
pub const HEALTH_CHECK_SHM_MB: u64 = 100;

/// Consecutive failed syncs after which a controller counts as stale.
pub const MAX_SYNC_FAILURES: u32 = 3;

/// Sent to a restored workload before it resumes; its PID has changed.
pub const RESTORED_PID_SIGNAL: Signal = Signal::SIGUSR1;

/// Which GPU communication layer a freeze quiesces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeType {
    #[default]
    Ipc,
    Nccl,
}

impl FreezeType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Nccl => "nccl",
        }
    }
}

impl fmt::Display for FreezeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FreezeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipc" => Ok(Self::Ipc),
            "nccl" => Ok(Self::Nccl),
            other => Err(format!("unknown freeze type '{}' (expected ipc or nccl)", other)),
        }
    }
}

/// Run `fut` under a time limit, aborting early when `lifetime` is
/// cancelled. `None` detaches the wait from any cancellation scope.
pub(crate) async fn bounded<T, F>(
    lifetime: Option<&CancellationToken>,
    op: &'static str,
    id: &ControllerId,
    limit: Duration,
    fut: F,
) -> Result<T, GpuError>
where
    F: Future<Output = Result<T, GpuError>>,
{
    let timed = tokio::time::timeout(limit, fut);
    let result = match lifetime {
        Some(token) => tokio::select! {
            _ = token.cancelled() => {
                return Err(GpuError::Cancelled { op, id: id.to_string() });
            }
            result = timed => result,
        },
        None => timed.await,
    };

    result.unwrap_or_else(|_| {
        Err(GpuError::Timeout {
            op,
            id: id.to_string(),
            limit_secs: limit.as_secs(),
        })
    })
}

/// What the rest of the daemon needs from the GPU pool.
#[async_trait]
pub trait GpuManager: Send + Sync {
    /// Book (or spawn) a controller for a workload whose PID arrives on
    /// `pid` later. Dropping the sender releases the controller.
    async fn attach(
        &self,
        lifetime: &CancellationToken,
        pid: oneshot::Receiver<u32>,
    ) -> StasisResult<ControllerId>;

    /// Release the controller attached to `pid`.
    async fn detach(&self, pid: u32) -> StasisResult<()>;

    fn is_attached(&self, pid: u32) -> bool;

    fn controller_for(&self, pid: u32) -> Option<ControllerId>;

    async fn freeze(&self, lifetime: &CancellationToken, pid: u32) -> StasisResult<()>;

    async fn unfreeze(&self, lifetime: &CancellationToken, pid: u32) -> StasisResult<()>;

    /// Engine callbacks that run the GPU side of a dump or restore on `id`.
    /// `restored` receives the restored PID during a restore.
    fn criu_callback(
        &self,
        id: &ControllerId,
        restored: Option<oneshot::Sender<u32>>,
    ) -> StasisResult<NotifyCallback>;

    async fn sync(&self, lifetime: &CancellationToken) -> StasisResult<()>;

    /// Spawn a throwaway controller and ask it for a health report.
    async fn check(&self, lifetime: &CancellationToken) -> StasisResult<HealthReport>;

    fn states(&self) -> Vec<(ControllerId, ControllerState)>;

    async fn shutdown(&self);
}

/// Stand-in used when no controller binary is configured.
#[derive(Debug, Default)]
pub struct MissingManager;

fn gpu_not_installed() -> StasisError {
    StasisError::failed_precondition("GPU support is not installed")
}

#[async_trait]
impl GpuManager for MissingManager {
    async fn attach(
        &self,
        _lifetime: &CancellationToken,
        _pid: oneshot::Receiver<u32>,
    ) -> StasisResult<ControllerId> {
        Err(gpu_not_installed())
    }

    async fn detach(&self, pid: u32) -> StasisResult<()> {
        Err(GpuError::NotAttached { pid }.into())
    }

    fn is_attached(&self, _pid: u32) -> bool {
        false
    }

    fn controller_for(&self, _pid: u32) -> Option<ControllerId> {
        None
    }

    async fn freeze(&self, _lifetime: &CancellationToken, _pid: u32) -> StasisResult<()> {
        Err(gpu_not_installed())
    }

    async fn unfreeze(&self, _lifetime: &CancellationToken, _pid: u32) -> StasisResult<()> {
        Err(gpu_not_installed())
    }

    fn criu_callback(
        &self,
        _id: &ControllerId,
        _restored: Option<oneshot::Sender<u32>>,
    ) -> StasisResult<NotifyCallback> {
        Err(gpu_not_installed())
    }

    async fn sync(&self, _lifetime: &CancellationToken) -> StasisResult<()> {
        Ok(())
    }

    async fn check(&self, _lifetime: &CancellationToken) -> StasisResult<HealthReport> {
        Err(gpu_not_installed().with_kind(crate::error::StatusKind::Unavailable))
    }

    fn states(&self) -> Vec<(ControllerId, ControllerState)> {
        Vec::new()
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freeze_type_parse() {
        assert_eq!("ipc".parse::<FreezeType>().unwrap(), FreezeType::Ipc);
        assert_eq!("NCCL".parse::<FreezeType>().unwrap(), FreezeType::Nccl);
        assert!("cuda".parse::<FreezeType>().is_err());
    }

    #[tokio::test]
    async fn test_bounded_timeout() {
        let id = ControllerId::generate();
        let result: Result<(), GpuError> = bounded(None, "dump", &id, Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GpuError::Timeout { op: "dump", .. })));
    }

    #[tokio::test]
    async fn test_bounded_cancelled() {
        let id = ControllerId::generate();
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), GpuError> =
            bounded(Some(&token), "freeze", &id, Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GpuError::Cancelled { op: "freeze", .. })));
    }

    #[tokio::test]
    async fn test_missing_manager() {
        let manager = MissingManager;
        let (_tx, rx) = oneshot::channel();
        let err = manager.attach(&CancellationToken::new(), rx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::StatusKind::FailedPrecondition);
        assert!(!manager.is_attached(1));
    }
}
