// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-memory controller pool.
//!
//! The pool is the set of controllers this daemon knows about, reconciled
//! against the address files in the socket directory and any persisted
//! records. Booking goes through the file lock, so two daemons sharing the
//! directories never hand out the same controller.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::client::{Connector, HealthReport};
use super::controller::Controller;
use super::{bounded, INFO_TIMEOUT, MAX_SYNC_FAILURES, TERMINATION_WAIT, HEALTH_CHECK_SHM_MB};
use crate::api::ControllerRecord;
use crate::config::GpuConfig;
use crate::error::GpuError;
use crate::process;
use crate::state::ControllerState;
use crate::types::{ControllerId, ShmSize};

const ADDRESS_PREFIX: &str = "stasis-gpu-controller-";
const ADDRESS_SUFFIX: &str = ".addr";
const ARTIFACT_PREFIX: &str = "stasis-gpu.";
const ADDRESS_POLL: Duration = Duration::from_millis(50);

/// Environment handed to spawned controllers.
pub const SHM_SIZE_ENV: &str = "STASIS_GPU_SHM_SIZE";
pub const SHM_NAME_ENV: &str = "STASIS_GPU_SHM_NAME";
pub const UID_ENV: &str = "STASIS_GPU_UID";
pub const GID_ENV: &str = "STASIS_GPU_GID";

/// What this pool spawns and what it accepts as compatible.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub binary: Option<PathBuf>,
    pub sock_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub log_dir: PathBuf,
    pub shm_size: ShmSize,
    pub uid: u32,
    pub gid: u32,
    pub ld_library_path: Option<String>,
}

impl PoolSettings {
    /// Settings for the calling user.
    pub fn from_config(config: &GpuConfig) -> Self {
        Self {
            binary: config.controller_binary.clone(),
            sock_dir: config.sock_dir.clone(),
            lock_dir: config.lock_dir.clone(),
            log_dir: config.log_dir.clone(),
            shm_size: config.shm_size,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            ld_library_path: config.ld_library_path.clone(),
        }
    }
}

pub struct ControllerPool {
    settings: PoolSettings,
    controllers: DashMap<ControllerId, Arc<Controller>>,
    /// Live controllers owned elsewhere that were dropped as stale. Not
    /// rediscovered while their address file remains.
    ignored: DashSet<ControllerId>,
    connector: Arc<dyn Connector>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl ControllerPool {
    pub fn new(settings: PoolSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            controllers: DashMap::new(),
            ignored: DashSet::new(),
            connector,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn address_file(&self, id: &ControllerId) -> PathBuf {
        self.settings
            .sock_dir
            .join(format!("{}{}{}", ADDRESS_PREFIX, id, ADDRESS_SUFFIX))
    }

    fn shm_file(&self, id: &ControllerId) -> PathBuf {
        self.settings
            .lock_dir
            .join(format!("{}{}", ARTIFACT_PREFIX, id))
    }

    fn booking_file(&self, id: &ControllerId) -> PathBuf {
        self.settings
            .lock_dir
            .join(format!("{}{}.booking", ARTIFACT_PREFIX, id))
    }

    fn new_controller(&self, id: ControllerId, address: PathBuf) -> Arc<Controller> {
        let booking = self.booking_file(&id);
        Arc::new(Controller::new(id, address, booking))
    }

    pub fn get(&self, id: &ControllerId) -> Option<Arc<Controller>> {
        self.controllers.get(id).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Controller attached to a live `pid`.
    pub fn find_attached(&self, pid: u32) -> Option<Arc<Controller>> {
        if pid == 0 {
            return None;
        }
        self.controllers
            .iter()
            .find(|c| c.attached_pid() == pid && !c.is_pending())
            .map(|c| c.value().clone())
    }

    /// Current state of `controller` as seen by this pool.
    pub fn classify(&self, controller: &Controller) -> ControllerState {
        self.classify_with(controller, false)
    }

    fn classify_with(&self, controller: &Controller, ignore_booking: bool) -> ControllerState {
        let info = controller.info();

        if !process::is_alive(info.pid) || controller.sync_failures() >= MAX_SYNC_FAILURES {
            return ControllerState::Stale;
        }
        if controller.is_pending() || (!ignore_booking && controller.booking.is_locked()) {
            return ControllerState::Busy;
        }
        if info.attached_pid != 0 {
            return if process::is_alive(info.attached_pid) {
                ControllerState::Busy
            } else {
                ControllerState::Stale
            };
        }
        if info.shm_size != self.settings.shm_size.bytes()
            || info.uid != self.settings.uid
            || info.gid != self.settings.gid
        {
            return ControllerState::Stale;
        }
        ControllerState::Free
    }

    pub fn list(&self) -> Vec<(Arc<Controller>, ControllerState)> {
        let controllers: Vec<Arc<Controller>> =
            self.controllers.iter().map(|c| c.value().clone()).collect();
        controllers
            .into_iter()
            .map(|c| {
                let state = self.classify(&c);
                (c, state)
            })
            .collect()
    }

    pub fn list_state(&self, state: ControllerState) -> Vec<Arc<Controller>> {
        self.list()
            .into_iter()
            .filter(|(_, s)| *s == state)
            .map(|(c, _)| c)
            .collect()
    }

    pub fn records(&self) -> Vec<ControllerRecord> {
        self.controllers.iter().map(|c| c.record()).collect()
    }

    /// Claim a free controller. The lock is taken first and freedom is
    /// re-checked under it.
    pub fn book(&self) -> Option<Arc<Controller>> {
        for controller in self.list_state(ControllerState::Free) {
            match controller.booking.try_lock() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(controller = %controller.id, error = %e, "Booking failed");
                    continue;
                }
            }

            if self.controllers.contains_key(&controller.id)
                && self.classify_with(&controller, true) == ControllerState::Free
            {
                tracing::debug!(controller = %controller.id, "Booked GPU controller");
                return Some(controller);
            }
            controller.booking.unlock();
        }
        None
    }

    /// Release a booking without attaching.
    pub fn release(&self, id: &ControllerId) {
        if let Some(controller) = self.get(id) {
            controller.booking.unlock();
        }
    }

    /// Reconcile with the socket directory and `records`.
    ///
    /// Stale entries are dropped first; those that are dead or were spawned
    /// here are terminated, the rest are ignored until their address file
    /// goes away. Then every address file and record not yet in the pool is
    /// connected to concurrently, and known controllers that are not busy
    /// are refreshed.
    pub async fn sync(
        &self,
        lifetime: &CancellationToken,
        records: &[ControllerRecord],
    ) -> Result<(), GpuError> {
        let _serialized = self.sync_lock.lock().await;

        for (controller, state) in self.list() {
            if state != ControllerState::Stale {
                continue;
            }
            let dead = !process::is_alive(controller.pid());
            let ours = controller.has_child().await;
            if dead || ours {
                self.terminate(&controller.id).await;
            } else {
                tracing::debug!(controller = %controller.id, "Ignoring stale controller owned elsewhere");
                self.controllers.remove(&controller.id);
                self.ignored.insert(controller.id.clone());
            }
        }

        let mut discovered = self.discover()?;
        self.ignored
            .retain(|id| discovered.iter().any(|(found, _)| found == id));
        for record in records {
            discovered.push((record.id.clone(), record.address.clone()));
        }
        discovered.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        discovered.dedup_by(|a, b| a.0 == b.0);

        let mut connecting = JoinSet::new();
        for (id, address) in discovered {
            if self.controllers.contains_key(&id) || self.ignored.contains(&id) {
                continue;
            }
            let controller = self.new_controller(id, address.clone());
            let connector = self.connector.clone();
            let lifetime = lifetime.clone();
            connecting.spawn(async move {
                let result = controller
                    .connect(&*connector, Some(&lifetime), &address)
                    .await;
                (controller, result)
            });
        }

        while let Some(joined) = connecting.join_next().await {
            let Ok((controller, result)) = joined else {
                continue;
            };
            match result {
                Ok(info) => {
                    tracing::debug!(controller = %controller.id, pid = info.pid, "Discovered GPU controller");
                    self.controllers
                        .entry(controller.id.clone())
                        .or_insert(controller);
                }
                Err(e) => {
                    tracing::debug!(controller = %controller.id, error = %e, "Skipping unreachable controller");
                }
            }
        }

        for (controller, state) in self.list() {
            if state == ControllerState::Busy {
                continue;
            }
            if let Err(e) = controller.refresh(Some(lifetime)).await {
                let failures = controller.record_sync_failure();
                tracing::debug!(controller = %controller.id, failures = failures, error = %e, "Controller sync failed");
            }
        }

        Ok(())
    }

    /// Address files in the socket directory: `(id, socket path)`.
    fn discover(&self) -> Result<Vec<(ControllerId, PathBuf)>, GpuError> {
        let entries = match std::fs::read_dir(&self.settings.sock_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GpuError::Rpc {
                    op: "sync",
                    id: String::new(),
                    message: format!("{}: {}", self.settings.sock_dir.display(), e),
                })
            }
        };

        let mut found = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(id) = name
                .strip_prefix(ADDRESS_PREFIX)
                .and_then(|rest| rest.strip_suffix(ADDRESS_SUFFIX))
            else {
                continue;
            };
            let Ok(id) = ControllerId::new(id) else {
                continue;
            };
            if let Some(address) = read_address(&entry.path()) {
                found.push((id, address));
            }
        }
        Ok(found)
    }

    /// Start a new controller, connect to it and leave it booked.
    pub async fn spawn(&self, lifetime: &CancellationToken) -> Result<Arc<Controller>, GpuError> {
        self.spawn_with(lifetime, self.settings.shm_size).await
    }

    async fn spawn_with(
        &self,
        lifetime: &CancellationToken,
        shm_size: ShmSize,
    ) -> Result<Arc<Controller>, GpuError> {
        let binary = match &self.settings.binary {
            Some(binary) if binary.is_file() => binary.clone(),
            other => {
                return Err(GpuError::BinaryNotFound {
                    path: other.clone().unwrap_or_default(),
                })
            }
        };

        let id = ControllerId::generate();
        let controller = self.new_controller(id.clone(), PathBuf::new());
        if !controller.booking.try_lock()? {
            return Err(GpuError::Booking {
                path: controller.booking.path().to_path_buf(),
                reason: "fresh controller already booked".to_string(),
            });
        }
        self.controllers.insert(id.clone(), controller.clone());

        let start = std::time::Instant::now();
        match self.start(lifetime, &controller, &binary, shm_size).await {
            Ok(()) => {
                tracing::info!(
                    controller = %id,
                    pid = controller.pid(),
                    shm = %shm_size,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Spawned GPU controller"
                );
                Ok(controller)
            }
            Err(e) => {
                tracing::warn!(controller = %id, error = %e, "GPU controller failed to start");
                self.terminate(&id).await;
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        lifetime: &CancellationToken,
        controller: &Arc<Controller>,
        binary: &Path,
        shm_size: ShmSize,
    ) -> Result<(), GpuError> {
        let spawn_error = |e: std::io::Error| GpuError::Spawn {
            reason: e.to_string(),
        };

        for dir in [&self.settings.sock_dir, &self.settings.log_dir, &self.settings.lock_dir] {
            std::fs::create_dir_all(dir).map_err(spawn_error)?;
        }
        let log_path = self
            .settings
            .log_dir
            .join(format!("{}{}.log", ADDRESS_PREFIX, controller.id));
        let log = std::fs::File::create(&log_path).map_err(spawn_error)?;
        let log_err = log.try_clone().map_err(spawn_error)?;

        let mut command = tokio::process::Command::new(binary);
        command
            .arg(controller.id.as_str())
            .arg("--log-dir")
            .arg(&self.settings.log_dir)
            .arg("--sock-dir")
            .arg(&self.settings.sock_dir)
            .env(SHM_SIZE_ENV, shm_size.bytes().to_string())
            .env(SHM_NAME_ENV, self.shm_file(&controller.id))
            .env(UID_ENV, self.settings.uid.to_string())
            .env(GID_ENV, self.settings.gid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);
        if let Some(path) = &self.settings.ld_library_path {
            command.env("LD_LIBRARY_PATH", path);
        }

        let child = command.spawn().map_err(spawn_error)?;
        controller.set_child(child).await;

        let address_file = self.address_file(&controller.id);
        let address = bounded(Some(lifetime), "spawn", &controller.id, INFO_TIMEOUT, async {
            loop {
                if let Some(address) = read_address(&address_file) {
                    return Ok(address);
                }
                if controller.child_exited().await {
                    return Err(GpuError::Spawn {
                        reason: format!("controller exited early, see {}", log_path.display()),
                    });
                }
                tokio::time::sleep(ADDRESS_POLL).await;
            }
        })
        .await?;

        controller
            .connect(&*self.connector, Some(lifetime), &address)
            .await?;
        Ok(())
    }

    /// Stop a controller and remove everything it left on disk. Safe to
    /// call repeatedly and for unknown ids.
    pub async fn terminate(&self, id: &ControllerId) {
        if let Some((_, controller)) = self.controllers.remove(id) {
            let _quiesced = controller.termination.lock().await;
            let pid = controller.pid();

            if pid != 0 {
                if let Err(e) = process::signal(pid, nix::sys::signal::Signal::SIGTERM) {
                    tracing::debug!(controller = %id, pid = pid, error = %e, "SIGTERM failed");
                }
            }

            match controller.take_child().await {
                Some(mut child) => {
                    if tokio::time::timeout(TERMINATION_WAIT, child.wait())
                        .await
                        .is_err()
                    {
                        tracing::warn!(controller = %id, pid = pid, "Controller ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
                None if pid != 0 => {
                    if !process::wait_gone(pid, TERMINATION_WAIT).await {
                        tracing::warn!(controller = %id, pid = pid, "Controller still alive after termination wait");
                    }
                }
                None => {}
            }

            controller.booking.remove();
            tracing::debug!(controller = %id, "Terminated GPU controller");
        }

        for path in [self.address_file(id), self.shm_file(id), self.booking_file(id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Failed to remove controller artifact")
                }
            }
        }
    }

    /// Spawn a small throwaway controller and ask it for a health report.
    pub async fn check(&self, lifetime: &CancellationToken) -> Result<HealthReport, GpuError> {
        let shm = ShmSize::from_mb(HEALTH_CHECK_SHM_MB).map_err(|e| GpuError::Unhealthy {
            reason: e.to_string(),
        })?;
        let controller = self
            .spawn_with(lifetime, shm)
            .await
            .map_err(|e| GpuError::Unhealthy {
                reason: e.to_string(),
            })?;
        let report = controller.health(Some(lifetime)).await;
        self.terminate(&controller.id).await;
        report
    }
}

fn read_address(path: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(path).ok()?;
    let address = content.trim();
    if address.is_empty() {
        return None;
    }
    Some(PathBuf::from(address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::client::{Connection, ControllerInfo, Reply, Request};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Answers for a controller whose PID is encoded in its socket name.
    struct FakeConnection {
        pid: u32,
        shm_size: u64,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn call(&self, request: Request) -> std::io::Result<Reply> {
            Ok(match request {
                Request::Info => Reply {
                    ok: true,
                    info: Some(ControllerInfo {
                        pid: self.pid,
                        shm_size: self.shm_size,
                        uid: nix::unistd::getuid().as_raw(),
                        gid: nix::unistd::getgid().as_raw(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                _ => Reply::ok(),
            })
        }
    }

    struct FakeConnector {
        shm_size: u64,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _id: &ControllerId,
            address: &Path,
        ) -> Result<Arc<dyn Connection>, GpuError> {
            let pid = address
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Ok(Arc::new(FakeConnection {
                pid,
                shm_size: self.shm_size,
            }))
        }
    }

    fn settings(tmp: &TempDir, shm_mb: u64) -> PoolSettings {
        PoolSettings {
            binary: None,
            sock_dir: tmp.path().join("sock"),
            lock_dir: tmp.path().join("lock"),
            log_dir: tmp.path().join("log"),
            shm_size: ShmSize::from_mb(shm_mb).unwrap(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            ld_library_path: None,
        }
    }

    /// Publish an address file for a controller "running" as this process.
    fn publish(settings: &PoolSettings, id: &ControllerId) {
        std::fs::create_dir_all(&settings.sock_dir).unwrap();
        std::fs::create_dir_all(&settings.lock_dir).unwrap();
        let socket = settings.sock_dir.join(format!("{}.sock", std::process::id()));
        std::fs::write(
            settings
                .sock_dir
                .join(format!("{}{}{}", ADDRESS_PREFIX, id, ADDRESS_SUFFIX)),
            socket.to_string_lossy().as_bytes(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_sync_discovers_free_controller() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, 100);
        let id = ControllerId::generate();
        publish(&settings, &id);

        let pool = ControllerPool::new(settings, Arc::new(FakeConnector { shm_size: 100 << 20 }));
        pool.sync(&CancellationToken::new(), &[]).await.unwrap();

        let free = pool.list_state(ControllerState::Free);
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].id, id);
    }

    #[tokio::test]
    async fn test_shm_mismatch_is_stale() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, 50);
        publish(&settings, &ControllerId::generate());

        let pool = ControllerPool::new(settings, Arc::new(FakeConnector { shm_size: 100 << 20 }));
        pool.sync(&CancellationToken::new(), &[]).await.unwrap();

        assert_eq!(pool.list_state(ControllerState::Stale).len(), 1);
        assert!(pool.book().is_none());
    }

    #[tokio::test]
    async fn test_book_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, 100);
        publish(&settings, &ControllerId::generate());

        let pool = Arc::new(ControllerPool::new(
            settings,
            Arc::new(FakeConnector { shm_size: 100 << 20 }),
        ));
        pool.sync(&CancellationToken::new(), &[]).await.unwrap();

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            set.spawn(async move { pool.book().is_some() });
        }
        let mut booked = 0;
        while let Some(result) = set.join_next().await {
            if result.unwrap() {
                booked += 1;
            }
        }
        assert_eq!(booked, 1);
        assert_eq!(pool.list_state(ControllerState::Busy).len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, 100);
        let pool = ControllerPool::new(settings.clone(), Arc::new(FakeConnector { shm_size: 0 }));

        let id = ControllerId::generate();
        std::fs::create_dir_all(&settings.lock_dir).unwrap();
        std::fs::write(pool.shm_file(&id), b"").unwrap();

        pool.terminate(&id).await;
        pool.terminate(&id).await;
        assert!(!pool.shm_file(&id).exists());
    }

    #[tokio::test]
    async fn test_spawn_without_binary() {
        let tmp = TempDir::new().unwrap();
        let pool = ControllerPool::new(settings(&tmp, 100), Arc::new(FakeConnector { shm_size: 0 }));
        let err = pool.spawn(&CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, GpuError::BinaryNotFound { .. }));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_stale_controller_not_rediscovered() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, 50);
        let id = ControllerId::generate();
        publish(&settings, &id);

        let pool = ControllerPool::new(
            settings.clone(),
            Arc::new(FakeConnector { shm_size: 100 << 20 }),
        );
        let lifetime = CancellationToken::new();
        pool.sync(&lifetime, &[]).await.unwrap();
        assert_eq!(pool.list_state(ControllerState::Stale).len(), 1);

        // Alive and not spawned here: dropped, not signalled, and skipped.
        pool.sync(&lifetime, &[]).await.unwrap();
        assert!(pool.is_empty());
        pool.sync(&lifetime, &[]).await.unwrap();
        assert!(pool.is_empty());
        assert!(pool.address_file(&id).exists());

        std::fs::remove_file(pool.address_file(&id)).unwrap();
        pool.sync(&lifetime, &[]).await.unwrap();
        assert!(pool.ignored.is_empty());
    }
}
