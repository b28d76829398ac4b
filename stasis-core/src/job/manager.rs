// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Job registry.
//!
//! The in-memory map is the source of truth for reads. Every mutation is
//! applied to the map synchronously and then enqueued as a small
//! durability action. One consumer applies actions to the store in order,
//! holding failed ones in a backlog that is retried after a fixed delay.
//! When the channel is full, mutations spill into a single ordered
//! overflow buffer that the consumer drains once the channel is empty.
//! A periodic tick enqueues a reconciliation that imports jobs persisted
//! by another run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::handle::Job;
use crate::api::{Checkpoint, Details, Host, JobRecord};
use crate::config::JobsConfig;
use crate::error::{JobError, StasisError, StasisResult, StoreError};
use crate::gpu::GpuManager;
use crate::metrics;
use crate::pipeline::ExitSignal;
use crate::plugins::{PluginRegistry, CLEANUP, KILL_SIGNAL};
use crate::process;
use crate::storage::dir_size;
use crate::store::Store;
use crate::types::JobId;

/// Capacity of the durability queue before senders spill into the
/// overflow buffer.
const QUEUE_CAPACITY: usize = 64;

/// A durability intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Import jobs and checkpoints persisted elsewhere.
    Initialize,
    PutJob(JobId),
    PutCheckpoint(String),
    DeleteJob(JobId),
    DeleteCheckpoint(String),
    /// Final flush of every job and the host record.
    Shutdown,
}

/// A checkpoint and its insertion order, which breaks timestamp ties.
#[derive(Debug, Clone)]
struct CheckpointEntry {
    seq: u64,
    checkpoint: Checkpoint,
}

pub struct JobManager {
    jobs: DashMap<JobId, Arc<Job>>,
    checkpoints: DashMap<String, CheckpointEntry>,
    sequence: AtomicU64,
    deleted_jobs: DashSet<JobId>,
    deleted_checkpoints: DashSet<String>,
    host: Host,
    log_dir: PathBuf,
    plugins: Arc<PluginRegistry>,
    gpus: Arc<dyn GpuManager>,
    store: Arc<dyn Store>,
    actions: mpsc::Sender<Action>,
    /// Actions newer than everything in the channel. Non-empty only while
    /// the channel has been full.
    overflow: Mutex<VecDeque<Action>>,
    /// Exit trackers. Drained before the final flush.
    tasks: TaskTracker,
}

impl JobManager {
    /// Build the registry and start its durability consumer on `tasks`.
    /// The consumer flushes and exits once `lifetime` is cancelled.
    pub fn start(
        host: Host,
        config: &JobsConfig,
        plugins: Arc<PluginRegistry>,
        gpus: Arc<dyn GpuManager>,
        store: Arc<dyn Store>,
        lifetime: CancellationToken,
        tasks: &TaskTracker,
    ) -> Arc<Self> {
        let (actions, queue) = mpsc::channel(QUEUE_CAPACITY);
        let manager = Arc::new(Self {
            jobs: DashMap::new(),
            checkpoints: DashMap::new(),
            sequence: AtomicU64::new(0),
            deleted_jobs: DashSet::new(),
            deleted_checkpoints: DashSet::new(),
            host,
            log_dir: config.log_dir.clone(),
            plugins,
            gpus,
            store,
            actions,
            overflow: Mutex::new(VecDeque::new()),
            tasks: TaskTracker::new(),
        });

        manager.enqueue(Action::Initialize);
        tasks.spawn(manager.clone().consume(
            queue,
            lifetime,
            config.sync_interval,
            config.retry_interval,
        ));
        manager
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    fn enqueue(&self, action: Action) {
        let mut overflow = match self.overflow.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !overflow.is_empty() {
            // PutJob reads the job at apply time, so repeats collapse.
            if overflow.back() != Some(&action) {
                overflow.push_back(action);
            }
            return;
        }
        match self.actions.try_send(action) {
            Ok(()) => {}
            Err(TrySendError::Full(action)) => {
                tracing::debug!(action = ?action, "Durability queue full, buffering");
                overflow.push_back(action);
            }
            Err(TrySendError::Closed(action)) => {
                tracing::warn!(action = ?action, "Durability queue closed, dropping action");
            }
        }
    }

    fn take_overflow(&self) -> VecDeque<Action> {
        let mut overflow = match self.overflow.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *overflow)
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    fn job(&self, id: &JobId) -> Result<Arc<Job>, JobError> {
        self.jobs
            .get(id)
            .map(|j| j.value().clone())
            .ok_or_else(|| JobError::NotFound(id.clone()))
    }

    /// Refreshed snapshot, with GPU attachment read from the pool.
    fn view(&self, job: &Job) -> JobRecord {
        let mut record = job.refresh(&self.host.id);
        if record.state.is_running {
            if let Some(controller) = self.gpus.controller_for(record.state.pid) {
                record.state.gpu_enabled = true;
                record.state.gpu_controller = Some(controller);
            }
        }
        record
    }

    pub fn new_job(&self, id: JobId, type_tag: &str) -> StasisResult<JobRecord> {
        let job = match self.jobs.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(JobError::AlreadyExists(id).into())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let job = Arc::new(Job::new(id.clone(), type_tag, &self.host.id));
                slot.insert(job.clone());
                job
            }
        };
        self.deleted_jobs.remove(&id);
        self.enqueue(Action::PutJob(id.clone()));
        tracing::debug!(job_id = %id, type_tag = type_tag, "Job created");
        Ok(job.snapshot())
    }

    pub fn get(&self, id: &JobId) -> StasisResult<JobRecord> {
        Ok(self.view(&*self.job(id)?))
    }

    /// Snapshots of `ids`, or of every job when empty. Unknown ids are
    /// skipped.
    pub fn list(&self, ids: &[JobId]) -> Vec<JobRecord> {
        let jobs: Vec<Arc<Job>> = self
            .jobs
            .iter()
            .filter(|e| ids.is_empty() || ids.contains(e.key()))
            .map(|e| e.value().clone())
            .collect();
        let mut records: Vec<JobRecord> = jobs.iter().map(|j| self.view(j)).collect();
        records.sort_by(|a, b| a.jid.cmp(&b.jid));
        records
    }

    /// The running job tracking `pid`, if any.
    pub fn find(&self, pid: u32) -> Option<JobRecord> {
        if pid == 0 {
            return None;
        }
        let candidates: Vec<Arc<Job>> = self
            .jobs
            .iter()
            .filter(|e| e.value().pid() == pid)
            .map(|e| e.value().clone())
            .collect();
        candidates
            .iter()
            .map(|j| self.view(j))
            .find(|r| r.state.is_running)
    }

    pub fn set_log(&self, id: &JobId, log: Option<PathBuf>) -> StasisResult<()> {
        self.job(id)?.set_log(log);
        self.enqueue(Action::PutJob(id.clone()));
        Ok(())
    }

    pub fn set_details(&self, id: &JobId, details: Details) -> StasisResult<()> {
        self.job(id)?.set_details(details);
        self.enqueue(Action::PutJob(id.clone()));
        Ok(())
    }

    pub fn set_type(&self, id: &JobId, type_tag: &str) -> StasisResult<()> {
        self.job(id)?.set_type(type_tag);
        self.enqueue(Action::PutJob(id.clone()));
        Ok(())
    }

    /// Default log file for a job, creating the log directory.
    pub fn default_log(&self, id: &JobId) -> StasisResult<PathBuf> {
        std::fs::create_dir_all(&self.log_dir).map_err(|e| StasisError::Io {
            context: "creating job log directory",
            source: e,
        })?;
        Ok(self.log_dir.join(format!("{}.log", id)))
    }

    /// Track `pid` for job `id` until it exits or `lifetime` ends, in which
    /// case the job is killed first.
    pub fn manage(
        self: &Arc<Self>,
        lifetime: &CancellationToken,
        id: &JobId,
        pid: u32,
        exited: ExitSignal,
    ) -> StasisResult<()> {
        let job = self.job(id)?;
        job.set_pid(pid, &self.host.id);
        if let Some(controller) = self.gpus.controller_for(pid) {
            job.set_gpu(true, Some(controller));
        }
        self.enqueue(Action::PutJob(id.clone()));
        metrics::MANAGED_JOBS.inc();
        tracing::info!(job_id = %id, pid = pid, "Managing job");

        let manager = self.clone();
        let lifetime = lifetime.clone();
        let id = id.clone();
        self.tasks.spawn(async move {
            let code = tokio::select! {
                code = exited.clone().wait() => code,
                _ = lifetime.cancelled() => {
                    tracing::info!(job_id = %id, pid = pid, "Stopping job with the daemon");
                    if let Err(e) = manager.kill(&id, None) {
                        tracing::debug!(job_id = %id, error = %e, "Kill on shutdown failed");
                    }
                    exited.wait().await
                }
            };

            job.mark_done(code);
            tracing::info!(job_id = %id, pid = pid, code = code, "Job exited");

            if manager.gpus.is_attached(pid) {
                if let Err(e) = manager.gpus.detach(pid).await {
                    tracing::warn!(job_id = %id, pid = pid, error = %e, "Failed to detach GPU");
                }
            }

            if let Ok(cleanup) = manager.plugins.lookup(&CLEANUP, &job.type_tag()) {
                if let Err(e) = cleanup(job.snapshot().details).await {
                    tracing::warn!(job_id = %id, error = %e, "Job cleanup failed");
                }
            }

            manager.enqueue(Action::PutJob(id));
            metrics::MANAGED_JOBS.dec();
        });

        Ok(())
    }

    /// Signal a running job, defaulting to its type's kill signal or SIGKILL.
    pub fn kill(&self, id: &JobId, signal: Option<Signal>) -> StasisResult<()> {
        let job = self.job(id)?;
        let record = job.refresh(&self.host.id);
        if !record.state.is_running {
            return Err(JobError::NotRunning(id.clone()).into());
        }

        let signal = signal
            .or_else(|| self.plugins.lookup(&KILL_SIGNAL, &record.type_tag).ok())
            .unwrap_or(Signal::SIGKILL);

        process::signal(record.state.pid, signal).map_err(|e| JobError::Signal {
            jid: id.clone(),
            message: format!("{}: {}", signal, e),
        })?;
        tracing::info!(job_id = %id, pid = record.state.pid, signal = %signal, "Job signalled");
        Ok(())
    }

    /// Remove a job that is not running, with all of its checkpoints.
    pub fn delete(&self, id: &JobId) -> StasisResult<()> {
        let job = self.job(id)?;
        if job.refresh(&self.host.id).state.is_running {
            return Err(JobError::AlreadyRunning(id.clone()).into());
        }

        self.jobs.remove(id);
        self.deleted_jobs.insert(id.clone());
        self.enqueue(Action::DeleteJob(id.clone()));

        let owned: Vec<String> = self
            .checkpoints
            .iter()
            .filter(|c| &c.checkpoint.jid == id)
            .map(|c| c.key().clone())
            .collect();
        for checkpoint in owned {
            self.remove_checkpoint(&checkpoint);
        }

        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    pub fn add_checkpoint(&self, jid: &JobId, path: PathBuf) -> StasisResult<Checkpoint> {
        self.job(jid)?;
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            jid: jid.clone(),
            size: dir_size(&path),
            path,
            time_ms: now_ms(),
        };
        self.insert_checkpoint(checkpoint.clone());
        self.enqueue(Action::PutCheckpoint(checkpoint.id.clone()));
        tracing::info!(job_id = %jid, checkpoint = %checkpoint.id, size = checkpoint.size, "Checkpoint added");
        Ok(checkpoint)
    }

    fn insert_checkpoint(&self, checkpoint: Checkpoint) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.checkpoints
            .insert(checkpoint.id.clone(), CheckpointEntry { seq, checkpoint });
    }

    pub fn get_checkpoint(&self, id: &str) -> StasisResult<Checkpoint> {
        self.checkpoints
            .get(id)
            .map(|c| c.checkpoint.clone())
            .ok_or_else(|| JobError::CheckpointNotFound(id.to_string()).into())
    }

    /// Checkpoints of `jid`, oldest first. Equal timestamps keep the order
    /// in which checkpoints were added.
    pub fn list_checkpoints(&self, jid: &JobId) -> Vec<Checkpoint> {
        let mut entries: Vec<CheckpointEntry> = self
            .checkpoints
            .iter()
            .filter(|c| &c.checkpoint.jid == jid)
            .map(|c| c.value().clone())
            .collect();
        entries.sort_by_key(|e| (e.checkpoint.time_ms, e.seq));
        entries.into_iter().map(|e| e.checkpoint).collect()
    }

    pub fn latest_checkpoint(&self, jid: &JobId) -> StasisResult<Checkpoint> {
        self.list_checkpoints(jid)
            .pop()
            .ok_or_else(|| JobError::NoCheckpoints(jid.clone()).into())
    }

    pub fn delete_checkpoint(&self, id: &str) -> StasisResult<()> {
        if !self.checkpoints.contains_key(id) {
            return Err(JobError::CheckpointNotFound(id.to_string()).into());
        }
        self.remove_checkpoint(id);
        Ok(())
    }

    fn remove_checkpoint(&self, id: &str) {
        self.checkpoints.remove(id);
        self.deleted_checkpoints.insert(id.to_string());
        self.enqueue(Action::DeleteCheckpoint(id.to_string()));
    }

    // =========================================================================
    // Durability
    // =========================================================================

    async fn consume(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Action>,
        lifetime: CancellationToken,
        sync_interval: Duration,
        retry_interval: Duration,
    ) {
        let mut backlog: VecDeque<Action> = VecDeque::new();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + sync_interval,
            sync_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let action = match backlog.pop_front() {
                Some(action) => action,
                None => match queue.try_recv() {
                    Ok(action) => action,
                    Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {
                        let overflow = self.take_overflow();
                        if !overflow.is_empty() {
                            backlog.extend(overflow);
                            continue;
                        }
                        tokio::select! {
                            action = queue.recv() => match action {
                                Some(action) => action,
                                None => break,
                            },
                            _ = ticker.tick() => Action::Initialize,
                            _ = lifetime.cancelled() => break,
                        }
                    }
                },
            };

            if let Err(e) = self.apply(&action).await {
                tracing::warn!(action = ?action, error = %e, "Durability action failed, will retry");
                metrics::DURABILITY_RETRIES.inc();
                backlog.push_front(action);
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = lifetime.cancelled() => break,
                }
            }
        }

        // Let exit trackers observe their jobs ending, keeping the queue
        // drained so none of them blocks on a full channel.
        self.tasks.close();
        loop {
            tokio::select! {
                _ = self.tasks.wait() => break,
                Some(action) = queue.recv() => backlog.push_back(action),
            }
        }
        queue.close();
        while let Ok(action) = queue.try_recv() {
            backlog.push_back(action);
        }
        backlog.extend(self.take_overflow());
        backlog.push_back(Action::Shutdown);

        let pending = backlog.len();
        for action in backlog {
            if let Err(e) = self.apply(&action).await {
                tracing::warn!(action = ?action, error = %e, "Dropping durability action at shutdown");
            }
        }
        tracing::info!(flushed = pending, "Job registry flushed");
    }

    async fn apply(&self, action: &Action) -> Result<(), StoreError> {
        match action {
            Action::Initialize => self.reconcile().await,
            Action::PutJob(id) => {
                let Some(job) = self.jobs.get(id).map(|j| j.value().clone()) else {
                    return Ok(());
                };
                self.store.put_job(&job.refresh(&self.host.id)).await
            }
            Action::PutCheckpoint(id) => {
                let Some(checkpoint) = self.checkpoints.get(id).map(|c| c.checkpoint.clone())
                else {
                    return Ok(());
                };
                self.store.put_checkpoint(&checkpoint).await
            }
            Action::DeleteJob(id) => {
                self.store.delete_job(id).await?;
                if !self.jobs.contains_key(id) {
                    self.deleted_jobs.remove(id);
                }
                Ok(())
            }
            Action::DeleteCheckpoint(id) => {
                self.store.delete_checkpoint(id).await?;
                self.deleted_checkpoints.remove(id);
                Ok(())
            }
            Action::Shutdown => {
                let jobs: Vec<Arc<Job>> = self.jobs.iter().map(|j| j.value().clone()).collect();
                for job in jobs {
                    self.store.put_job(&job.refresh(&self.host.id)).await?;
                }
                self.store.put_host(&self.host).await
            }
        }
    }

    /// Import stored jobs unknown here, or known here but now owned by a
    /// different host, along with their checkpoints.
    async fn reconcile(&self) -> Result<(), StoreError> {
        self.store.put_host(&self.host).await?;

        let stored = self.store.list_jobs(&[]).await?;
        let mut imported = Vec::new();
        for record in stored {
            if self.deleted_jobs.contains(&record.jid) {
                continue;
            }
            let moved = !record.state.host.is_empty() && record.state.host != self.host.id;
            match self.jobs.entry(record.jid.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                    if moved && slot.get().snapshot().state.host != record.state.host {
                        imported.push(record.jid.clone());
                        slot.insert(Arc::new(Job::from_record(record)));
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    imported.push(record.jid.clone());
                    slot.insert(Arc::new(Job::from_record(record)));
                }
            }
        }

        if imported.is_empty() {
            return Ok(());
        }

        for checkpoint in self.store.list_checkpoints(&imported).await? {
            if self.deleted_checkpoints.contains(&checkpoint.id) {
                continue;
            }
            if !self.checkpoints.contains_key(&checkpoint.id) {
                self.insert_checkpoint(checkpoint);
            }
        }

        tracing::info!(imported = imported.len(), "Imported jobs from store");
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::MissingManager;
    use crate::state::JobStatus;
    use crate::api::ControllerRecord;
    use crate::store::MemoryStore;
    use crate::types::ControllerId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    /// Memory store whose writes fail while `down` is set.
    struct OutageStore {
        inner: Arc<MemoryStore>,
        down: AtomicBool,
    }

    impl OutageStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable {
                    reason: "store offline".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for OutageStore {
        async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put_job(job).await
        }

        async fn list_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.list_jobs(ids).await
        }

        async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_job(id).await
        }

        async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put_checkpoint(checkpoint).await
        }

        async fn list_checkpoints(&self, jids: &[JobId]) -> Result<Vec<Checkpoint>, StoreError> {
            self.inner.list_checkpoints(jids).await
        }

        async fn delete_checkpoint(&self, id: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_checkpoint(id).await
        }

        async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put_host(host).await
        }

        async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
            self.inner.list_hosts().await
        }

        async fn put_controller(&self, record: &ControllerRecord) -> Result<(), StoreError> {
            self.check()?;
            self.inner.put_controller(record).await
        }

        async fn list_controllers(&self) -> Result<Vec<ControllerRecord>, StoreError> {
            self.inner.list_controllers().await
        }

        async fn delete_controller(&self, id: &ControllerId) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_controller(id).await
        }
    }

    fn config(tmp: &TempDir) -> JobsConfig {
        JobsConfig {
            log_dir: tmp.path().join("logs"),
            sync_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_millis(10),
        }
    }

    fn host() -> Host {
        Host {
            id: "host-a".to_string(),
            hostname: "a".to_string(),
        }
    }

    fn start(tmp: &TempDir, store: Arc<dyn Store>) -> (Arc<JobManager>, CancellationToken, TaskTracker) {
        let lifetime = CancellationToken::new();
        let tasks = TaskTracker::new();
        let manager = JobManager::start(
            host(),
            &config(tmp),
            PluginRegistry::new_shared(),
            Arc::new(MissingManager),
            store,
            lifetime.clone(),
            &tasks,
        );
        (manager, lifetime, tasks)
    }

    fn jid(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_duplicates() {
        let tmp = TempDir::new().unwrap();
        let (jobs, _, _) = start(&tmp, MemoryStore::new_shared());
        jobs.new_job(jid("j1"), "process").unwrap();
        let err = jobs.new_job(jid("j1"), "process").unwrap_err();
        assert!(matches!(err, StasisError::Job(JobError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_kill_not_running() {
        let tmp = TempDir::new().unwrap();
        let (jobs, _, _) = start(&tmp, MemoryStore::new_shared());
        jobs.new_job(jid("j1"), "process").unwrap();
        let err = jobs.kill(&jid("j1"), None).unwrap_err();
        assert!(matches!(err, StasisError::Job(JobError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_manage_marks_done() {
        let tmp = TempDir::new().unwrap();
        let (jobs, lifetime, _) = start(&tmp, MemoryStore::new_shared());
        jobs.new_job(jid("j1"), "process").unwrap();

        let (tx, exited) = ExitSignal::channel();
        jobs.manage(&lifetime, &jid("j1"), std::process::id(), exited)
            .unwrap();
        assert!(jobs.get(&jid("j1")).unwrap().state.is_running);

        tx.send(3);
        tokio::time::timeout(Duration::from_secs(5), async {
            while jobs.get(&jid("j1")).unwrap().state.is_running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let record = jobs.get(&jid("j1")).unwrap();
        assert_eq!(record.state.status, JobStatus::Done);
        assert_eq!(record.state.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_checkpoints_latest_and_cascade() {
        let tmp = TempDir::new().unwrap();
        let (jobs, _, _) = start(&tmp, MemoryStore::new_shared());
        jobs.new_job(jid("j1"), "process").unwrap();

        assert!(jobs.latest_checkpoint(&jid("j1")).is_err());
        let first = jobs.add_checkpoint(&jid("j1"), tmp.path().join("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = jobs.add_checkpoint(&jid("j1"), tmp.path().join("b")).unwrap();

        assert_eq!(jobs.latest_checkpoint(&jid("j1")).unwrap().id, second.id);
        assert_eq!(jobs.list_checkpoints(&jid("j1")).len(), 2);

        jobs.delete_checkpoint(&second.id).unwrap();
        assert_eq!(jobs.latest_checkpoint(&jid("j1")).unwrap().id, first.id);

        jobs.delete(&jid("j1")).unwrap();
        assert!(jobs.get_checkpoint(&first.id).is_err());
        assert!(jobs.get(&jid("j1")).is_err());
    }

    #[tokio::test]
    async fn test_store_reflects_mutations() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new_shared();
        let (jobs, _, _) = start(&tmp, store.clone());
        jobs.new_job(jid("j1"), "process").unwrap();
        jobs.set_log(&jid("j1"), Some(PathBuf::from("/tmp/j1.log")))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stored = store.list_jobs(&[jid("j1")]).await.unwrap();
                if stored.first().and_then(|j| j.log.clone()) == Some(PathBuf::from("/tmp/j1.log")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_imports_foreign_jobs() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new_shared();
        store
            .put_job(&JobRecord {
                jid: jid("from-before"),
                type_tag: "process".to_string(),
                state: Default::default(),
                details: Default::default(),
                log: None,
            })
            .await
            .unwrap();

        let (jobs, _, _) = start(&tmp, store);
        tokio::time::timeout(Duration::from_secs(5), async {
            while jobs.get(&jid("from-before")).is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new_shared();
        let (jobs, lifetime, tasks) = start(&tmp, store.clone());
        jobs.new_job(jid("j1"), "process").unwrap();
        jobs.new_job(jid("j2"), "process").unwrap();

        lifetime.cancel();
        tasks.close();
        tasks.wait().await;

        assert_eq!(store.list_jobs(&[]).await.unwrap().len(), 2);
        assert_eq!(store.list_hosts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_checkpoint_breaks_ties_by_insertion() {
        let tmp = TempDir::new().unwrap();
        let (jobs, _, _) = start(&tmp, MemoryStore::new_shared());
        jobs.new_job(jid("j1"), "process").unwrap();

        for i in 0..100 {
            jobs.add_checkpoint(&jid("j1"), tmp.path().join(format!("a{}", i)))
                .unwrap();
            let newer = jobs
                .add_checkpoint(&jid("j1"), tmp.path().join(format!("b{}", i)))
                .unwrap();
            assert_eq!(jobs.latest_checkpoint(&jid("j1")).unwrap().id, newer.id);
        }

        let listed = jobs.list_checkpoints(&jid("j1"));
        assert_eq!(listed.len(), 200);
        assert_eq!(listed[0].path, tmp.path().join("a0"));
        assert_eq!(listed[199].path, tmp.path().join("b99"));
    }

    #[tokio::test]
    async fn test_mutations_during_outage_all_land() {
        let tmp = TempDir::new().unwrap();
        let memory = MemoryStore::new_shared();
        let store = Arc::new(OutageStore {
            inner: memory.clone(),
            down: AtomicBool::new(true),
        });
        let (jobs, _, _) = start(&tmp, store.clone());

        for i in 0..(QUEUE_CAPACITY * 3) {
            jobs.new_job(jid(&format!("job-{}", i)), "process").unwrap();
        }
        assert!(memory.list_jobs(&[]).await.unwrap().is_empty());
        assert!(!jobs.overflow.lock().unwrap().is_empty());

        store.down.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(10), async {
            while memory.list_jobs(&[]).await.unwrap().len() < QUEUE_CAPACITY * 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(jobs.overflow.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_cleared_once_delete_lands() {
        let tmp = TempDir::new().unwrap();
        let memory = MemoryStore::new_shared();
        let (jobs, _, _) = start(&tmp, memory.clone());
        jobs.new_job(jid("j1"), "process").unwrap();
        let checkpoint = jobs.add_checkpoint(&jid("j1"), tmp.path().join("a")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while memory.list_checkpoints(&[jid("j1")]).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        jobs.delete(&jid("j1")).unwrap();
        assert!(jobs.deleted_jobs.contains(&jid("j1")));
        assert!(jobs.deleted_checkpoints.contains(&checkpoint.id));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !jobs.deleted_jobs.is_empty() || !jobs.deleted_checkpoints.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(memory.list_jobs(&[]).await.unwrap().is_empty());
        assert!(memory.list_checkpoints(&[jid("j1")]).await.unwrap().is_empty());
    }
}
