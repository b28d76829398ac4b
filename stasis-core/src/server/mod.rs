// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Daemon core: wires the engine, GPU manager, job registry and plugins
//! into the dump, restore, run, freeze and unfreeze pipelines.

mod defaults;

pub use defaults::{
    fill_dump_defaults, fill_type, validate_dump, validate_freeze, validate_restore, validate_run,
};

use std::sync::Arc;
use std::time::Instant;

use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{
    Checkpoint, DumpRequest, DumpResponse, Host, JobRecord, RestoreRequest, RestoreResponse,
    RunRequest, RunResponse, Typed,
};
use crate::config::DaemonConfig;
use crate::engine::{self, CriuBinary, Engine};
use crate::error::StasisResult;
use crate::gpu::{
    self, ControllerPool, GpuManager, HealthReport, MissingManager, PoolManager, PoolSettings,
    SimpleManager, UnixConnector,
};
use crate::job::{self, JobManager};
use crate::metrics;
use crate::pipeline::{dispatch, splice, Handler, Opts};
use crate::plugins::{
    Plugin, PluginRegistry, DUMP_HANDLER, DUMP_MIDDLEWARE, FREEZE_HANDLER, RESTORE_HANDLER,
    RESTORE_MIDDLEWARE, RUN_HANDLER, RUN_MIDDLEWARE, UNFREEZE_HANDLER,
};
use crate::process;
use crate::state::ControllerState;
use crate::storage::{select_dump_storage, select_restore_storage};
use crate::store::{LocalStore, Store};
use crate::types::{ControllerId, JobId};

/// Plugin entry carrying the GPU controller binary and interception library.
const GPU_PLUGIN: &str = "gpu";

/// Everything the daemon core talks to.
pub struct Collaborators {
    pub plugins: Arc<PluginRegistry>,
    pub store: Arc<dyn Store>,
    pub gpus: Arc<dyn GpuManager>,
    pub engine: Option<Arc<dyn Engine>>,
}

struct Pipelines {
    dump: Handler<DumpRequest, DumpResponse>,
    restore: Handler<RestoreRequest, RestoreResponse>,
    run: Handler<RunRequest, RunResponse>,
    freeze: Handler<DumpRequest, DumpResponse>,
    unfreeze: Handler<DumpRequest, DumpResponse>,
}

pub struct Server {
    host: Host,
    plugins: Arc<PluginRegistry>,
    gpus: Arc<dyn GpuManager>,
    jobs: Arc<JobManager>,
    pipelines: Pipelines,
    lifetime: CancellationToken,
    tasks: TaskTracker,
}

impl Server {
    /// Build the daemon core from configuration. Background work runs until
    /// `lifetime` is cancelled or [`Server::shutdown`] is called.
    pub async fn new(config: &DaemonConfig, lifetime: CancellationToken) -> StasisResult<Arc<Self>> {
        let plugins = PluginRegistry::new_shared();
        if let Some(binary) = &config.gpu.controller_binary {
            plugins.install(Plugin {
                name: GPU_PLUGIN.to_string(),
                binaries: vec![binary.clone()],
                libraries: config.gpu.interception_library.iter().cloned().collect(),
                ..Default::default()
            });
        }

        let store: Arc<dyn Store> = Arc::new(LocalStore::open(&config.daemon.state_dir).await?);
        let tasks = TaskTracker::new();

        let gpus: Arc<dyn GpuManager> = match &config.gpu.controller_binary {
            None => {
                tracing::info!("No GPU controller binary configured, GPU support disabled");
                Arc::new(MissingManager)
            }
            Some(_) => {
                let pool = Arc::new(ControllerPool::new(
                    PoolSettings::from_config(&config.gpu),
                    Arc::new(UnixConnector),
                ));
                let simple = SimpleManager::new(pool, &config.gpu, tasks.clone());
                if config.gpu.pool_size == 0 {
                    Arc::new(simple)
                } else {
                    PoolManager::start(
                        simple,
                        config.gpu.pool_size,
                        store.clone(),
                        config.jobs.sync_interval,
                        lifetime.clone(),
                        &tasks,
                    )
                }
            }
        };

        let engine: Option<Arc<dyn Engine>> = match CriuBinary::find(config.criu.binary.as_deref()) {
            Ok(criu) => {
                tracing::info!(path = %criu.path().display(), "Using CRIU");
                Some(Arc::new(criu))
            }
            Err(e) => {
                tracing::warn!(error = %e, "CRIU not found, dump and restore are unavailable");
                None
            }
        };

        Ok(Self::with_collaborators(
            config,
            lifetime,
            tasks,
            Collaborators {
                plugins,
                store,
                gpus,
                engine,
            },
        ))
    }

    /// Build the daemon core around explicit collaborators.
    pub fn with_collaborators(
        config: &DaemonConfig,
        lifetime: CancellationToken,
        tasks: TaskTracker,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let Collaborators {
            plugins,
            store,
            gpus,
            engine,
        } = collaborators;

        process::register(&plugins);
        let host = local_host(config.daemon.host_id.as_deref());
        let jobs = JobManager::start(
            host.clone(),
            &config.jobs,
            plugins.clone(),
            gpus.clone(),
            store,
            lifetime.clone(),
            &tasks,
        );

        let pipelines = Pipelines {
            dump: dispatch(DUMP_HANDLER, DumpRequest::type_tag, Some(engine::dump_handler())).with(&[
                engine::attach_engine(engine.clone()),
                job::manage_dump(jobs.clone()),
                fill_type(),
                fill_dump_defaults(config.checkpoint.dir.clone(), config.criu.leave_running),
                validate_dump(),
                select_dump_storage(),
                splice(DUMP_MIDDLEWARE, DumpRequest::type_tag),
                process::fill_process_state(host.id.clone()),
                process::detect_network_options(),
                gpu::dump(gpus.clone()),
                process::save_process_state(),
                engine::check_dump_options(),
            ]),
            restore: dispatch(
                RESTORE_HANDLER,
                RestoreRequest::type_tag,
                Some(engine::restore_handler()),
            )
            .with(&[
                engine::attach_engine(engine.clone()),
                job::manage_restore(jobs.clone()),
                fill_type(),
                validate_restore(),
                select_restore_storage(),
                process::reload_process_state(),
                process::restore_network_options(),
                gpu::restore(gpus.clone()),
                splice(RESTORE_MIDDLEWARE, RestoreRequest::type_tag),
                engine::check_restore_options(),
            ]),
            run: dispatch(RUN_HANDLER, RunRequest::type_tag, None).with(&[
                job::manage_run(jobs.clone()),
                fill_type(),
                validate_run(),
                gpu::attach(gpus.clone()),
                splice(RUN_MIDDLEWARE, RunRequest::type_tag),
            ]),
            freeze: dispatch(FREEZE_HANDLER, DumpRequest::type_tag, None).with(&[
                job::manage_freeze(jobs.clone()),
                fill_type(),
                validate_freeze(),
                splice(DUMP_MIDDLEWARE, DumpRequest::type_tag),
                process::fill_process_state(host.id.clone()),
                gpu::freeze(gpus.clone()),
            ]),
            unfreeze: dispatch(UNFREEZE_HANDLER, DumpRequest::type_tag, None).with(&[
                job::manage_freeze(jobs.clone()),
                fill_type(),
                validate_freeze(),
                splice(DUMP_MIDDLEWARE, DumpRequest::type_tag),
                process::fill_process_state(host.id.clone()),
                gpu::unfreeze(gpus.clone()),
            ]),
        };

        tracing::info!(host = %host.id, "Daemon core ready");
        Arc::new(Self {
            host,
            plugins,
            gpus,
            jobs,
            pipelines,
            lifetime,
            tasks,
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    fn opts(&self) -> Opts {
        Opts::new(
            self.lifetime.clone(),
            self.tasks.clone(),
            self.plugins.clone(),
        )
    }

    // =========================================================================
    // Orchestrators
    // =========================================================================

    pub async fn dump(&self, mut req: DumpRequest) -> StasisResult<DumpResponse> {
        let mut resp = DumpResponse::default();
        let started = Instant::now();
        let result = self.pipelines.dump.call(self.opts(), &mut req, &mut resp).await;
        observe("dump", started, &result);
        result?;
        tracing::info!(path = %resp.path.display(), size = resp.size, "Dump complete");
        Ok(resp)
    }

    pub async fn restore(&self, mut req: RestoreRequest) -> StasisResult<RestoreResponse> {
        let mut resp = RestoreResponse::default();
        let started = Instant::now();
        let result = self
            .pipelines
            .restore
            .call(self.opts(), &mut req, &mut resp)
            .await;
        observe("restore", started, &result);
        result?;
        tracing::info!(pid = resp.pid, "Restore complete");
        Ok(resp)
    }

    pub async fn run(&self, mut req: RunRequest) -> StasisResult<RunResponse> {
        let mut resp = RunResponse::default();
        let started = Instant::now();
        let result = self.pipelines.run.call(self.opts(), &mut req, &mut resp).await;
        observe("run", started, &result);
        result?;
        tracing::info!(pid = resp.pid, job_id = ?resp.jid, "Run complete");
        Ok(resp)
    }

    pub async fn freeze(&self, mut req: DumpRequest) -> StasisResult<DumpResponse> {
        let mut resp = DumpResponse::default();
        let started = Instant::now();
        let result = self
            .pipelines
            .freeze
            .call(self.opts(), &mut req, &mut resp)
            .await;
        observe("freeze", started, &result);
        result?;
        Ok(resp)
    }

    pub async fn unfreeze(&self, mut req: DumpRequest) -> StasisResult<DumpResponse> {
        let mut resp = DumpResponse::default();
        let started = Instant::now();
        let result = self
            .pipelines
            .unfreeze
            .call(self.opts(), &mut req, &mut resp)
            .await;
        observe("unfreeze", started, &result);
        result?;
        Ok(resp)
    }

    // =========================================================================
    // Jobs and checkpoints
    // =========================================================================

    pub fn get_job(&self, id: &JobId) -> StasisResult<JobRecord> {
        self.jobs.get(id)
    }

    pub fn list_jobs(&self, ids: &[JobId]) -> Vec<JobRecord> {
        self.jobs.list(ids)
    }

    pub fn kill_job(&self, id: &JobId, signal: Option<Signal>) -> StasisResult<()> {
        self.jobs.kill(id, signal)
    }

    pub fn delete_job(&self, id: &JobId) -> StasisResult<()> {
        self.jobs.delete(id)
    }

    pub fn list_checkpoints(&self, jid: &JobId) -> Vec<Checkpoint> {
        self.jobs.list_checkpoints(jid)
    }

    pub fn delete_checkpoint(&self, id: &str) -> StasisResult<()> {
        self.jobs.delete_checkpoint(id)
    }

    // =========================================================================
    // GPU
    // =========================================================================

    /// Spawn a throwaway controller and report what it sees.
    pub async fn gpu_health(&self) -> StasisResult<HealthReport> {
        self.gpus.check(&self.lifetime).await
    }

    pub fn gpu_controllers(&self) -> Vec<(ControllerId, ControllerState)> {
        self.gpus.states()
    }

    /// Stop background work, let managed jobs and the registry flush, then
    /// release GPU controllers.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down daemon core");
        self.lifetime.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.gpus.shutdown().await;
        tracing::info!("Daemon core stopped");
    }
}

fn observe<T>(operation: &str, started: Instant, result: &StasisResult<T>) {
    metrics::observe(operation, started.elapsed().as_secs_f64(), result.is_ok());
    if let Err(e) = result {
        tracing::warn!(operation = operation, error = %e, "Operation failed");
    }
}

/// Host identity: configured id, else the machine id, else the hostname.
fn local_host(configured: Option<&str>) -> Host {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    let id = configured
        .map(str::to_string)
        .or_else(|| {
            std::fs::read_to_string("/etc/machine-id")
                .ok()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
        })
        .unwrap_or_else(|| hostname.clone());
    Host { id, hostname }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_host_id_wins() {
        let host = local_host(Some("node-7"));
        assert_eq!(host.id, "node-7");
        assert!(!host.hostname.is_empty());
    }
}
