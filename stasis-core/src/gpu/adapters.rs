// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pipeline steps that bring the GPU pool into an operation.

use std::sync::Arc;

use procfs::process::Process;
use tokio::sync::oneshot;

use super::GpuManager;
use crate::api::{
    DumpRequest, DumpResponse, EngineOptions, RestoreRequest, RestoreResponse, RunRequest,
    RunResponse,
};
use crate::error::{StasisError, StatusKind};
use crate::pipeline::{adapter, Adapter, Handler};
use crate::plugins::GPU_INTERCEPTION;

/// Book a controller for a GPU-enabled run and attach it to the started
/// PID. A failed run releases the controller.
pub fn attach(gpus: Arc<dyn GpuManager>) -> Adapter<RunRequest, RunResponse> {
    adapter(move |next: Handler<RunRequest, RunResponse>| {
        let gpus = gpus.clone();
        Handler::<RunRequest, RunResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let gpus = gpus.clone();
            Box::pin(async move {
                if !req.gpu_enabled {
                    return next.call(opts, req, resp).await;
                }

                let interception = opts
                    .plugins
                    .lookup(&GPU_INTERCEPTION, &req.type_tag)
                    .map_err(|e| {
                        StasisError::from(e)
                            .with_kind(StatusKind::FailedPrecondition)
                            .context("GPU interception")
                    })?;

                let (pid_tx, pid_rx) = oneshot::channel();
                let id = gpus.attach(&opts.lifetime, pid_rx).await?;

                let result = next.with(&[interception]).call(opts, req, resp).await;
                if result.is_ok() {
                    if pid_tx.send(resp.pid).is_err() {
                        tracing::warn!(controller = %id, pid = resp.pid, "GPU attach was abandoned");
                    }
                    resp.messages
                        .push(format!("GPU controller {} attached", id));
                }
                result
            })
        })
    })
}

/// Include the GPU callbacks when the dumped PID has a controller.
pub fn dump(gpus: Arc<dyn GpuManager>) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let gpus = gpus.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |mut opts, req, resp| {
            let next = next.clone();
            let gpus = gpus.clone();
            Box::pin(async move {
                let pid = req.criu.pid;
                if let Some(id) = gpus.controller_for(pid) {
                    opts.callbacks.include(gpus.criu_callback(&id, None)?);
                    exclude_gpu_mounts(pid, &mut req.criu);
                    if let Some(state) = resp.state.as_mut() {
                        state.gpu_enabled = true;
                        state.gpu_controller = Some(id.clone());
                    }
                    tracing::debug!(controller = %id, pid = pid, "GPU dump enabled");
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// For images dumped with a GPU, attach a fresh controller to the restored
/// PID and restore the GPU side alongside the engine.
pub fn restore(gpus: Arc<dyn GpuManager>) -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(move |next: Handler<RestoreRequest, RestoreResponse>| {
        let gpus = gpus.clone();
        Handler::<RestoreRequest, RestoreResponse>::new(move |mut opts, req, resp| {
            let next = next.clone();
            let gpus = gpus.clone();
            Box::pin(async move {
                if !resp.state.as_ref().is_some_and(|s| s.gpu_enabled) {
                    return next.call(opts, req, resp).await;
                }

                let (pid_tx, pid_rx) = oneshot::channel();
                let id = gpus.attach(&opts.lifetime, pid_rx).await?;
                opts.callbacks.include(gpus.criu_callback(&id, Some(pid_tx))?);
                tracing::debug!(controller = %id, "GPU restore enabled");

                let result = next.call(opts, req, resp).await;
                if result.is_ok() {
                    if let Some(state) = resp.state.as_mut() {
                        state.gpu_controller = Some(id);
                    }
                }
                result
            })
        })
    })
}

/// Freeze the GPU before the process is stopped; thaw it again if stopping
/// fails.
pub fn freeze(gpus: Arc<dyn GpuManager>) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let gpus = gpus.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let gpus = gpus.clone();
            Box::pin(async move {
                let pid = req.criu.pid;
                if !gpus.is_attached(pid) {
                    return next.call(opts, req, resp).await;
                }

                let lifetime = opts.lifetime.clone();
                gpus.freeze(&lifetime, pid).await?;
                let result = next.call(opts, req, resp).await;
                if result.is_err() {
                    if let Err(e) = gpus.unfreeze(&lifetime, pid).await {
                        tracing::warn!(pid = pid, error = %e, "Failed to thaw GPU after failed freeze");
                    }
                }
                result
            })
        })
    })
}

pub fn unfreeze(gpus: Arc<dyn GpuManager>) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let gpus = gpus.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let gpus = gpus.clone();
            Box::pin(async move {
                let pid = req.criu.pid;
                if gpus.is_attached(pid) {
                    gpus.unfreeze(&opts.lifetime, pid).await?;
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// GPU device mounts stay outside the image.
fn exclude_gpu_mounts(pid: u32, criu: &mut EngineOptions) {
    let Ok(process) = Process::new(pid as i32) else {
        return;
    };
    let Ok(mounts) = process.mountinfo() else {
        return;
    };
    for mount in mounts {
        let point = mount.mount_point.to_string_lossy().to_string();
        if !point.contains("nvidia") {
            continue;
        }
        let external = format!("mnt[{0}]:{0}", point);
        if !criu.external.contains(&external) {
            criu.external.push(external);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Details, ProcessDetails, ProcessState};
    use crate::engine::NotifyCallback;
    use crate::gpu::HealthReport;
    use crate::pipeline::{ExitSignal, Opts};
    use crate::plugins::PluginRegistry;
    use crate::state::ControllerState;
    use crate::error::StasisResult;
    use crate::types::ControllerId;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    /// Records what the pipeline asked of it.
    #[derive(Default)]
    struct RecordingGpus {
        attached_pid: Mutex<Option<u32>>,
        pending: Mutex<Option<oneshot::Receiver<u32>>>,
        frozen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl GpuManager for RecordingGpus {
        async fn attach(
            &self,
            _lifetime: &CancellationToken,
            pid: oneshot::Receiver<u32>,
        ) -> StasisResult<ControllerId> {
            *self.pending.lock().unwrap() = Some(pid);
            Ok(ControllerId::new("ctl-1").unwrap())
        }

        async fn detach(&self, _pid: u32) -> StasisResult<()> {
            Ok(())
        }

        fn is_attached(&self, pid: u32) -> bool {
            *self.attached_pid.lock().unwrap() == Some(pid)
        }

        fn controller_for(&self, pid: u32) -> Option<ControllerId> {
            self.is_attached(pid)
                .then(|| ControllerId::new("ctl-1").unwrap())
        }

        async fn freeze(&self, _lifetime: &CancellationToken, pid: u32) -> StasisResult<()> {
            self.frozen.lock().unwrap().push(pid);
            Ok(())
        }

        async fn unfreeze(&self, _lifetime: &CancellationToken, pid: u32) -> StasisResult<()> {
            self.frozen.lock().unwrap().retain(|p| *p != pid);
            Ok(())
        }

        fn criu_callback(
            &self,
            _id: &ControllerId,
            _restored: Option<oneshot::Sender<u32>>,
        ) -> StasisResult<NotifyCallback> {
            Ok(NotifyCallback::named("gpu"))
        }

        async fn sync(&self, _lifetime: &CancellationToken) -> StasisResult<()> {
            Ok(())
        }

        async fn check(&self, _lifetime: &CancellationToken) -> StasisResult<HealthReport> {
            Ok(HealthReport::default())
        }

        fn states(&self) -> Vec<(ControllerId, ControllerState)> {
            Vec::new()
        }

        async fn shutdown(&self) {}
    }

    fn opts(plugins: Arc<PluginRegistry>) -> Opts {
        Opts::new(CancellationToken::new(), TaskTracker::new(), plugins)
    }

    fn fake_run(pid: u32, fail: bool) -> Handler<RunRequest, RunResponse> {
        Handler::<RunRequest, RunResponse>::new(move |_opts, req, resp| {
            Box::pin(async move {
                if fail {
                    return Err(StasisError::internal("spawn failed"));
                }
                assert!(req.env.iter().any(|(k, _)| k == "GPU_HOOKED"));
                resp.pid = pid;
                Ok(Some(ExitSignal::exited(0)))
            })
        })
    }

    fn hook() -> Adapter<RunRequest, RunResponse> {
        adapter(|next: Handler<RunRequest, RunResponse>| {
            Handler::<RunRequest, RunResponse>::new(move |opts, req, resp| {
                let next = next.clone();
                Box::pin(async move {
                    req.env.push(("GPU_HOOKED".to_string(), "1".to_string()));
                    next.call(opts, req, resp).await
                })
            })
        })
    }

    fn gpu_run() -> RunRequest {
        RunRequest {
            type_tag: "process".to_string(),
            gpu_enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_attach_sends_started_pid() {
        let plugins = PluginRegistry::new_shared();
        plugins.register(&GPU_INTERCEPTION, "process", hook());
        let gpus = Arc::new(RecordingGpus::default());

        let handler = fake_run(4321, false).with(&[attach(gpus.clone())]);
        let mut req = gpu_run();
        let mut resp = RunResponse::default();
        handler.call(opts(plugins), &mut req, &mut resp).await.unwrap();

        let rx = gpus.pending.lock().unwrap().take().unwrap();
        assert_eq!(rx.await.unwrap(), 4321);
    }

    #[tokio::test]
    async fn test_attach_abandoned_on_failure() {
        let plugins = PluginRegistry::new_shared();
        plugins.register(&GPU_INTERCEPTION, "process", hook());
        let gpus = Arc::new(RecordingGpus::default());

        let handler = fake_run(0, true).with(&[attach(gpus.clone())]);
        let mut req = gpu_run();
        let mut resp = RunResponse::default();
        assert!(handler.call(opts(plugins), &mut req, &mut resp).await.is_err());

        let rx = gpus.pending.lock().unwrap().take().unwrap();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_attach_requires_interception() {
        let gpus = Arc::new(RecordingGpus::default());
        let handler = fake_run(1, false).with(&[attach(gpus.clone())]);
        let mut req = gpu_run();
        let mut resp = RunResponse::default();
        let err = handler
            .call(opts(PluginRegistry::new_shared()), &mut req, &mut resp)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StatusKind::FailedPrecondition);
        assert!(gpus.pending.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dump_marks_state() {
        let gpus = Arc::new(RecordingGpus::default());
        *gpus.attached_pid.lock().unwrap() = Some(std::process::id());

        let handler: Handler<DumpRequest, DumpResponse> = Handler::<DumpRequest, DumpResponse>::new(|opts, _req, _resp| {
            Box::pin(async move {
                assert_eq!(opts.callbacks.len(), 1);
                Ok(None)
            })
        })
        .with(&[dump(gpus)]);

        let mut req = DumpRequest {
            details: Details {
                process: Some(ProcessDetails {
                    pid: std::process::id(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        req.criu.pid = std::process::id();
        let mut resp = DumpResponse {
            state: Some(ProcessState::default()),
            ..Default::default()
        };
        handler
            .call(opts(PluginRegistry::new_shared()), &mut req, &mut resp)
            .await
            .unwrap();

        let state = resp.state.unwrap();
        assert!(state.gpu_enabled);
        assert_eq!(state.gpu_controller.unwrap().as_str(), "ctl-1");
    }

    #[tokio::test]
    async fn test_freeze_thaws_on_failure() {
        let gpus = Arc::new(RecordingGpus::default());
        *gpus.attached_pid.lock().unwrap() = Some(99);

        let handler: Handler<DumpRequest, DumpResponse> = Handler::<DumpRequest, DumpResponse>::new(|_opts, _req, _resp| {
            Box::pin(async move { Err(StasisError::internal("SIGSTOP failed")) })
        })
        .with(&[freeze(gpus.clone())]);

        let mut req = DumpRequest::default();
        req.criu.pid = 99;
        let mut resp = DumpResponse::default();
        assert!(handler
            .call(opts(PluginRegistry::new_shared()), &mut req, &mut resp)
            .await
            .is_err());
        assert!(gpus.frozen.lock().unwrap().is_empty());
    }
}
