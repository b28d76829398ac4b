// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Built-in `process` workload type and the process-state steps shared by
//! every type.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use nix::sys::signal::Signal;

use super::{has_established_tcp, inspect, wait_for_exit};
use crate::api::{
    DumpRequest, DumpResponse, ProcessState, RestoreRequest, RestoreResponse, RunAction,
    RunRequest, RunResponse, PROCESS_TYPE,
};
use crate::error::{StasisError, StasisResult};
use crate::pipeline::{adapter, Adapter, ExitSignal, Handler, Opts, Outcome, UNKNOWN_EXIT_CODE};
use crate::plugins::{
    PluginRegistry, DUMP_MIDDLEWARE, FREEZE_HANDLER, GPU_INTERCEPTION, RESTORE_MIDDLEWARE,
    RUN_HANDLER, RUN_MIDDLEWARE, UNFREEZE_HANDLER,
};
use crate::state::JobStatus;

/// Process state saved next to the engine images.
pub const PROCESS_STATE_FILE: &str = "process_state.json";

/// Plugin name whose libraries provide GPU call interception.
const GPU_PLUGIN: &str = "gpu";

/// Export the `process` type's features, the same way a plugin would.
pub fn register(plugins: &PluginRegistry) {
    plugins.register(
        &DUMP_MIDDLEWARE,
        PROCESS_TYPE,
        vec![set_pid_for_dump(), detect_shell_job()],
    );
    plugins.register(&RESTORE_MIDDLEWARE, PROCESS_TYPE, Vec::new());
    plugins.register(&RUN_MIDDLEWARE, PROCESS_TYPE, Vec::new());
    plugins.register(&RUN_HANDLER, PROCESS_TYPE, run_handler());
    plugins.register(&FREEZE_HANDLER, PROCESS_TYPE, signal_handler(Signal::SIGSTOP));
    plugins.register(&UNFREEZE_HANDLER, PROCESS_TYPE, signal_handler(Signal::SIGCONT));
    plugins.register(&GPU_INTERCEPTION, PROCESS_TYPE, gpu_interception());
}

fn set_pid_for_dump() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let pid = req
                    .details
                    .pid()
                    .ok_or_else(|| StasisError::invalid_argument("missing PID for process dump"))?;
                req.criu.pid = pid;
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Processes outside their own session are restored as shell jobs.
fn detect_shell_job() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if let Some(live) = inspect(req.criu.pid) {
                    if live.sid != live.pid && !req.criu.shell_job {
                        tracing::debug!(pid = live.pid, sid = live.sid, "Dumping as shell job");
                        req.criu.shell_job = true;
                    }
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Capture the live state of `req.criu.pid` into the response.
pub fn fill_process_state(host: String) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let host = host.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let host = host.clone();
            Box::pin(async move {
                let pid = req.criu.pid;
                let live = inspect(pid).ok_or_else(|| {
                    StasisError::not_found(format!("process {} is not running", pid))
                })?;

                resp.state = Some(ProcessState {
                    pid,
                    is_running: true,
                    status: JobStatus::Running,
                    host,
                    cmdline: live.cmdline,
                    cwd: live.cwd,
                    uid: live.uid,
                    gid: live.gid,
                    sid: live.sid,
                    ..Default::default()
                });

                next.call(opts, req, resp).await
            })
        })
    })
}

/// Write the captured state into the image directory before dumping.
pub fn save_process_state() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let state = resp.state.as_ref().ok_or_else(|| {
                    StasisError::failed_precondition("process state was not captured")
                })?;
                write_state(&req.criu.images_dir.join(PROCESS_STATE_FILE), state)?;
                next.call(opts, req, resp).await
            })
        })
    })
}

fn write_state(path: &std::path::Path, state: &ProcessState) -> StasisResult<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| StasisError::internal(format!("encoding process state: {}", e)))?;
    std::fs::write(path, json).map_err(|e| StasisError::Io {
        context: "writing process state",
        source: e,
    })
}

/// Load the state saved at dump time, when the image carries one.
pub fn reload_process_state() -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(|next: Handler<RestoreRequest, RestoreResponse>| {
        Handler::<RestoreRequest, RestoreResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let path = req.criu.images_dir.join(PROCESS_STATE_FILE);
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        let state: ProcessState = serde_json::from_slice(&bytes).map_err(|e| {
                            StasisError::failed_precondition(format!(
                                "corrupt process state {}: {}",
                                path.display(),
                                e
                            ))
                        })?;
                        resp.state = Some(state);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::debug!(path = %path.display(), "Image carries no process state");
                    }
                    Err(e) => {
                        return Err(StasisError::Io {
                            context: "reading process state",
                            source: e,
                        })
                    }
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

pub fn detect_network_options() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if has_established_tcp(req.criu.pid) {
                    req.criu.tcp_established = true;
                    if let Some(state) = resp.state.as_mut() {
                        state.open_tcp = true;
                    }
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

pub fn restore_network_options() -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(|next: Handler<RestoreRequest, RestoreResponse>| {
        Handler::<RestoreRequest, RestoreResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if resp.state.as_ref().is_some_and(|s| s.open_tcp) {
                    req.criu.tcp_established = true;
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

fn run_handler() -> Handler<RunRequest, RunResponse> {
    Handler::<RunRequest, RunResponse>::new(|opts, req, resp| {
        Box::pin(async move {
            match req.action {
                RunAction::Start => start(&opts, req, resp),
                RunAction::Manage => adopt(&opts, req, resp),
            }
        })
    })
}

fn start(opts: &Opts, req: &RunRequest, resp: &mut RunResponse) -> Outcome {
    let details = req
        .details
        .process
        .as_ref()
        .filter(|p| !p.program.is_empty())
        .ok_or_else(|| StasisError::invalid_argument("missing program to run"))?;

    let mut command = tokio::process::Command::new(&details.program);
    command
        .args(&details.args)
        .envs(req.env.iter().cloned())
        .process_group(0)
        .stdin(Stdio::null());
    if let Some(dir) = &req.working_dir {
        command.current_dir(dir);
    }
    match &req.log {
        Some(log) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .map_err(|e| StasisError::Io {
                    context: "opening job log",
                    source: e,
                })?;
            let stderr = file.try_clone().map_err(|e| StasisError::Io {
                context: "duplicating job log",
                source: e,
            })?;
            command.stdout(file).stderr(stderr);
        }
        None => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    let mut child = command.spawn().map_err(|e| {
        StasisError::invalid_argument(format!("failed to start {}: {}", details.program, e))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| StasisError::internal("started process has no PID"))?;

    let (tx, exited) = ExitSignal::channel();
    opts.tasks.spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status
                .code()
                .or_else(|| status.signal().map(|s| 128 + s))
                .unwrap_or(UNKNOWN_EXIT_CODE),
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "Failed to wait for process");
                UNKNOWN_EXIT_CODE
            }
        };
        tx.send(code);
    });

    tracing::info!(pid = pid, program = %details.program, "Process started");
    resp.pid = pid;
    Ok(Some(exited))
}

fn adopt(opts: &Opts, req: &RunRequest, resp: &mut RunResponse) -> Outcome {
    let pid = req
        .details
        .pid()
        .ok_or_else(|| StasisError::invalid_argument("missing PID to manage"))?;
    if inspect(pid).is_none() {
        return Err(StasisError::not_found(format!("process {} is not running", pid)));
    }
    resp.pid = pid;
    Ok(Some(wait_for_exit(pid, &opts.tasks, &opts.lifetime)))
}

fn signal_handler(signal: Signal) -> Handler<DumpRequest, DumpResponse> {
    Handler::<DumpRequest, DumpResponse>::new(move |_opts, req, resp| {
        Box::pin(async move {
            let pid = req.criu.pid;
            super::signal(pid, signal).map_err(|e| StasisError::Syscall {
                syscall: "kill",
                message: format!("{} to {}: {}", signal, pid, e),
            })?;
            resp.messages.push(format!("sent {} to PID {}", signal, pid));
            Ok(None)
        })
    })
}

/// Preload the GPU interception library into the process.
fn gpu_interception() -> Adapter<RunRequest, RunResponse> {
    adapter(|next: Handler<RunRequest, RunResponse>| {
        Handler::<RunRequest, RunResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let library = opts
                    .plugins
                    .get(GPU_PLUGIN)
                    .and_then(|p| p.libraries.first().cloned())
                    .ok_or_else(|| {
                        StasisError::failed_precondition("GPU interception library is not installed")
                    })?;
                req.env.push((
                    "LD_PRELOAD".to_string(),
                    library.to_string_lossy().to_string(),
                ));
                next.call(opts, req, resp).await
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Details, ProcessDetails};
    use crate::pipeline::dispatch;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn opts() -> Opts {
        let plugins = PluginRegistry::new_shared();
        register(&plugins);
        Opts::new(CancellationToken::new(), TaskTracker::new(), plugins)
    }

    fn run_request(program: &str, args: &[&str]) -> RunRequest {
        RunRequest {
            type_tag: PROCESS_TYPE.to_string(),
            details: Details {
                process: Some(ProcessDetails {
                    program: program.to_string(),
                    args: args.iter().map(|a| a.to_string()).collect(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn type_of(req: &RunRequest) -> &str {
        &req.type_tag
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let handler = dispatch(RUN_HANDLER, type_of, None);
        let mut req = run_request("sh", &["-c", "exit 3"]);
        let mut resp = RunResponse::default();

        let exited = handler.call(opts(), &mut req, &mut resp).await.unwrap();
        assert!(resp.pid > 0);
        assert_eq!(exited.unwrap().wait().await, 3);
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let handler = dispatch(RUN_HANDLER, type_of, None);
        let mut req = run_request("", &[]);
        let err = handler
            .call(opts(), &mut req, &mut RunResponse::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::StatusKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_gpu_interception_requires_library() {
        let opts = opts();
        let interception = opts.plugins.lookup(&GPU_INTERCEPTION, PROCESS_TYPE).unwrap();
        let handler = Handler::<RunRequest, RunResponse>::new(|_opts, req, _resp| {
            Box::pin(async move {
                assert!(req.env.iter().any(|(k, _)| k == "LD_PRELOAD"));
                Ok(None)
            })
        })
        .with(&[interception]);

        let mut req = run_request("true", &[]);
        assert!(handler
            .call(opts.clone(), &mut req, &mut RunResponse::default())
            .await
            .is_err());

        opts.plugins.install(crate::plugins::Plugin {
            name: GPU_PLUGIN.to_string(),
            libraries: vec!["/usr/lib/libstasis-gpu.so".into()],
            ..Default::default()
        });
        handler
            .call(opts, &mut req, &mut RunResponse::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_roundtrip_through_image_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = ProcessState {
            pid: 42,
            gpu_enabled: true,
            open_tcp: true,
            ..Default::default()
        };
        write_state(&tmp.path().join(PROCESS_STATE_FILE), &state).unwrap();

        let handler = Handler::<RestoreRequest, RestoreResponse>::new(|_opts, req, resp| {
            Box::pin(async move {
                assert!(req.criu.tcp_established);
                assert!(resp.state.as_ref().unwrap().gpu_enabled);
                Ok(None)
            })
        })
        .with(&[reload_process_state(), restore_network_options()]);

        let mut req = RestoreRequest::default();
        req.criu.images_dir = tmp.path().to_path_buf();
        let mut resp = RestoreResponse::default();
        handler.call(opts(), &mut req, &mut resp).await.unwrap();
        assert_eq!(resp.state.unwrap().pid, 42);
    }
}
