// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Request defaults and validation steps.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::api::{
    DumpRequest, DumpResponse, RestoreRequest, RestoreResponse, RunAction, RunRequest,
    RunResponse, Typed, PROCESS_TYPE,
};
use crate::error::StasisError;
use crate::pipeline::{adapter, Adapter, Handler};

/// Fill the workload type when the request leaves it empty.
pub fn fill_type<Req, Resp>() -> Adapter<Req, Resp>
where
    Req: Typed + Send + 'static,
    Resp: Send + 'static,
{
    adapter(|next: Handler<Req, Resp>| {
        Handler::<Req, Resp>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let type_tag = req.type_tag_mut();
                if type_tag.is_empty() {
                    *type_tag = PROCESS_TYPE.to_string();
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Dump directory, image name and engine defaults.
pub fn fill_dump_defaults(
    checkpoint_dir: PathBuf,
    leave_running: bool,
) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let checkpoint_dir = checkpoint_dir.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let checkpoint_dir = checkpoint_dir.clone();
            Box::pin(async move {
                if req.dir.is_empty() {
                    req.dir = checkpoint_dir.to_string_lossy().to_string();
                }
                if req.name.is_empty() {
                    req.name = image_name(req);
                }
                req.criu.leave_running |= leave_running;
                next.call(opts, req, resp).await
            })
        })
    })
}

fn image_name(req: &DumpRequest) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    match &req.details.jid {
        Some(jid) => format!("dump-{}-{}-{}", req.type_tag, jid, now),
        None => format!("dump-{}-{}", req.type_tag, now),
    }
}

pub fn validate_dump() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if req.dir.is_empty() {
                    return Err(StasisError::invalid_argument("missing dump directory"));
                }
                if req.name.contains('/') || req.name == "." || req.name == ".." {
                    return Err(StasisError::invalid_argument(format!(
                        "invalid image name '{}'",
                        req.name
                    )));
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

pub fn validate_restore() -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(|next: Handler<RestoreRequest, RestoreResponse>| {
        Handler::<RestoreRequest, RestoreResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if req.path.as_os_str().is_empty() {
                    return Err(StasisError::invalid_argument("missing image path"));
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

pub fn validate_run() -> Adapter<RunRequest, RunResponse> {
    adapter(|next: Handler<RunRequest, RunResponse>| {
        Handler::<RunRequest, RunResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if req.action == RunAction::Manage && req.gpu_enabled {
                    return Err(StasisError::invalid_argument(
                        "GPU support cannot be added to an already running process",
                    ));
                }
                if req.attachable && req.log.is_some() {
                    return Err(StasisError::invalid_argument(
                        "attachable runs do not write a log file",
                    ));
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Freeze and unfreeze need a target: a job or a PID.
pub fn validate_freeze() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if req.details.jid.is_none() && req.details.pid().is_none() {
                    return Err(StasisError::invalid_argument(
                        "missing job or PID to freeze",
                    ));
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusKind;
    use crate::pipeline::Opts;
    use crate::plugins::PluginRegistry;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn opts() -> Opts {
        Opts::new(
            CancellationToken::new(),
            TaskTracker::new(),
            PluginRegistry::new_shared(),
        )
    }

    fn accept<Req: Send + 'static, Resp: Send + 'static>() -> Handler<Req, Resp> {
        Handler::<Req, Resp>::new(|_opts, _req, _resp| Box::pin(async move { Ok(None) }))
    }

    #[tokio::test]
    async fn test_dump_defaults() {
        let handler = accept::<DumpRequest, DumpResponse>().with(&[
            fill_type(),
            fill_dump_defaults(PathBuf::from("/var/lib/stasis/checkpoints"), true),
            validate_dump(),
        ]);
        let mut req = DumpRequest::default();
        handler
            .call(opts(), &mut req, &mut DumpResponse::default())
            .await
            .unwrap();

        assert_eq!(req.type_tag, PROCESS_TYPE);
        assert_eq!(req.dir, "/var/lib/stasis/checkpoints");
        assert!(req.name.starts_with("dump-process-"));
        assert!(req.criu.leave_running);
    }

    #[tokio::test]
    async fn test_back_to_back_dumps_get_distinct_images() {
        let tmp = tempfile::TempDir::new().unwrap();
        let handler = accept::<DumpRequest, DumpResponse>().with(&[
            fill_type(),
            fill_dump_defaults(tmp.path().to_path_buf(), false),
            crate::storage::select_dump_storage(),
        ]);

        let mut paths = Vec::new();
        for _ in 0..2 {
            let mut req = DumpRequest {
                details: crate::api::Details {
                    jid: Some(crate::types::JobId::new("j1").unwrap()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let mut resp = DumpResponse::default();
            handler.call(opts(), &mut req, &mut resp).await.unwrap();
            assert!(req.name.starts_with("dump-process-j1-"));
            paths.push(resp.path);
        }

        assert_ne!(paths[0], paths[1]);
        assert!(paths.iter().all(|p| p.is_dir()));
    }

    #[tokio::test]
    async fn test_invalid_image_name() {
        let handler = accept::<DumpRequest, DumpResponse>().with(&[validate_dump()]);
        let mut req = DumpRequest {
            dir: "/tmp".to_string(),
            name: "../escape".to_string(),
            ..Default::default()
        };
        let err = handler
            .call(opts(), &mut req, &mut DumpResponse::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StatusKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_restore_requires_path() {
        let handler = accept::<RestoreRequest, RestoreResponse>().with(&[validate_restore()]);
        let err = handler
            .call(
                opts(),
                &mut RestoreRequest::default(),
                &mut RestoreResponse::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StatusKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_freeze_requires_target() {
        let handler = accept::<DumpRequest, DumpResponse>().with(&[validate_freeze()]);
        let err = handler
            .call(opts(), &mut DumpRequest::default(), &mut DumpResponse::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StatusKind::InvalidArgument);
    }
}
