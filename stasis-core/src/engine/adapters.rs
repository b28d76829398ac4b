// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pipeline steps that bind an operation to the engine.

use std::sync::Arc;

use super::criu::{read_pidfile, RESTORE_PIDFILE};
use super::{Engine, NotifyCallbackMulti, RestoreIo};
use crate::api::{DumpRequest, DumpResponse, RestoreRequest, RestoreResponse};
use crate::error::{StasisError, StasisResult};
use crate::pipeline::{adapter, Adapter, Handler, Opts};
use crate::process;

/// Oldest engine release the daemon drives (3.16).
pub const MIN_CRIU_VERSION: u32 = 31600;

fn engine_of(opts: &Opts) -> StasisResult<Arc<dyn Engine>> {
    opts.engine
        .clone()
        .ok_or_else(|| StasisError::failed_precondition("engine was not attached to this operation"))
}

/// Outermost step: installs the engine and a fresh callback set.
pub fn attach_engine<Req, Resp>(engine: Option<Arc<dyn Engine>>) -> Adapter<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    adapter(move |next: Handler<Req, Resp>| {
        let engine = engine.clone();
        Handler::<Req, Resp>::new(move |mut opts, req, resp| {
            let next = next.clone();
            let engine = engine.clone();
            Box::pin(async move {
                let engine = engine
                    .ok_or_else(|| StasisError::failed_precondition("CRIU is not installed"))?;

                let version = engine.version().await?;
                if version < MIN_CRIU_VERSION {
                    return Err(crate::error::EngineError::VersionTooOld {
                        found: version,
                        required: MIN_CRIU_VERSION,
                    }
                    .into());
                }

                opts.engine = Some(engine);
                opts.callbacks = NotifyCallbackMulti::default();
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Last dump step: everything the engine needs must be filled by now.
pub fn check_dump_options() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if req.criu.images_dir.as_os_str().is_empty() {
                    return Err(StasisError::failed_precondition(
                        "image directory was not prepared before dump",
                    ));
                }
                if req.criu.pid == 0 {
                    return Err(StasisError::failed_precondition(
                        "PID to dump was not resolved before dump",
                    ));
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Last restore step.
pub fn check_restore_options() -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(|next: Handler<RestoreRequest, RestoreResponse>| {
        Handler::<RestoreRequest, RestoreResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                if req.criu.images_dir.as_os_str().is_empty() {
                    return Err(StasisError::failed_precondition(
                        "image directory was not resolved before restore",
                    ));
                }
                next.call(opts, req, resp).await
            })
        })
    })
}

/// Default dump handler: engine dump of `req.criu`.
pub fn dump_handler() -> Handler<DumpRequest, DumpResponse> {
    Handler::<DumpRequest, DumpResponse>::new(|opts, req, resp| {
        Box::pin(async move {
            let engine = engine_of(&opts)?;
            engine
                .dump(&opts.lifetime, &req.criu, &opts.callbacks)
                .await
                .map_err(|e| e.context("failed to dump"))?;
            resp.path = req.criu.images_dir.clone();
            resp.messages.push(format!("dumped PID {}", req.criu.pid));
            Ok(None)
        })
    })
}

/// Default restore handler: engine restore, then track the restored PID.
///
/// A failed restore reaps whatever process the engine left behind.
pub fn restore_handler() -> Handler<RestoreRequest, RestoreResponse> {
    Handler::<RestoreRequest, RestoreResponse>::new(|opts, req, resp| {
        Box::pin(async move {
            let engine = engine_of(&opts)?;
            let io = RestoreIo { log: req.log.clone() };
            let result = engine
                .restore(&opts.lifetime, &req.criu, &opts.callbacks, io)
                .await;

            let pid = match result {
                Ok(pid) => pid,
                Err(e) => {
                    if let Some(pid) = read_pidfile(&req.criu.images_dir.join(RESTORE_PIDFILE)) {
                        process::reap(pid);
                    }
                    return Err(e.context("failed to restore"));
                }
            };

            resp.pid = pid;
            if let Some(state) = resp.state.as_mut() {
                state.pid = pid;
            }
            resp.messages.push(format!("restored PID {}", pid));

            Ok(Some(process::wait_for_exit(pid, &opts.tasks, &opts.lifetime)))
        })
    })
}
