// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Pipeline steps that tie operations to the job registry.

use std::sync::Arc;

use super::JobManager;
use crate::api::{
    Details, DumpRequest, DumpResponse, JobRecord, RestoreRequest, RestoreResponse, RunAction,
    RunRequest, RunResponse, PROCESS_TYPE,
};
use crate::error::{JobError, StasisError, StasisResult};
use crate::pipeline::{adapter, Adapter, Handler};
use crate::types::JobId;

/// Registers the run as a job, then manages whatever process it yields.
/// The job is removed again when the run fails.
pub fn manage_run(jobs: Arc<JobManager>) -> Adapter<RunRequest, RunResponse> {
    adapter(move |next: Handler<RunRequest, RunResponse>| {
        let jobs = jobs.clone();
        Handler::<RunRequest, RunResponse>::new(move |mut opts, req, resp| {
            let next = next.clone();
            let jobs = jobs.clone();
            Box::pin(async move {
                if req.action == RunAction::Manage {
                    if let Some(existing) = req.details.pid().and_then(|pid| jobs.find(pid)) {
                        return Err(StasisError::failed_precondition(format!(
                            "process {} is already managed by job {}",
                            existing.state.pid, existing.jid
                        )));
                    }
                }

                let jid = req.details.jid.clone().unwrap_or_else(JobId::generate);
                req.details.jid = Some(jid.clone());
                jobs.new_job(jid.clone(), &req.type_tag)?;

                if !req.attachable && req.log.is_none() {
                    match jobs.default_log(&jid) {
                        Ok(log) => req.log = Some(log),
                        Err(e) => {
                            forget(&jobs, &jid);
                            return Err(e);
                        }
                    }
                }

                let lifetime = opts.lifetime.child_token();
                opts.lifetime = lifetime.clone();

                let exited = match next.call(opts, req, resp).await {
                    Ok(Some(exited)) => exited,
                    Ok(None) => {
                        forget(&jobs, &jid);
                        return Err(StasisError::internal(
                            "run handler did not report an exit signal",
                        ));
                    }
                    Err(e) => {
                        forget(&jobs, &jid);
                        return Err(e);
                    }
                };

                let registered = (|| -> StasisResult<()> {
                    jobs.set_type(&jid, &req.type_tag)?;
                    jobs.set_log(&jid, req.log.clone())?;
                    jobs.set_details(&jid, req.details.clone())?;
                    jobs.manage(&lifetime, &jid, resp.pid, exited.clone())
                })();
                if let Err(e) = registered {
                    if req.action == RunAction::Start {
                        lifetime.cancel();
                    }
                    forget(&jobs, &jid);
                    return Err(e.context("failed to manage job"));
                }

                resp.jid = Some(jid);
                Ok(Some(exited))
            })
        })
    })
}

fn forget(jobs: &JobManager, jid: &JobId) {
    if let Err(e) = jobs.delete(jid) {
        tracing::debug!(job_id = %jid, error = %e, "Failed to remove job after failed run");
    }
}

/// Saved job details overlaid with the request, targeting the job's
/// current process unless the request names one.
fn target_details(job: &JobRecord, requested: &Details) -> Details {
    let mut details = requested.merged_over(&job.details);
    let process = details.process.get_or_insert_with(Default::default);
    if process.pid == 0 {
        process.pid = job.state.pid;
    }
    details
}

/// Dumps of a known job: fills the request from the job and records the
/// resulting checkpoint.
pub fn manage_dump(jobs: Arc<JobManager>) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let jobs = jobs.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let jobs = jobs.clone();
            Box::pin(async move {
                let Some(jid) = req.details.jid.clone() else {
                    return next.call(opts, req, resp).await;
                };

                let job = jobs.get(&jid)?;
                if !job.state.is_running {
                    return Err(JobError::NotRunning(jid).into());
                }
                req.type_tag = job.type_tag.clone();
                req.details = target_details(&job, &req.details);

                let exited = next.call(opts, req, resp).await?;

                let checkpoint = jobs.add_checkpoint(&jid, resp.path.clone())?;
                resp.messages
                    .push(format!("checkpoint {} added to job {}", checkpoint.id, jid));
                Ok(exited)
            })
        })
    })
}

/// Restores of a known job, or attachable restores that become a new job.
/// The restored process is managed under the job afterwards.
pub fn manage_restore(jobs: Arc<JobManager>) -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(move |next: Handler<RestoreRequest, RestoreResponse>| {
        let jobs = jobs.clone();
        Handler::<RestoreRequest, RestoreResponse>::new(move |mut opts, req, resp| {
            let next = next.clone();
            let jobs = jobs.clone();
            Box::pin(async move {
                let (jid, created) = match req.details.jid.clone() {
                    Some(jid) => {
                        let job = jobs.get(&jid)?;
                        if job.state.is_running {
                            return Err(JobError::AlreadyRunning(jid).into());
                        }
                        req.type_tag = job.type_tag.clone();
                        req.details = req.details.merged_over(&job.details);
                        if req.path.as_os_str().is_empty() {
                            req.path = jobs.latest_checkpoint(&jid)?.path;
                        }
                        if !req.attachable && req.log.is_none() {
                            req.log = match job.log {
                                Some(log) => Some(log),
                                None => Some(jobs.default_log(&jid)?),
                            };
                        }
                        (jid, false)
                    }
                    None if req.attachable => {
                        if req.type_tag.is_empty() {
                            req.type_tag = PROCESS_TYPE.to_string();
                        }
                        let jid = JobId::generate();
                        jobs.new_job(jid.clone(), &req.type_tag)?;
                        req.details.jid = Some(jid.clone());
                        (jid, true)
                    }
                    None => return next.call(opts, req, resp).await,
                };

                let lifetime = opts.lifetime.child_token();
                opts.lifetime = lifetime.clone();

                let exited = match next.call(opts, req, resp).await {
                    Ok(Some(exited)) => exited,
                    Ok(None) => {
                        if created {
                            forget(&jobs, &jid);
                        }
                        return Err(StasisError::internal(
                            "restore handler did not report an exit signal",
                        ));
                    }
                    Err(e) => {
                        lifetime.cancel();
                        if created {
                            forget(&jobs, &jid);
                        }
                        return Err(e);
                    }
                };

                let managed = (|| -> StasisResult<()> {
                    jobs.set_log(&jid, req.log.clone())?;
                    jobs.set_details(&jid, req.details.clone())?;
                    jobs.manage(&lifetime, &jid, resp.pid, exited.clone())
                })();
                if let Err(e) = managed {
                    lifetime.cancel();
                    if created {
                        forget(&jobs, &jid);
                    }
                    return Err(e.context("failed to manage restored job"));
                }

                resp.messages.push(format!("managing restored job {}", jid));
                Ok(Some(exited))
            })
        })
    })
}

/// Freeze and unfreeze of a known job target the job's process.
pub fn manage_freeze(jobs: Arc<JobManager>) -> Adapter<DumpRequest, DumpResponse> {
    adapter(move |next: Handler<DumpRequest, DumpResponse>| {
        let jobs = jobs.clone();
        Handler::<DumpRequest, DumpResponse>::new(move |opts, req, resp| {
            let next = next.clone();
            let jobs = jobs.clone();
            Box::pin(async move {
                if let Some(jid) = req.details.jid.clone() {
                    let job = jobs.get(&jid)?;
                    if !job.state.is_running {
                        return Err(JobError::NotRunning(jid).into());
                    }
                    req.type_tag = job.type_tag.clone();
                    req.details = target_details(&job, &req.details);
                }
                next.call(opts, req, resp).await
            })
        })
    })
}
