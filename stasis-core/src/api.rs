// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Request/response schemas and persisted records.
//!
//! Requests and responses are threaded mutably through a pipeline so that
//! later steps observe what earlier steps decided. Records are what the
//! backing store persists.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::JobStatus;
use crate::types::{ControllerId, JobId};

/// Workload type handled by the built-in process implementation.
pub const PROCESS_TYPE: &str = "process";

/// Point-in-time description of a workload's process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: u32,
    pub is_running: bool,
    pub status: JobStatus,
    /// Identity of the host the process was last seen on.
    pub host: String,
    pub cmdline: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub sid: u32,
    #[serde(default)]
    pub open_tcp: bool,
    #[serde(default)]
    pub gpu_enabled: bool,
    #[serde(default)]
    pub gpu_controller: Option<ControllerId>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Parameters of the built-in process workload type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessDetails {
    /// PID of an existing process (dump, freeze, manage).
    #[serde(default)]
    pub pid: u32,
    /// Program to start (run).
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Type-specific detail payload carried by every request and job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Details {
    #[serde(default)]
    pub jid: Option<JobId>,
    #[serde(default)]
    pub process: Option<ProcessDetails>,
    /// Opaque payload for runtime plugins.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Details {
    /// Overlay `self` on top of `base`: fields set here win, extras merge.
    pub fn merged_over(&self, base: &Details) -> Details {
        let mut extra = base.extra.clone();
        extra.extend(self.extra.clone());
        Details {
            jid: self.jid.clone().or_else(|| base.jid.clone()),
            process: self.process.clone().or_else(|| base.process.clone()),
            extra,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid).filter(|pid| *pid != 0)
    }
}

/// Options forwarded to the checkpoint/restore engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default)]
    pub images_dir: PathBuf,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub leave_running: bool,
    #[serde(default)]
    pub shell_job: bool,
    #[serde(default)]
    pub tcp_established: bool,
    #[serde(default)]
    pub file_locks: bool,
    /// External resources (mounts, devices) left out of the image.
    #[serde(default)]
    pub external: Vec<String>,
}

/// Dump request. Freeze and unfreeze reuse it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpRequest {
    #[serde(default, rename = "type")]
    pub type_tag: String,
    /// Parent directory for the image directory.
    #[serde(default)]
    pub dir: String,
    /// Image directory name; generated when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub details: Details,
    #[serde(default)]
    pub criu: EngineOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpResponse {
    pub path: PathBuf,
    pub size: u64,
    pub state: Option<ProcessState>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default, rename = "type")]
    pub type_tag: String,
    /// Image directory; the job's latest checkpoint when empty.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub details: Details,
    #[serde(default)]
    pub criu: EngineOptions,
    /// Keep managing the restored process as a job even without a JID.
    #[serde(default)]
    pub attachable: bool,
    #[serde(default)]
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub pid: u32,
    pub state: Option<ProcessState>,
    pub messages: Vec<String>,
}

/// How a run request obtains its process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    /// Start a new process.
    #[default]
    Start,
    /// Adopt an already running process.
    Manage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default, rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub action: RunAction,
    #[serde(default)]
    pub details: Details,
    #[serde(default)]
    pub gpu_enabled: bool,
    #[serde(default)]
    pub attachable: bool,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub pid: u32,
    pub jid: Option<JobId>,
    pub messages: Vec<String>,
}

/// Requests that carry a workload type tag.
pub trait Typed {
    fn type_tag(&self) -> &str;
    fn type_tag_mut(&mut self) -> &mut String;
}

macro_rules! impl_typed {
    ($($request:ty),*) => {
        $(impl Typed for $request {
            fn type_tag(&self) -> &str {
                &self.type_tag
            }

            fn type_tag_mut(&mut self) -> &mut String {
                &mut self.type_tag
            }
        })*
    };
}

impl_typed!(DumpRequest, RestoreRequest, RunRequest);

/// Persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: JobId,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub state: ProcessState,
    #[serde(default)]
    pub details: Details,
    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Persisted checkpoint record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub jid: JobId,
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub time_ms: u64,
    pub size: u64,
}

/// Persisted host record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub hostname: String,
}

/// Persisted GPU controller record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub id: ControllerId,
    pub address: PathBuf,
    pub pid: u32,
    pub attached_pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_merge_prefers_request() {
        let mut base = Details {
            jid: Some(JobId::new("j1").unwrap()),
            process: Some(ProcessDetails {
                pid: 10,
                ..Default::default()
            }),
            ..Default::default()
        };
        base.extra
            .insert("runtime".to_string(), serde_json::json!("runc"));

        let mut overlay = Details {
            process: Some(ProcessDetails {
                pid: 20,
                ..Default::default()
            }),
            ..Default::default()
        };
        overlay
            .extra
            .insert("root".to_string(), serde_json::json!("/run/runc"));

        let merged = overlay.merged_over(&base);
        assert_eq!(merged.jid.as_ref().unwrap().as_str(), "j1");
        assert_eq!(merged.pid(), Some(20));
        assert_eq!(merged.extra.len(), 2);
    }

    #[test]
    fn test_request_type_field_name() {
        let req: DumpRequest =
            serde_json::from_str(r#"{"type":"process","details":{"process":{"pid":42}}}"#)
                .unwrap();
        assert_eq!(req.type_tag, PROCESS_TYPE);
        assert_eq!(req.details.pid(), Some(42));
    }
}
