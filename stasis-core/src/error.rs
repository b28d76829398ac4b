// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for stasis.
//!
//! Every error maps onto a [`StatusKind`] so callers on the far side of the
//! daemon boundary can classify a failure without matching on strings.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::types::JobId;

/// Coarse classification attached to every error leaving a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Malformed or missing request fields.
    InvalidArgument,
    /// Unknown job, checkpoint or controller.
    NotFound,
    /// Plugin or feature not installed, job in the wrong state, or a
    /// required prior step did not run.
    FailedPrecondition,
    /// Health check failed or a dependency is degraded.
    Unavailable,
    /// Engine, store or I/O failure.
    Internal,
    /// No handler for the requested workload type.
    Unimplemented,
}

impl StatusKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Top-level error type for the stasis daemon.
#[derive(Debug, Error)]
pub enum StasisError {
    // =========================================================================
    // Request Status - raised directly by pipeline steps
    // =========================================================================
    #[error("{message}")]
    Status { kind: StatusKind, message: String },

    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Component Errors
    // =========================================================================
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call failed: {syscall} - {message}")]
    Syscall {
        syscall: &'static str,
        message: String,
    },

    // =========================================================================
    // Composite - a primary failure plus errors from cleanup phases
    // =========================================================================
    #[error("{}", join_messages(.0))]
    Joined(Vec<StasisError>),
}

fn join_messages(errors: &[StasisError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StasisError {
    pub fn status(kind: StatusKind, message: impl Into<String>) -> Self {
        Self::Status {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::status(StatusKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(StatusKind::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::status(StatusKind::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::status(StatusKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::status(StatusKind::Internal, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::status(StatusKind::Unimplemented, message)
    }

    /// Wrap with a context message, keeping the original kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self::Status {
            kind: self.kind(),
            message: format!("{}: {}", context, self),
        }
    }

    /// Re-classify under an explicit kind, keeping the message.
    pub fn with_kind(self, kind: StatusKind) -> Self {
        Self::Status {
            kind,
            message: self.to_string(),
        }
    }

    /// Combine a list of errors. `None` when the list is empty.
    pub fn join(mut errors: Vec<StasisError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Joined(errors)),
        }
    }

    /// Status kind derived from the most specific variant.
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Status { kind, .. } => *kind,
            Self::HardValidation(_) | Self::ConfigParse { .. } => StatusKind::InvalidArgument,
            Self::ConfigNotFound { .. } => StatusKind::NotFound,
            Self::Gpu(e) => e.kind(),
            Self::Job(e) => e.kind(),
            Self::Store(_) => StatusKind::Internal,
            Self::Engine(e) => e.kind(),
            Self::Plugin(e) => e.kind(),
            Self::Io { .. } | Self::Syscall { .. } => StatusKind::Internal,
            Self::Joined(errors) => errors
                .first()
                .map(|e| e.kind())
                .unwrap_or(StatusKind::Internal),
        }
    }
}

impl From<nix::errno::Errno> for StasisError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Syscall {
            syscall: "nix",
            message: errno.desc().to_string(),
        }
    }
}

/// Hard validation errors reject configuration or request input up front.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Shared memory size out of bounds: {size_bytes} bytes (min: {min}, max: {max})")]
    ShmSizeOutOfBounds { size_bytes: u64, min: u64, max: u64 },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// GPU controller pool errors.
///
/// `Clone` because an asynchronous GPU dump or restore result is observed by
/// more than one callback phase.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("GPU controller binary not found: {path}")]
    BinaryNotFound { path: PathBuf },

    #[error("GPU controller not found: {id}")]
    ControllerNotFound { id: String },

    #[error("No GPU controller attached to PID {pid}")]
    NotAttached { pid: u32 },

    #[error("GPU controller {id} timed out during {op} after {limit_secs}s")]
    Timeout {
        op: &'static str,
        id: String,
        limit_secs: u64,
    },

    #[error("GPU controller {id} {op} cancelled")]
    Cancelled { op: &'static str, id: String },

    #[error("GPU controller {id} {op} failed: {message}")]
    Rpc {
        op: &'static str,
        id: String,
        message: String,
    },

    #[error("Failed to spawn GPU controller: {reason}")]
    Spawn { reason: String },

    #[error("Booking lock error at {path}: {reason}")]
    Booking { path: PathBuf, reason: String },

    #[error("GPU health check failed: {reason}")]
    Unhealthy { reason: String },

    #[error("GPU {op} was never started for controller {id}")]
    NotStarted { op: &'static str, id: String },
}

impl GpuError {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::BinaryNotFound { .. } | Self::NotStarted { .. } => {
                StatusKind::FailedPrecondition
            }
            Self::ControllerNotFound { .. } | Self::NotAttached { .. } => StatusKind::NotFound,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::Unhealthy { .. } => {
                StatusKind::Unavailable
            }
            Self::Rpc { .. } | Self::Spawn { .. } | Self::Booking { .. } => StatusKind::Internal,
        }
    }
}

/// Job registry errors.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Job {0} is not running")]
    NotRunning(JobId),

    #[error("Job {0} is already running")]
    AlreadyRunning(JobId),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Job {0} has no checkpoints")]
    NoCheckpoints(JobId),

    #[error("Failed to signal job {jid}: {message}")]
    Signal { jid: JobId, message: String },
}

impl JobError {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::NotFound(_) | Self::CheckpointNotFound(_) => StatusKind::NotFound,
            Self::AlreadyExists(_)
            | Self::NotRunning(_)
            | Self::AlreadyRunning(_)
            | Self::NoCheckpoints(_) => StatusKind::FailedPrecondition,
            Self::Signal { .. } => StatusKind::Internal,
        }
    }
}

/// Backing store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store record {key} could not be encoded: {reason}")]
    Encoding { key: String, reason: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Checkpoint/restore engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("CRIU binary not found")]
    BinaryNotFound,

    #[error("CRIU version {found} is older than the required {required}")]
    VersionTooOld { found: u32, required: u32 },

    #[error("CRIU dump failed: {reason}")]
    DumpFailed { reason: String },

    #[error("CRIU restore failed: {reason}")]
    RestoreFailed { reason: String },

    #[error("CRIU {phase} callback failed: {reason}")]
    Callback { phase: &'static str, reason: String },
}

impl EngineError {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::BinaryNotFound | Self::VersionTooOld { .. } => StatusKind::FailedPrecondition,
            _ => StatusKind::Internal,
        }
    }
}

/// Plugin registry errors.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin '{name}' is not installed")]
    NotInstalled { name: String },

    #[error("Plugin '{plugin}' does not export feature '{feature}'")]
    FeatureNotAvailable {
        feature: &'static str,
        plugin: String,
    },

    #[error("Feature '{feature}' registered with an unexpected type")]
    TypeMismatch { feature: &'static str },
}

impl PluginError {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::NotInstalled { .. } => StatusKind::FailedPrecondition,
            Self::FeatureNotAvailable { .. } => StatusKind::Unimplemented,
            Self::TypeMismatch { .. } => StatusKind::Internal,
        }
    }
}

/// Result type alias for stasis operations.
pub type StasisResult<T> = Result<T, StasisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StasisError::Job(JobError::NotFound(JobId::new("j1").unwrap()));
        assert!(err.to_string().contains("j1"));
    }

    #[test]
    fn test_kind_from_variants() {
        let jid = JobId::new("j1").unwrap();
        assert_eq!(
            StasisError::from(JobError::NotRunning(jid)).kind(),
            StatusKind::FailedPrecondition
        );
        assert_eq!(
            StasisError::from(PluginError::FeatureNotAvailable {
                feature: "RunHandler",
                plugin: "runc".to_string(),
            })
            .kind(),
            StatusKind::Unimplemented
        );
        assert_eq!(
            StasisError::from(GpuError::Timeout {
                op: "freeze",
                id: "c1".to_string(),
                limit_secs: 60,
            })
            .kind(),
            StatusKind::Unavailable
        );
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = StasisError::not_found("checkpoint abc").context("failed to restore");
        assert_eq!(err.kind(), StatusKind::NotFound);
        assert_eq!(err.to_string(), "failed to restore: checkpoint abc");
    }

    #[test]
    fn test_join() {
        assert!(StasisError::join(vec![]).is_none());

        let single = StasisError::join(vec![StasisError::internal("a")]).unwrap();
        assert!(matches!(single, StasisError::Status { .. }));

        let joined = StasisError::join(vec![
            StasisError::unavailable("dump failed"),
            StasisError::internal("unfreeze failed"),
        ])
        .unwrap();
        assert_eq!(joined.kind(), StatusKind::Unavailable);
        assert_eq!(joined.to_string(), "dump failed; unfreeze failed");
    }
}
