// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stasis Core Library
//!
//! Core of the stasis checkpoint/restore daemon. Provides the composable
//! operation pipeline, the GPU controller pool and its engine callbacks,
//! the durable job registry, and the dump/restore/run/freeze orchestrators.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod plugins;
pub mod process;
pub mod server;
pub mod state;
pub mod storage;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigLoader, DaemonConfig, GpuConfig, JobsConfig};
pub use error::{GpuError, HardValidationError, JobError, StasisError, StasisResult, StatusKind};
pub use gpu::{FreezeType, GpuManager};
pub use job::JobManager;
pub use pipeline::{Adapter, ExitSignal, Handler, Opts};
pub use plugins::PluginRegistry;
pub use server::{Collaborators, Server};
pub use state::{ControllerState, JobStatus};
pub use store::{LocalStore, MemoryStore, Store};
pub use types::{ControllerId, JobId, ShmSize};
