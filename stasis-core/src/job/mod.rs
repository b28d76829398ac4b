// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Job registry: managed workloads, their checkpoints, and the queue that
//! makes both durable.

mod adapters;
mod handle;
mod manager;

pub use adapters::{manage_dump, manage_freeze, manage_restore, manage_run};
pub use handle::Job;
pub use manager::{Action, JobManager};
