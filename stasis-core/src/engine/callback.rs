// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Notify-callback phase tables.
//!
//! A [`NotifyCallback`] is a struct of optional phase functions. Several of
//! them are combined with [`NotifyCallbackMulti::include`]; the engine then
//! runs each phase across all included tables, most recently included
//! first, so the table added closest to the engine runs before the ones
//! added further out.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::EngineOptions;
use crate::error::{StasisError, StasisResult};
use crate::pipeline::BoxFuture;

/// Input handed to every phase function.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub lifetime: CancellationToken,
    pub opts: EngineOptions,
    /// Dumped PID during a dump; restored PID once the engine reports it.
    pub pid: u32,
}

pub type PhaseFn = Arc<dyn Fn(PhaseContext) -> BoxFuture<'static, StasisResult<()>> + Send + Sync>;

/// Box a phase function.
pub fn phase<F, Fut>(f: F) -> PhaseFn
where
    F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = StasisResult<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    PreDump,
    PostDump,
    FinalizeDump,
    OnDumpError,
    PreRestore,
    PostRestore,
    PreResume,
    PostResume,
    FinalizeRestore,
}

impl Phase {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::PreDump => "pre-dump",
            Self::PostDump => "post-dump",
            Self::FinalizeDump => "finalize-dump",
            Self::OnDumpError => "on-dump-error",
            Self::PreRestore => "pre-restore",
            Self::PostRestore => "post-restore",
            Self::PreResume => "pre-resume",
            Self::PostResume => "post-resume",
            Self::FinalizeRestore => "finalize-restore",
        }
    }

    /// Finalize and error phases run every table and join the errors.
    const fn runs_all(&self) -> bool {
        matches!(
            self,
            Self::FinalizeDump | Self::FinalizeRestore | Self::OnDumpError
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Phase table. Unset phases are skipped.
#[derive(Clone, Default)]
pub struct NotifyCallback {
    pub name: &'static str,
    pub initialize: Option<PhaseFn>,
    pub pre_dump: Option<PhaseFn>,
    pub post_dump: Option<PhaseFn>,
    pub finalize_dump: Option<PhaseFn>,
    pub on_dump_error: Option<PhaseFn>,
    pub pre_restore: Option<PhaseFn>,
    pub post_restore: Option<PhaseFn>,
    pub pre_resume: Option<PhaseFn>,
    pub post_resume: Option<PhaseFn>,
    pub finalize_restore: Option<PhaseFn>,
}

impl NotifyCallback {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn get(&self, phase: Phase) -> Option<&PhaseFn> {
        match phase {
            Phase::Initialize => self.initialize.as_ref(),
            Phase::PreDump => self.pre_dump.as_ref(),
            Phase::PostDump => self.post_dump.as_ref(),
            Phase::FinalizeDump => self.finalize_dump.as_ref(),
            Phase::OnDumpError => self.on_dump_error.as_ref(),
            Phase::PreRestore => self.pre_restore.as_ref(),
            Phase::PostRestore => self.post_restore.as_ref(),
            Phase::PreResume => self.pre_resume.as_ref(),
            Phase::PostResume => self.post_resume.as_ref(),
            Phase::FinalizeRestore => self.finalize_restore.as_ref(),
        }
    }
}

impl fmt::Debug for NotifyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyCallback")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered set of phase tables handed to the engine.
#[derive(Clone, Default, Debug)]
pub struct NotifyCallbackMulti {
    callbacks: Vec<Arc<NotifyCallback>>,
}

impl NotifyCallbackMulti {
    pub fn include(&mut self, callback: NotifyCallback) {
        self.callbacks.push(Arc::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Run `phase` across all tables in reverse inclusion order.
    pub async fn run(&self, phase: Phase, ctx: &PhaseContext) -> StasisResult<()> {
        let mut errors = Vec::new();

        for callback in self.callbacks.iter().rev() {
            let Some(f) = callback.get(phase) else {
                continue;
            };

            tracing::trace!(callback = callback.name, phase = %phase, pid = ctx.pid, "Running callback phase");

            if let Err(e) = f(ctx.clone()).await {
                let e = e.context(format!("{} {}", callback.name, phase));
                if !phase.runs_all() {
                    return Err(e);
                }
                errors.push(e);
            }
        }

        match StasisError::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(name: &'static str, log: Arc<Mutex<Vec<String>>>, fail: bool) -> NotifyCallback {
        let mut cb = NotifyCallback::named(name);
        let pre = log.clone();
        cb.pre_dump = Some(phase(move |_ctx| {
            let log = pre.clone();
            async move {
                log.lock().unwrap().push(format!("{}:pre", name));
                if fail {
                    return Err(StasisError::internal("boom"));
                }
                Ok(())
            }
        }));
        cb.finalize_dump = Some(phase(move |_ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{}:fin", name));
                if fail {
                    return Err(StasisError::internal("fin boom"));
                }
                Ok(())
            }
        }));
        cb
    }

    fn ctx() -> PhaseContext {
        PhaseContext {
            lifetime: CancellationToken::new(),
            opts: EngineOptions::default(),
            pid: 1,
        }
    }

    #[tokio::test]
    async fn test_reverse_inclusion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut multi = NotifyCallbackMulti::default();
        multi.include(recording("outer", log.clone(), false));
        multi.include(recording("inner", log.clone(), false));

        multi.run(Phase::PreDump, &ctx()).await.unwrap();
        multi.run(Phase::PostDump, &ctx()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["inner:pre", "outer:pre"]);
    }

    #[tokio::test]
    async fn test_stops_at_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut multi = NotifyCallbackMulti::default();
        multi.include(recording("outer", log.clone(), false));
        multi.include(recording("inner", log.clone(), true));

        assert!(multi.run(Phase::PreDump, &ctx()).await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["inner:pre"]);
    }

    #[tokio::test]
    async fn test_finalize_runs_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut multi = NotifyCallbackMulti::default();
        multi.include(recording("outer", log.clone(), false));
        multi.include(recording("inner", log.clone(), true));

        let err = multi.run(Phase::FinalizeDump, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("fin boom"));
        assert_eq!(*log.lock().unwrap(), vec!["inner:fin", "outer:fin"]);
    }
}
