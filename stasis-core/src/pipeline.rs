// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Composable handler pipeline.
//!
//! Every operation (dump, restore, run, freeze, unfreeze) is a [`Handler`]
//! wrapped by an ordered list of [`Adapter`]s. `with([A, B, C])` applied to
//! `H` yields `A(B(C(H)))`: A runs first and decides whether the rest run.
//!
//! An adapter may mutate the request or response before calling onward,
//! refuse to call onward and return an error, post-process the result, or
//! wrap the returned exit signal. Adapters that create side effects undo
//! them when the downstream call fails; the pipeline has no transactions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::{Engine, NotifyCallbackMulti};
use crate::error::{StasisError, StasisResult};
use crate::plugins::{Feature, PluginRegistry};
use crate::storage::Storage;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Exit code reported when the process exit status could not be observed.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Result of a handler: an optional exit signal for the process it started.
pub type Outcome = StasisResult<Option<ExitSignal>>;

/// Observable exit of a process started or restored by a pipeline.
///
/// Cloneable; every clone resolves to the same exit code.
#[derive(Debug, Clone)]
pub struct ExitSignal(watch::Receiver<Option<i32>>);

/// Sending half of an [`ExitSignal`].
#[derive(Debug)]
pub struct ExitSender(watch::Sender<Option<i32>>);

impl ExitSignal {
    pub fn channel() -> (ExitSender, ExitSignal) {
        let (tx, rx) = watch::channel(None);
        (ExitSender(tx), ExitSignal(rx))
    }

    /// An already exited signal.
    pub fn exited(code: i32) -> ExitSignal {
        let (_, rx) = watch::channel(Some(code));
        ExitSignal(rx)
    }

    /// Wait for the exit code. A dropped sender counts as an unknown exit.
    pub async fn wait(mut self) -> i32 {
        let waited = self
            .0
            .wait_for(|code| code.is_some())
            .await
            .map(|code| (*code).unwrap_or(UNKNOWN_EXIT_CODE));
        match waited {
            Ok(code) => code,
            Err(_) => (*self.0.borrow()).unwrap_or(UNKNOWN_EXIT_CODE),
        }
    }

    pub fn try_code(&self) -> Option<i32> {
        *self.0.borrow()
    }
}

impl ExitSender {
    pub fn send(self, code: i32) {
        self.0.send_replace(Some(code));
    }
}

/// Collaborators for one operation. Passed by value so an adapter can
/// change what the steps after it see.
#[derive(Clone)]
pub struct Opts {
    /// Scope for background work started by the operation.
    pub lifetime: CancellationToken,
    /// Join handle for detached tasks; shutdown waits on it.
    pub tasks: TaskTracker,
    pub plugins: Arc<PluginRegistry>,
    pub engine: Option<Arc<dyn Engine>>,
    /// Callbacks the engine invokes at each dump/restore phase.
    pub callbacks: NotifyCallbackMulti,
    pub storage: Option<Arc<dyn Storage>>,
}

impl Opts {
    pub fn new(lifetime: CancellationToken, tasks: TaskTracker, plugins: Arc<PluginRegistry>) -> Self {
        Self {
            lifetime,
            tasks,
            plugins,
            engine: None,
            callbacks: NotifyCallbackMulti::default(),
            storage: None,
        }
    }
}

type HandlerFn<Req, Resp> =
    dyn for<'a> Fn(Opts, &'a mut Req, &'a mut Resp) -> BoxFuture<'a, Outcome> + Send + Sync;

/// One step of an operation, or a whole composed operation.
pub struct Handler<Req, Resp> {
    inner: Arc<HandlerFn<Req, Resp>>,
}

impl<Req, Resp> Clone for Handler<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Transforms a handler into a handler of the same signature.
pub type Adapter<Req, Resp> = Arc<dyn Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync>;

/// Ordered adapter list, outermost first.
pub type Middleware<Req, Resp> = Vec<Adapter<Req, Resp>>;

impl<Req, Resp> Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(Opts, &'a mut Req, &'a mut Resp) -> BoxFuture<'a, Outcome>
            + Send
            + Sync
            + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn call<'a>(&self, opts: Opts, req: &'a mut Req, resp: &'a mut Resp) -> BoxFuture<'a, Outcome> {
        (self.inner)(opts, req, resp)
    }

    /// Wrap with `adapters`, the first one outermost.
    pub fn with(self, adapters: &[Adapter<Req, Resp>]) -> Self {
        adapters
            .iter()
            .rev()
            .fold(self, |handler, adapter| adapter(handler))
    }
}

/// Box an adapter function.
pub fn adapter<Req, Resp, F>(f: F) -> Adapter<Req, Resp>
where
    F: Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Type-dispatching adapter: looks up the request's type tag under `feature`
/// and splices the plugin's middleware right after itself. Unknown types
/// fail as unimplemented.
pub fn splice<Req, Resp>(
    feature: Feature<Middleware<Req, Resp>>,
    type_of: fn(&Req) -> &str,
) -> Adapter<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    adapter(move |next: Handler<Req, Resp>| {
        Handler::<Req, Resp>::new(move |opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let type_tag = type_of(req).to_string();
                let middleware = opts
                    .plugins
                    .lookup(&feature, &type_tag)
                    .map_err(|e| StasisError::from(e).context(format!("type '{}'", type_tag)))?;

                tracing::trace!(
                    feature = feature.name(),
                    type_tag = %type_tag,
                    steps = middleware.len(),
                    "Splicing plugin middleware"
                );

                next.with(&middleware).call(opts, req, resp).await
            })
        })
    })
}

/// Handler resolved from the plugin registry at call time, falling back to
/// `fallback` when given, or failing as unimplemented otherwise.
pub fn dispatch<Req, Resp>(
    feature: Feature<Handler<Req, Resp>>,
    type_of: fn(&Req) -> &str,
    fallback: Option<Handler<Req, Resp>>,
) -> Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Handler::<Req, Resp>::new(move |opts, req, resp| {
        let fallback = fallback.clone();
        Box::pin(async move {
            let type_tag = type_of(req).to_string();
            let handler = match opts.plugins.lookup(&feature, &type_tag) {
                Ok(handler) => handler,
                Err(e) => match fallback {
                    Some(handler) => handler,
                    None => {
                        return Err(StasisError::unimplemented(format!(
                            "no {} for type '{}': {}",
                            feature.name(),
                            type_tag,
                            e
                        )))
                    }
                },
            };
            handler.call(opts, req, resp).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusKind;

    #[derive(Default)]
    struct TraceReq {
        type_tag: String,
        trace: Vec<&'static str>,
    }

    #[derive(Default)]
    struct TraceResp {
        trace: Vec<&'static str>,
    }

    fn type_of(req: &TraceReq) -> &str {
        &req.type_tag
    }

    fn opts() -> Opts {
        Opts::new(
            CancellationToken::new(),
            TaskTracker::new(),
            PluginRegistry::new_shared(),
        )
    }

    fn record(name: &'static str) -> Adapter<TraceReq, TraceResp> {
        adapter(move |next: Handler<TraceReq, TraceResp>| {
            Handler::<TraceReq, TraceResp>::new(move |opts, req, resp| {
                let next = next.clone();
                Box::pin(async move {
                    req.trace.push(name);
                    let exited = next.call(opts, req, resp).await?;
                    resp.trace.push(name);
                    Ok(exited)
                })
            })
        })
    }

    fn refuse(name: &'static str) -> Adapter<TraceReq, TraceResp> {
        adapter(move |_next: Handler<TraceReq, TraceResp>| {
            Handler::<TraceReq, TraceResp>::new(move |_opts, req, _resp| {
                Box::pin(async move {
                    req.trace.push(name);
                    Err(StasisError::invalid_argument(format!("{} refused", name)))
                })
            })
        })
    }

    fn terminal() -> Handler<TraceReq, TraceResp> {
        Handler::<TraceReq, TraceResp>::new(|_opts, req, _resp| {
            Box::pin(async move {
                req.trace.push("handler");
                Ok(Some(ExitSignal::exited(0)))
            })
        })
    }

    #[tokio::test]
    async fn test_adapters_run_outermost_first() {
        let handler = terminal().with(&[record("a"), record("b"), record("c")]);
        let mut req = TraceReq::default();
        let mut resp = TraceResp::default();

        let exited = handler.call(opts(), &mut req, &mut resp).await.unwrap();

        assert_eq!(req.trace, vec!["a", "b", "c", "handler"]);
        assert_eq!(resp.trace, vec!["c", "b", "a"]);
        assert_eq!(exited.unwrap().wait().await, 0);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest() {
        let handler = terminal().with(&[record("a"), refuse("b"), record("c")]);
        let mut req = TraceReq::default();
        let mut resp = TraceResp::default();

        let err = handler
            .call(opts(), &mut req, &mut resp)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), StatusKind::InvalidArgument);
        assert_eq!(req.trace, vec!["a", "b"]);
        assert!(resp.trace.is_empty());
    }

    #[tokio::test]
    async fn test_splice_inserts_after_itself() {
        let feature: Feature<Middleware<TraceReq, TraceResp>> = Feature::new("TestMiddleware");
        let opts = opts();
        opts.plugins
            .register(&feature, "custom", vec![record("p1"), record("p2")]);

        let handler = terminal().with(&[record("a"), splice(feature, type_of), record("z")]);
        let mut req = TraceReq {
            type_tag: "custom".to_string(),
            ..Default::default()
        };
        let mut resp = TraceResp::default();
        handler.call(opts, &mut req, &mut resp).await.unwrap();

        assert_eq!(req.trace, vec!["a", "p1", "p2", "z", "handler"]);
    }

    #[tokio::test]
    async fn test_splice_unknown_type_is_unimplemented() {
        let feature: Feature<Middleware<TraceReq, TraceResp>> = Feature::new("TestMiddleware");
        let handler = terminal().with(&[splice(feature, type_of)]);
        let mut req = TraceReq {
            type_tag: "unknown".to_string(),
            ..Default::default()
        };
        let mut resp = TraceResp::default();

        let err = handler.call(opts(), &mut req, &mut resp).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            StatusKind::Unimplemented | StatusKind::FailedPrecondition
        ));
        assert!(req.trace.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_falls_back() {
        let feature: Feature<Handler<TraceReq, TraceResp>> = Feature::new("TestHandler");
        let handler = dispatch(feature, type_of, Some(terminal()));
        let mut req = TraceReq::default();
        let mut resp = TraceResp::default();
        handler.call(opts(), &mut req, &mut resp).await.unwrap();
        assert_eq!(req.trace, vec!["handler"]);

        let strict = dispatch(feature, type_of, None);
        let err = strict
            .call(opts(), &mut TraceReq::default(), &mut TraceResp::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StatusKind::Unimplemented);
    }

    #[tokio::test]
    async fn test_exit_signal_dropped_sender() {
        let (tx, rx) = ExitSignal::channel();
        drop(tx);
        assert_eq!(rx.wait().await, UNKNOWN_EXIT_CODE);

        let (tx, rx) = ExitSignal::channel();
        let waiter = tokio::spawn(rx.clone().wait());
        tx.send(3);
        assert_eq!(waiter.await.unwrap(), 3);
        assert_eq!(rx.try_code(), Some(3));
    }
}
