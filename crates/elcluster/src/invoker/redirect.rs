//! Callback redirection onto a caller-chosen executor.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::runtime::Handle;
use tracing::trace;

use elwire::Invocation;

use super::Callbacks;
use super::ErrorHandler;
use super::RemoteInvoker;
use super::Request;
use super::ResultHandler;
use super::Staged;
use crate::error::Result;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs callback jobs somewhere other than the transport pump.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Runs jobs as tasks on a tokio runtime.
pub struct TokioExecutor(pub Handle);

impl TokioExecutor {
    pub fn current() -> Self {
        Self(Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.0.spawn(async move { job() });
    }
}

/// Runs jobs on the runtime's blocking pool, for callbacks that block.
pub struct BlockingExecutor(pub Handle);

impl BlockingExecutor {
    pub fn current() -> Self {
        Self(Handle::current())
    }
}

impl Executor for BlockingExecutor {
    fn execute(&self, job: Job) {
        self.0.spawn_blocking(job);
    }
}

/// An invoker whose callbacks run on `executor`.
///
/// Return values, errors, and cancellation behave exactly as on the wrapped invoker.
/// A callback queued before its request was cancelled is skipped when it runs.
#[derive(Clone)]
pub struct RedirectingInvoker {
    inner: Arc<RemoteInvoker>,
    executor: Arc<dyn Executor>,
}

impl RedirectingInvoker {
    pub fn new(inner: Arc<RemoteInvoker>, executor: Arc<dyn Executor>) -> Self {
        Self { inner, executor }
    }

    pub fn inner(&self) -> &Arc<RemoteInvoker> {
        &self.inner
    }

    fn redirect(&self, callbacks: Callbacks) -> Callbacks {
        let cancelled = callbacks.cancel_flag();
        let result_executor = self.executor.clone();
        let result_cancelled = cancelled.clone();
        let error_executor = self.executor.clone();

        callbacks.map(
            move |handler: ResultHandler| -> ResultHandler {
                let executor = result_executor.clone();
                let cancelled = result_cancelled.clone();
                Box::new(move |payload| {
                    executor.execute(Box::new(move || run_unless_cancelled(&cancelled, || handler(payload))));
                })
            },
            move |handler: ErrorHandler| -> ErrorHandler {
                Arc::new(move |part, error| {
                    let handler = handler.clone();
                    let cancelled = cancelled.clone();
                    error_executor.execute(Box::new(move || {
                        run_unless_cancelled(&cancelled, || handler(part, error))
                    }));
                })
            },
        )
    }

    pub async fn invoke_sync(&self, invocation: Invocation) -> Result<Vec<u8>> {
        self.inner.invoke_sync(invocation).await
    }

    pub async fn invoke_callback(&self, invocation: Invocation, callbacks: Callbacks) -> Result<()> {
        self.inner.invoke_callback(invocation, self.redirect(callbacks)).await
    }

    pub async fn invoke_future(&self, invocation: Invocation, callbacks: Callbacks) -> Result<Request> {
        self.inner.invoke_future(invocation, self.redirect(callbacks)).await
    }

    pub async fn invoke_staged(&self, invocation: Invocation) -> Result<Staged> {
        self.inner.invoke_staged(invocation).await
    }
}

fn run_unless_cancelled<F: FnOnce()>(cancelled: &AtomicBool, f: F) {
    if cancelled.load(Ordering::Acquire) {
        trace!("Skipping callback of a cancelled request.");
        return;
    }
    f();
}
