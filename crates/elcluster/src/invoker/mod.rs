//! # Remote Invoker
//!
//! A stateful client bound to one data-plane address. It sends `Call` frames and
//! correlates `Result`/`Error` frames back to the caller by sequence number.
//!
//! ## Calling conventions
//!
//! | method            | caller gets        | part 0 goes to              |
//! |-------------------|--------------------|-----------------------------|
//! | `invoke_sync`     | the payload        | the suspended caller        |
//! | `invoke_callback` | `()` once sent     | `Callbacks::on_result`      |
//! | `invoke_future`   | a `Request`        | whoever awaits the request  |
//! | `invoke_staged`   | a `Staged` future  | every clone of the future   |
//!
//! Parts above 0 feed result-handler callbacks under every convention. Callbacks run
//! on the pump task that reads the transport unless wrapped by `RedirectingInvoker`.
//!
//! ## Invariants
//! - Each part reaches caller code at most once. Duplicate and late frames are logged
//!   and dropped.
//! - When the transport dies every pending call fails with the same error.
//! - `stop()` tears the invoker down at most once.

mod redirect;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use elwire::DataFrame;
use elwire::DispatchType;
use elwire::Invocation;

use crate::error::ClusterError;
use crate::error::Result;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;

pub use redirect::BlockingExecutor;
pub use redirect::Executor;
pub use redirect::Job;
pub use redirect::RedirectingInvoker;
pub use redirect::TokioExecutor;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// What a remote method hands back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// Nothing; completion is only observable through callbacks.
    Void,
    /// A value that arrives later (future or staged).
    Pending,
    /// A value the caller waits for.
    Value,
}

/// Picks a concrete convention for `Hybrid`. Other dispatch types pass through.
pub fn resolve_hybrid(method: &str, dispatch: DispatchType, shape: ReturnShape) -> DispatchType {
    if dispatch != DispatchType::Hybrid {
        return dispatch;
    }
    let resolved = match shape {
        ReturnShape::Void => DispatchType::Callback,
        ReturnShape::Pending => DispatchType::Future,
        ReturnShape::Value => DispatchType::Synchronous,
    };
    warn!(method, resolved = ?resolved, "Hybrid dispatch is discouraged. Declare the convention explicitly.");
    resolved
}

type PartHandler = Box<dyn FnOnce(Result<Vec<u8>>) + Send + Sync + 'static>;

/// Consumer of results for one part.
pub type ResultHandler = Box<dyn FnOnce(Vec<u8>) + Send + Sync + 'static>;

/// Consumer of errors, told which part failed.
pub type ErrorHandler = Arc<dyn Fn(u32, ClusterError) + Send + Sync + 'static>;

/// The callbacks of one call.
///
/// `on_result` takes part 0 under the callback convention; `on_part(n, ..)` takes part
/// `n > 0` under any convention. Errors for a part go to `on_error` when present and are
/// logged otherwise.
pub struct Callbacks {
    on_result: Option<ResultHandler>,
    parts: BTreeMap<u32, ResultHandler>,
    on_error: Option<ErrorHandler>,
    cancelled: Arc<AtomicBool>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            on_result: None,
            parts: BTreeMap::new(),
            on_error: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Vec<u8>) + Send + Sync + 'static,
    {
        self.on_result = Some(Box::new(f));
        self
    }

    /// Registers the consumer of part `part`. Part 0 is the primary result; use
    /// `on_result` for it.
    pub fn on_part<F>(mut self, part: u32, f: F) -> Self
    where
        F: FnOnce(Vec<u8>) + Send + Sync + 'static,
    {
        if part == 0 {
            self.on_result = Some(Box::new(f));
        } else {
            self.parts.insert(part, Box::new(f));
        }
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, ClusterError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn has_error_handler(&self) -> bool {
        self.on_error.is_some()
    }

    /// Rewraps every consumer. Used to move delivery onto another executor.
    pub(crate) fn map<R, E>(self, wrap_result: R, wrap_error: E) -> Self
    where
        R: Fn(ResultHandler) -> ResultHandler,
        E: FnOnce(ErrorHandler) -> ErrorHandler,
    {
        Self {
            on_result: self.on_result.map(&wrap_result),
            parts: self.parts.into_iter().map(|(part, f)| (part, wrap_result(f))).collect(),
            on_error: self.on_error.map(wrap_error),
            cancelled: self.cancelled,
        }
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Splits into per-part handlers. `primary` replaces `on_result` for part 0.
    fn into_parts(self, primary: Option<PartHandler>) -> (BTreeMap<u32, PartHandler>, Option<ErrorHandler>) {
        let mut handlers: BTreeMap<u32, PartHandler> = BTreeMap::new();

        match (primary, self.on_result) {
            (Some(primary), _) => {
                handlers.insert(0, primary);
            }
            (None, Some(on_result)) => {
                handlers.insert(0, part_handler(0, on_result, self.on_error.clone()));
            }
            (None, None) => {
                handlers.insert(0, completion_handler(self.on_error.clone()));
            }
        }
        for (part, f) in self.parts {
            handlers.insert(part, part_handler(part, f, self.on_error.clone()));
        }
        (handlers, self.on_error)
    }
}

fn part_handler(part: u32, on_result: ResultHandler, on_error: Option<ErrorHandler>) -> PartHandler {
    Box::new(move |result| match result {
        Ok(payload) => on_result(payload),
        Err(e) => report_error(part, e, on_error.as_ref()),
    })
}

fn completion_handler(on_error: Option<ErrorHandler>) -> PartHandler {
    Box::new(move |result| {
        if let Err(e) = result {
            report_error(0, e, on_error.as_ref());
        }
    })
}

fn report_error(part: u32, error: ClusterError, on_error: Option<&ErrorHandler>) {
    match on_error {
        Some(on_error) => on_error(part, error),
        None => warn!(part, error = %error, "Remote call failed with no error handler."),
    }
}

struct PendingCall {
    handlers: BTreeMap<u32, PartHandler>,
    delivered: BTreeSet<u32>,
    on_error: Option<ErrorHandler>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn fail(mut self, error: ClusterError) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for (_, handler) in std::mem::take(&mut self.handlers) {
            handler(Err(error.clone()));
        }
    }

    fn discard(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

type PendingMap = DashMap<u64, PendingCall>;

/// What to do with one inbound frame, decided while the entry is locked.
enum Delivery {
    Handler(PartHandler, bool),
    Orphan(ErrorHandler, ClusterError),
    Drop(&'static str),
}

/// A client for one data-plane address.
pub struct RemoteInvoker {
    address: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingMap>,
    seq_gen: AtomicU64,
    call_timeout: Duration,
    pump: SyncMutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl RemoteInvoker {
    /// Connects to `address` through `connector`, bounded by `timeout`.
    pub async fn start(connector: &dyn Connector, address: &str, timeout: Duration) -> Result<Self> {
        let transport = tokio::time::timeout(timeout, connector.connect(address))
            .await
            .map_err(|_| ClusterError::Timeout(format!("Connecting invoker to {}", address)))??;
        debug!(address, "Invoker connected.");
        Ok(Self::new(address, transport, DEFAULT_CALL_TIMEOUT))
    }

    /// Wraps a connected transport and spawns the pump.
    pub fn new(address: impl Into<String>, transport: Box<dyn Transport>, call_timeout: Duration) -> Self {
        let address = address.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());

        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_address = address.clone();
        let alive = Arc::new(AtomicBool::new(true));
        let pump_alive = alive.clone();
        let pump = tokio::spawn(async move {
            let error = loop {
                match pump_transport.recv().await {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(&msg, &pump_pending) {
                            warn!(address = %pump_address, error = %e, "Malformed frame. Closing invoker.");
                            pump_transport.close().await;
                            break e;
                        }
                    }
                    Ok(None) => break TransportError::ConnectionLost("Stream closed".into()).into(),
                    Err(e) => break e.into(),
                }
            };
            debug!(address = %pump_address, error = %error, "Invoker pump ended.");
            pump_alive.store(false, Ordering::Release);
            Self::notify_all_pending(&pump_pending, error);
        });

        Self {
            address,
            transport,
            pending,
            seq_gen: AtomicU64::new(1),
            call_timeout,
            pump: SyncMutex::new(Some(pump)),
            alive,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of calls still waiting for at least one part.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// False once the transport died or the invoker was stopped.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.is_stopped()
    }

    /// Closes the transport and fails every pending call. A second stop is an error.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(ClusterError::illegal_state(format!("Invoker for {} already stopped.", self.address)));
        }
        self.transport.close().await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        Self::notify_all_pending(
            &self.pending,
            TransportError::ConnectionLost(format!("Invoker for {} stopped", self.address)).into(),
        );
        debug!(address = %self.address, "Invoker stopped.");
        Ok(())
    }

    fn notify_all_pending(pending: &PendingMap, error: ClusterError) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, call)) = pending.remove(&key) {
                call.fail(error.clone());
            }
        }
    }

    fn handle_message(msg: &[u8], pending: &PendingMap) -> Result<()> {
        let (seq, part, result) = match DataFrame::decode(msg)? {
            DataFrame::Result { seq, part, payload } => (seq, part, Ok(payload)),
            DataFrame::Error { seq, part, kind, message } => (seq, part, Err(ClusterError::Remote { kind, message })),
            DataFrame::Call { seq, .. } => {
                return Err(ClusterError::illegal_state(format!("Invoker received a call frame (seq {})", seq)));
            }
        };

        let delivery = match pending.get_mut(&seq) {
            None => Delivery::Drop("late frame"),
            Some(mut call) => {
                if !call.delivered.insert(part) {
                    Delivery::Drop("duplicate part")
                } else if let Some(handler) = call.handlers.remove(&part) {
                    Delivery::Handler(handler, call.handlers.is_empty())
                } else {
                    match (result.as_ref().err(), call.on_error.clone()) {
                        (Some(e), Some(on_error)) => Delivery::Orphan(on_error, e.clone()),
                        _ => Delivery::Drop("unexpected part"),
                    }
                }
            }
        };

        match delivery {
            Delivery::Handler(handler, complete) => {
                if complete {
                    if let Some((_, call)) = pending.remove(&seq) {
                        call.discard();
                    }
                }
                handler(result);
            }
            Delivery::Orphan(on_error, error) => on_error(part, error),
            Delivery::Drop(why) => debug!(seq, part, why, "Dropping frame."),
        }
        Ok(())
    }

    /// Registers the call, arms its timeout, and sends the frame.
    async fn call(&self, invocation: Invocation, handlers: BTreeMap<u32, PartHandler>, on_error: Option<ErrorHandler>) -> Result<u64> {
        if self.is_stopped() {
            return Err(ClusterError::illegal_state(format!("Invoker for {} is stopped.", self.address)));
        }

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let payload = DataFrame::Call { seq, invocation }.encode()?;

        let timer_pending = Arc::downgrade(&self.pending);
        let timeout = self.call_timeout;
        let address = self.address.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, call)) = timer_pending.upgrade().and_then(|p| p.remove(&seq)) {
                warn!(address = %address, seq, timeout = ?timeout, "Remote call timed out.");
                call.fail(ClusterError::Timeout(format!("Call {} to {}", seq, address)));
            }
        });

        self.pending.insert(seq, PendingCall {
            handlers,
            delivered: BTreeSet::new(),
            on_error,
            timer: Some(timer),
        });

        // The pump may have failed every pending call before this one was registered.
        if !self.alive.load(Ordering::Acquire) {
            if let Some((_, call)) = self.pending.remove(&seq) {
                call.discard();
                return Err(TransportError::ConnectionLost(format!("Invoker for {} lost its transport", self.address)).into());
            }
        }

        if let Err(e) = self.transport.send(&payload).await {
            if let Some((_, call)) = self.pending.remove(&seq) {
                call.discard();
            }
            return Err(e.into());
        }
        Ok(seq)
    }

    fn oneshot_primary() -> (PartHandler, oneshot::Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        let handler: PartHandler = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (handler, rx)
    }

    /// Sends the call and suspends until part 0 arrives.
    pub async fn invoke_sync(&self, invocation: Invocation) -> Result<Vec<u8>> {
        let (primary, rx) = Self::oneshot_primary();
        let mut handlers = BTreeMap::new();
        handlers.insert(0, primary);
        self.call(invocation.with_dispatch(DispatchType::Synchronous), handlers, None).await?;
        rx.await.map_err(|_| TransportError::ConnectionLost("Response channel closed".into()))?
    }

    /// Sends the call and returns. Results and errors go to `callbacks`.
    pub async fn invoke_callback(&self, invocation: Invocation, callbacks: Callbacks) -> Result<()> {
        let (handlers, on_error) = callbacks.into_parts(None);
        self.call(invocation.with_dispatch(DispatchType::Callback), handlers, on_error).await?;
        Ok(())
    }

    /// Sends the call and returns a cancellable handle to part 0. Parts above 0 go to
    /// `callbacks`.
    pub async fn invoke_future(&self, invocation: Invocation, callbacks: Callbacks) -> Result<Request> {
        self.request(invocation.with_dispatch(DispatchType::Future), callbacks).await
    }

    /// Sends the call and returns a clonable future of part 0.
    pub async fn invoke_staged(&self, invocation: Invocation) -> Result<Staged> {
        let request = self
            .request(invocation.with_dispatch(DispatchType::Staged), Callbacks::new())
            .await?;
        Ok(request.boxed().shared())
    }

    async fn request(&self, invocation: Invocation, callbacks: Callbacks) -> Result<Request> {
        let cancelled = callbacks.cancel_flag();
        let (primary, rx) = Self::oneshot_primary();
        let (handlers, on_error) = callbacks.into_parts(Some(primary));
        let seq = self.call(invocation, handlers, on_error).await?;
        Ok(Request {
            seq,
            pending: Arc::downgrade(&self.pending),
            cancelled,
            rx,
        })
    }
}

impl Drop for RemoteInvoker {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// A clonable, composable handle to the primary result of a staged call.
pub type Staged = Shared<BoxFuture<'static, Result<Vec<u8>>>>;

/// Part 0 of a call made with the future convention.
///
/// `cancel()` is advisory: the local pending entry is dropped and nothing is
/// delivered afterwards, but the remote side still runs the call.
pub struct Request {
    seq: u64,
    pending: Weak<PendingMap>,
    cancelled: Arc<AtomicBool>,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
}

impl Request {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some((_, call)) = self.pending.upgrade().and_then(|p| p.remove(&self.seq)) {
            call.discard();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Future for Request {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_cancelled() {
            return Poll::Ready(Err(ClusterError::illegal_state(format!("Request {} was cancelled.", self.seq))));
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::ConnectionLost("Response channel closed".into()).into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
