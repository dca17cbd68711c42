//! # Event Publishers
//!
//! Listener sets with unsubscribe handles, plus an ordered dispatcher for asynchronous
//! delivery.
//!
//! ## Invariants
//! - Publishers sharing one `Dispatcher` deliver their asynchronous events in exactly the
//!   order they were published, one at a time. Two publishers (discover and undiscover)
//!   on the same dispatcher therefore never reorder or interleave events for one host.
//! - Dropping a `Subscription` removes its listener.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send>;

/// A single delivery lane. Jobs run one after another on a dedicated task.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Spawns the delivery task on the current tokio runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            trace!(dispatcher = name, "Dispatcher drained.");
        });
        Self { tx }
    }

    fn submit(&self, job: Job) {
        let _ = self.tx.send(job);
    }

    /// Resolves once every job submitted before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.await;
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of listeners for one kind of event.
pub struct Publisher<T> {
    listeners: Arc<DashMap<u64, Listener<T>>>,
    next_id: AtomicU64,
    dispatcher: Dispatcher,
}

impl<T> Publisher<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            dispatcher,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.remove(&id);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Delivers `event` to every listener on the calling task.
    pub fn publish(&self, event: &T) {
        deliver(&self.listeners, event);
    }

    /// Queues `event` on the dispatcher and returns immediately.
    pub fn publish_async(&self, event: T) {
        let listeners = self.listeners.clone();
        self.dispatcher.submit(Box::new(move || deliver(&listeners, &event)));
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

fn deliver<T>(listeners: &DashMap<u64, Listener<T>>, event: &T) {
    // Snapshot first so a listener may unsubscribe itself without deadlocking the map.
    let snapshot: Vec<Listener<T>> = listeners.iter().map(|l| l.value().clone()).collect();
    for listener in snapshot {
        listener(event);
    }
}

/// Handle returned by `subscribe`. Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self { unsubscribe: Some(Box::new(unsubscribe)) }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}
