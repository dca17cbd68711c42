//! The local instance: what this process hosts and how it answers calls.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;
use uuid::Uuid;

use elwire::DataFrame;
use elwire::ErrorKind;
use elwire::InstanceId;
use elwire::Invocation;
use elwire::NodeId;
use elwire::StatusResponse;

/// Identity, load, and hosted nodes of this process, as reported in status responses.
pub struct LocalInstance {
    instance_id: InstanceId,
    invoker_address: RwLock<String>,
    load: AtomicU64,
    nodes: RwLock<BTreeSet<NodeId>>,
}

impl LocalInstance {
    pub fn new(instance_id: InstanceId, invoker_address: impl Into<String>) -> Self {
        Self {
            instance_id,
            invoker_address: RwLock::new(invoker_address.into()),
            load: AtomicU64::new(0f64.to_bits()),
            nodes: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn invoker_address(&self) -> String {
        self.invoker_address.read().clone()
    }

    pub fn set_invoker_address(&self, address: impl Into<String>) {
        *self.invoker_address.write() = address.into();
    }

    /// Current load; lower is better.
    pub fn load(&self) -> f64 {
        f64::from_bits(self.load.load(Ordering::Relaxed))
    }

    pub fn set_load(&self, load: f64) {
        self.load.store(load.to_bits(), Ordering::Relaxed);
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().iter().copied().collect()
    }

    pub(crate) fn add_node(&self, node: NodeId) -> bool {
        self.nodes.write().insert(node)
    }

    pub(crate) fn remove_node(&self, node: &NodeId) -> bool {
        self.nodes.write().remove(node)
    }

    pub fn status(&self, correlation: Uuid) -> StatusResponse {
        StatusResponse {
            correlation,
            instance_id: self.instance_id,
            invoker_address: self.invoker_address(),
            load: self.load(),
            nodes: self.nodes(),
        }
    }
}

/// Where the answers to one inbound call go.
///
/// Part 0 is the primary result; higher parts feed result-handler parameters.
#[derive(Clone)]
pub struct ReplySink {
    seq: u64,
    emit: Arc<dyn Fn(DataFrame) + Send + Sync>,
}

impl ReplySink {
    pub fn new<F>(seq: u64, emit: F) -> Self
    where
        F: Fn(DataFrame) + Send + Sync + 'static,
    {
        Self { seq, emit: Arc::new(emit) }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn result(&self, part: u32, payload: Vec<u8>) {
        (self.emit)(DataFrame::Result { seq: self.seq, part, payload });
    }

    pub fn error(&self, part: u32, message: impl Into<String>) {
        (self.emit)(DataFrame::Error {
            seq: self.seq,
            part,
            kind: ErrorKind::Remote,
            message: message.into(),
        });
    }

    pub fn failure(&self, part: u32, kind: ErrorKind, message: impl Into<String>) {
        (self.emit)(DataFrame::Error { seq: self.seq, part, kind, message: message.into() });
    }
}

/// Executes inbound invocations against locally hosted nodes.
///
/// Implementations hand the work to whatever runs operations for one node; calls for
/// the same node must not run concurrently.
#[async_trait::async_trait]
pub trait InvocationDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, node: NodeId, invocation: Invocation, replies: ReplySink);
}

/// Answers every call with a `NoSuchRoute` error.
pub struct RejectingDispatcher;

#[async_trait::async_trait]
impl InvocationDispatcher for RejectingDispatcher {
    async fn dispatch(&self, node: NodeId, _invocation: Invocation, replies: ReplySink) {
        replies.failure(0, ErrorKind::NoSuchRoute, format!("{} serves no invocations", node));
    }
}
