//! # Invoker Registry
//!
//! Keeps the routing snapshot in step with the live instance connections.
//!
//! ## Sources of change
//!
//! - **Connect**: fetch the instance's metadata, then add each of its nodes.
//! - **Disconnect**: remove every node of the instance.
//! - **Refresh** (periodic): re-fetch metadata from every connection and re-add each
//!   node at its current load, pruning nodes no instance reports any more. An instance
//!   whose fetch fails keeps its current nodes until the next refresh.
//!
//! All changes are applied by one worker task, in arrival order.

pub mod snapshot;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use elwire::ApplicationId;
use elwire::InstanceId;
use elwire::NodeId;

use crate::connection::InstanceConnection;
use crate::connection::InstanceConnectionService;
use crate::control::ControlService;
use crate::error::ClusterError;
use crate::error::Result;
use crate::invoker::RemoteInvoker;
use crate::publisher::Subscription;

pub use snapshot::Batch;
pub use snapshot::Cleanup;
pub use snapshot::CommitSummary;
pub use snapshot::Entry;
pub use snapshot::NoCleanup;
pub use snapshot::Snapshot;
pub use snapshot::Supplier;
pub use snapshot::Table;

/// Where the proxy layer gets invokers from.
pub trait InvokerSource: Send + Sync + 'static {
    fn best_for_application(&self, application: ApplicationId) -> Result<Arc<RemoteInvoker>>;

    fn for_node(&self, node: &NodeId) -> Result<Arc<RemoteInvoker>>;
}

impl InvokerSource for Snapshot<RemoteInvoker> {
    fn best_for_application(&self, application: ApplicationId) -> Result<Arc<RemoteInvoker>> {
        self.best_invoker_for_application(application)
    }

    fn for_node(&self, node: &NodeId) -> Result<Arc<RemoteInvoker>> {
        self.remote_invoker(node)
    }
}

/// Stops invokers once they left the table.
pub struct StopInvokers;

#[async_trait::async_trait]
impl Cleanup<RemoteInvoker> for StopInvokers {
    async fn teardown(&self, node: NodeId, invoker: Arc<RemoteInvoker>) -> Result<()> {
        debug!(node = %node, address = invoker.address(), "Stopping invoker.");
        invoker.stop().await
    }

    fn is_live(&self, invoker: &RemoteInvoker) -> bool {
        invoker.is_alive()
    }
}

/// Timing of the registry service.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub refresh_interval: Duration,
    pub metadata_timeout: Duration,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// How often the table is logged at debug level.
    pub report_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            call_timeout: crate::invoker::DEFAULT_CALL_TIMEOUT,
            shutdown_timeout: Duration::from_secs(5),
            report_interval: Duration::from_secs(15),
        }
    }
}

enum Work {
    Connected(Arc<InstanceConnection>),
    Disconnected(InstanceId),
    Refresh(Option<oneshot::Sender<CommitSummary>>),
}

struct Inner {
    snapshot: Snapshot<RemoteInvoker>,
    connections: Arc<InstanceConnectionService>,
    control: Arc<ControlService>,
    settings: RegistrySettings,
}

impl Inner {
    /// Opens a route to `node` and starts an invoker on it, once the batch needs one.
    fn supplier(&self, connection: &Arc<InstanceConnection>, node: NodeId) -> Supplier<RemoteInvoker> {
        let connection = connection.clone();
        let control = self.control.clone();
        let settings = self.settings;
        Box::new(move || {
            async move {
                let address = connection.open_route(&node).await?;
                let invoker = RemoteInvoker::start(control.as_ref(), &address, settings.connect_timeout).await?;
                Ok(Arc::new(invoker.with_call_timeout(settings.call_timeout)))
            }
            .boxed()
        })
    }

    async fn on_connected(&self, connection: Arc<InstanceConnection>) -> CommitSummary {
        let metadata = match connection.fetch_metadata(self.settings.metadata_timeout).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(host = %connection.host(), error = %e, "Metadata fetch failed. Using handshake metadata.");
                connection.metadata()
            }
        };

        let mut batch = self.snapshot.begin();
        for node in &metadata.nodes {
            batch.add(*node, metadata.load, self.supplier(&connection, *node));
        }
        batch.commit(&StopInvokers).await
    }

    async fn on_disconnected(&self, instance: InstanceId) -> CommitSummary {
        let mut batch = self.snapshot.begin();
        batch.remove_instance(instance);
        batch.commit(&StopInvokers).await
    }

    async fn refresh(&self) -> CommitSummary {
        let connections = self.connections.active_connections();
        let mut batch = self.snapshot.begin();
        batch.prune();

        for connection in &connections {
            match connection.fetch_metadata(self.settings.metadata_timeout).await {
                Ok(metadata) => {
                    for node in &metadata.nodes {
                        batch.add(*node, metadata.load, self.supplier(connection, *node));
                    }
                }
                Err(e) => {
                    warn!(
                        host = %connection.host(),
                        instance = %connection.instance_id(),
                        error = %e,
                        "Metadata fetch failed. Keeping current entries."
                    );
                    batch.retain_instance(connection.instance_id());
                }
            }
        }

        let summary = batch.commit(&StopInvokers).await;
        debug!(connections = connections.len(), generation = summary.generation, "Registry refreshed.");
        summary
    }

    fn log_table(&self) {
        let table = self.snapshot.table();
        let rows: Vec<String> = table
            .entries()
            .iter()
            .map(|e| format!("{} load={} via {}", e.node, e.load, e.invoker.address()))
            .collect();
        debug!(generation = table.generation(), entries = rows.len(), table = ?rows, "Routing table.");
    }
}

struct Running {
    subscriptions: Vec<Subscription>,
    work: mpsc::UnboundedSender<Work>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The routing table service.
pub struct InvokerRegistry {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl InvokerRegistry {
    pub fn new(
        connections: Arc<InstanceConnectionService>,
        control: Arc<ControlService>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot: Snapshot::new(),
                connections,
                control,
                settings,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> &Snapshot<RemoteInvoker> {
        &self.inner.snapshot
    }

    /// Subscribes to connection events and starts the refresh worker. The first
    /// refresh runs right away.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ClusterError::illegal_state("Already started."));
        }

        let (work, mut queue) = mpsc::unbounded_channel();
        let on_connect = work.clone();
        let on_disconnect = work.clone();
        let subscriptions = vec![
            self.inner.connections.subscribe_to_connect(move |connection| {
                let _ = on_connect.send(Work::Connected(connection.clone()));
            }),
            self.inner.connections.subscribe_to_disconnect(move |connection| {
                let _ = on_disconnect.send(Work::Disconnected(connection.instance_id()));
            }),
        ];

        let (stop, mut stopped) = oneshot::channel();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut refresh = tokio::time::interval(inner.settings.refresh_interval);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut table_log = tokio::time::interval(inner.settings.report_interval);
            table_log.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    Some(work) = queue.recv() => match work {
                        Work::Connected(connection) => {
                            inner.on_connected(connection).await;
                        }
                        Work::Disconnected(instance) => {
                            inner.on_disconnected(instance).await;
                        }
                        Work::Refresh(done) => {
                            let summary = inner.refresh().await;
                            if let Some(done) = done {
                                let _ = done.send(summary);
                            }
                        }
                    },
                    _ = refresh.tick() => {
                        inner.refresh().await;
                    }
                    _ = table_log.tick() => inner.log_table(),
                }
            }
        });

        *running = Some(Running { subscriptions, work, stop, task });
        info!(interval = ?self.inner.settings.refresh_interval, "Invoker registry started.");
        Ok(())
    }

    /// Unsubscribes, stops the worker with a bounded wait, and clears the table.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { subscriptions, work, stop, mut task }) = self.running.lock().await.take() else {
            return Err(ClusterError::illegal_state("Not running."));
        };

        drop(subscriptions);
        drop(work);
        let _ = stop.send(());
        let timeout = self.inner.settings.shutdown_timeout;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!(timeout = ?timeout, "Registry worker did not stop in time. Aborting.");
            task.abort();
        }

        let summary = self.inner.snapshot.clear(&StopInvokers).await;
        info!(removed = summary.removed, "Invoker registry stopped.");
        Ok(())
    }

    /// Runs one refresh on the worker and waits for its commit.
    pub async fn refresh_now(&self) -> Result<CommitSummary> {
        let work = match self.running.lock().await.as_ref() {
            Some(running) => running.work.clone(),
            None => return Err(ClusterError::illegal_state("Not running.")),
        };
        let (done, summary) = oneshot::channel();
        work.send(Work::Refresh(Some(done)))
            .map_err(|_| ClusterError::illegal_state("Registry worker stopped."))?;
        summary
            .await
            .map_err(|_| ClusterError::illegal_state("Registry worker stopped."))
    }

    pub fn remote_invoker(&self, node: &NodeId) -> Result<Arc<RemoteInvoker>> {
        self.inner.snapshot.remote_invoker(node)
    }

    pub fn best_invoker_for_application(&self, application: ApplicationId) -> Result<Arc<RemoteInvoker>> {
        self.inner.snapshot.best_invoker_for_application(application)
    }

    pub fn all_invokers_for_application(&self, application: ApplicationId) -> Vec<Arc<RemoteInvoker>> {
        self.inner.snapshot.all_invokers_for_application(application)
    }

    pub fn all_invokers(&self) -> Vec<Arc<RemoteInvoker>> {
        self.inner.snapshot.all_invokers()
    }
}

impl InvokerSource for InvokerRegistry {
    fn best_for_application(&self, application: ApplicationId) -> Result<Arc<RemoteInvoker>> {
        self.best_invoker_for_application(application)
    }

    fn for_node(&self, node: &NodeId) -> Result<Arc<RemoteInvoker>> {
        self.remote_invoker(node)
    }
}
