//! # Instance Connection Service
//!
//! Turns discovered hosts into live, identified instance connections.
//!
//! ## Handshake
//!
//! 1. Open a control connection to the host and ask for its status.
//! 2. Tell the local control service to connect the instance's data plane and pair it
//!    with the control address.
//! 3. Register the connection as active and publish a connect event.
//!
//! Any failure leaves no trace: the pending mark is cleared and nothing is published.
//!
//! ## Invariants
//! - At most one connect per control address is in flight.
//! - Undiscovery, control-link death, and an explicit `disconnect` all converge on the
//!   same teardown, which runs once per connection.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use elwire::InstanceId;
use elwire::NodeId;
use elwire::StatusResponse;

use crate::control::ControlService;
use crate::control::client::ControlClient;
use crate::discovery::InstanceDiscoveryService;
use crate::discovery::InstanceHostInfo;
use crate::error::ClusterError;
use crate::error::Result;
use crate::publisher::Dispatcher;
use crate::publisher::Publisher;
use crate::publisher::Subscription;

/// What a control handshake learned about one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMetadata {
    pub instance_id: InstanceId,
    pub invoker_address: String,
    pub load: f64,
    pub nodes: Vec<NodeId>,
}

impl From<StatusResponse> for InstanceMetadata {
    fn from(status: StatusResponse) -> Self {
        Self {
            instance_id: status.instance_id,
            invoker_address: status.invoker_address,
            load: status.load,
            nodes: status.nodes,
        }
    }
}

/// A live binding to one remote instance.
pub struct InstanceConnection {
    host: InstanceHostInfo,
    client: ControlClient,
    control: Arc<ControlService>,
    metadata: RwLock<InstanceMetadata>,
}

impl InstanceConnection {
    pub fn instance_id(&self) -> InstanceId {
        self.metadata.read().instance_id
    }

    pub fn host(&self) -> &InstanceHostInfo {
        &self.host
    }

    pub fn control_address(&self) -> &str {
        self.host.connect_address()
    }

    /// The metadata of the last successful fetch.
    pub fn metadata(&self) -> InstanceMetadata {
        self.metadata.read().clone()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.metadata.read().nodes.clone()
    }

    pub fn load(&self) -> f64 {
        self.metadata.read().load
    }

    /// Asks the instance for fresh status and caches it.
    pub async fn fetch_metadata(&self, timeout: Duration) -> Result<InstanceMetadata> {
        let status = tokio::time::timeout(timeout, self.client.status())
            .await
            .map_err(|_| ClusterError::Timeout(format!("Metadata from {}", self.host)))??;

        let expected = self.instance_id();
        if status.instance_id != expected {
            return Err(ClusterError::illegal_state(format!(
                "{} now answers as {}, expected {}",
                self.host, status.instance_id, expected
            )));
        }

        let metadata = InstanceMetadata::from(status);
        *self.metadata.write() = metadata.clone();
        Ok(metadata)
    }

    /// Opens an in-process route to `node` and returns its connect address.
    ///
    /// Reconnects the data plane first when its link was lost.
    pub async fn open_route(&self, node: &NodeId) -> Result<String> {
        let metadata = self.metadata();
        if node.instance_id() != metadata.instance_id {
            return Err(ClusterError::not_found(format!("{} is not hosted by {}", node, metadata.instance_id)));
        }
        self.control
            .connect_instance(&metadata.invoker_address, self.control_address())
            .await?;
        self.control.connect_node(&metadata.invoker_address, node).await
    }

    /// Disconnects the data plane and closes the control link.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.control.disconnect_instance(self.control_address()).await;
        self.client.close().await;
        result
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Resolves once the control link died.
    pub async fn closed(&self) {
        self.client.closed().await
    }
}

impl std::fmt::Debug for InstanceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceConnection")
            .field("host", &self.host)
            .field("metadata", &*self.metadata.read())
            .finish()
    }
}

struct Inner {
    discovery: Arc<InstanceDiscoveryService>,
    control: Arc<ControlService>,
    connect_timeout: Duration,
    active: DashMap<String, Arc<InstanceConnection>>,
    pending: SyncMutex<HashSet<String>>,
    on_connect: Publisher<Arc<InstanceConnection>>,
    on_disconnect: Publisher<Arc<InstanceConnection>>,
    dispatcher: Dispatcher,
}

impl Inner {
    async fn connect(self: &Arc<Self>, host: InstanceHostInfo) -> Result<Arc<InstanceConnection>> {
        let address = host.connect_address().to_string();
        if let Some(existing) = self.active.get(&address) {
            return Ok(existing.clone());
        }
        if !self.pending.lock().insert(address.clone()) {
            return Err(ClusterError::illegal_state(format!("Connect to {} already pending.", address)));
        }

        let result = self.handshake(host).await;
        self.pending.lock().remove(&address);

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                warn!(address = %address, error = %e, "Instance connect failed.");
                return Err(e);
            }
        };

        self.active.insert(address.clone(), connection.clone());
        self.watch(&connection);
        info!(
            address = %address,
            instance = %connection.instance_id(),
            nodes = connection.nodes().len(),
            "Connected instance."
        );
        self.on_connect.publish_async(connection.clone());
        Ok(connection)
    }

    async fn handshake(&self, host: InstanceHostInfo) -> Result<Arc<InstanceConnection>> {
        let address = host.connect_address().to_string();
        let client = ControlClient::connect(&address, self.connect_timeout).await?;

        let status = match tokio::time::timeout(self.connect_timeout, client.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                client.close().await;
                return Err(e);
            }
            Err(_) => {
                client.close().await;
                return Err(ClusterError::Timeout(format!("Status from {}", address)));
            }
        };

        if let Err(e) = self.control.connect_instance(&status.invoker_address, &address).await {
            client.close().await;
            return Err(e);
        }

        Ok(Arc::new(InstanceConnection {
            host,
            client,
            control: self.control.clone(),
            metadata: RwLock::new(InstanceMetadata::from(status)),
        }))
    }

    /// Disconnects `address` when the control link of `connection` dies.
    fn watch(self: &Arc<Self>, connection: &Arc<InstanceConnection>) {
        let inner: Weak<Self> = Arc::downgrade(self);
        let watched = Arc::downgrade(connection);
        tokio::spawn(async move {
            let Some(connection) = watched.upgrade() else {
                return;
            };
            connection.closed().await;
            let address = connection.control_address().to_string();
            drop(connection);
            if let Some(inner) = inner.upgrade() {
                if inner.disconnect_if(&address, &watched).await {
                    warn!(address = %address, "Control link lost. Instance disconnected.");
                }
            }
        });
    }

    /// Disconnects `address` only if it is still served by `expected`.
    async fn disconnect_if(&self, address: &str, expected: &Weak<InstanceConnection>) -> bool {
        let current = self
            .active
            .remove_if(address, |_, conn| Weak::ptr_eq(&Arc::downgrade(conn), expected));
        match current {
            Some((_, connection)) => {
                self.finish_disconnect(connection).await;
                true
            }
            None => false,
        }
    }

    async fn disconnect(&self, address: &str) -> bool {
        match self.active.remove(address) {
            Some((_, connection)) => {
                self.finish_disconnect(connection).await;
                true
            }
            None => false,
        }
    }

    async fn finish_disconnect(&self, connection: Arc<InstanceConnection>) {
        if let Err(e) = connection.disconnect().await {
            debug!(address = %connection.host(), error = %e, "Instance routes already gone.");
        }
        info!(address = %connection.host(), instance = %connection.instance_id(), "Disconnected instance.");
        self.on_disconnect.publish_async(connection);
    }

    /// Connects known hosts that are not connected and drops connections to hosts that
    /// are no longer known.
    async fn reconcile(self: &Arc<Self>) {
        let known: BTreeSet<InstanceHostInfo> = self.discovery.known_hosts().into_iter().collect();

        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|entry| !known.iter().any(|h| h.connect_address() == entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for address in stale {
            debug!(address = %address, "Dropping connection to unknown host.");
            self.disconnect(&address).await;
        }

        for host in known {
            let address = host.connect_address();
            if self.active.contains_key(address) || self.pending.lock().contains(address) {
                continue;
            }
            let _ = self.connect(host).await;
        }
    }

    fn log_status(&self) {
        let mut addresses: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        addresses.sort();
        info!(
            active = addresses.len(),
            pending = self.pending.lock().len(),
            hosts = ?addresses,
            "Instance connection status."
        );
    }
}

struct Running {
    subscriptions: Vec<Subscription>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Maintains one `InstanceConnection` per discovered host.
pub struct InstanceConnectionService {
    inner: Arc<Inner>,
    refresh_interval: Duration,
    report_interval: Duration,
    shutdown_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl InstanceConnectionService {
    pub fn new(
        discovery: Arc<InstanceDiscoveryService>,
        control: Arc<ControlService>,
        connect_timeout: Duration,
        refresh_interval: Duration,
        report_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let dispatcher = Dispatcher::spawn("connections");
        Self {
            inner: Arc::new(Inner {
                discovery,
                control,
                connect_timeout,
                active: DashMap::new(),
                pending: SyncMutex::new(HashSet::new()),
                on_connect: Publisher::new(dispatcher.clone()),
                on_disconnect: Publisher::new(dispatcher.clone()),
                dispatcher,
            }),
            refresh_interval,
            report_interval,
            shutdown_timeout,
            running: Mutex::new(None),
        }
    }

    /// Subscribes to discovery, connects every known host, and starts the periodic
    /// reconcile.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ClusterError::illegal_state("Already started."));
        }

        let on_discover = Arc::downgrade(&self.inner);
        let on_undiscover = Arc::downgrade(&self.inner);
        let subscriptions = vec![
            self.inner.discovery.subscribe_to_discovery(move |host| {
                if let Some(inner) = on_discover.upgrade() {
                    let host = host.clone();
                    tokio::spawn(async move {
                        let _ = inner.connect(host).await;
                    });
                }
            }),
            self.inner.discovery.subscribe_to_undiscovery(move |host| {
                if let Some(inner) = on_undiscover.upgrade() {
                    let address = host.connect_address().to_string();
                    tokio::spawn(async move {
                        inner.disconnect(&address).await;
                    });
                }
            }),
        ];

        self.inner.reconcile().await;

        let (stop, mut stopped) = oneshot::channel();
        let inner = self.inner.clone();
        let period = self.refresh_interval;
        let report = self.report_interval;
        let task = tokio::spawn(async move {
            let mut refresh = tokio::time::interval(period);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            refresh.tick().await;
            let mut status = tokio::time::interval(report);
            status.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = refresh.tick() => inner.reconcile().await,
                    _ = status.tick() => inner.log_status(),
                }
            }
        });

        *running = Some(Running { subscriptions, stop, task });
        info!(interval = ?self.refresh_interval, "Instance connection service started.");
        Ok(())
    }

    /// Unsubscribes, stops the reconcile task, and disconnects every instance.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { subscriptions, stop, mut task }) = self.running.lock().await.take() else {
            return Err(ClusterError::illegal_state("Not running."));
        };

        drop(subscriptions);
        let _ = stop.send(());
        if tokio::time::timeout(self.shutdown_timeout, &mut task).await.is_err() {
            warn!(timeout = ?self.shutdown_timeout, "Connection reconcile did not stop in time. Aborting.");
            task.abort();
        }

        let addresses: Vec<String> = self.inner.active.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            self.inner.disconnect(&address).await;
        }
        info!("Instance connection service stopped.");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn connect(&self, host: InstanceHostInfo) -> Result<Arc<InstanceConnection>> {
        self.inner.connect(host).await
    }

    /// Returns false when `address` had no active connection.
    pub async fn disconnect(&self, address: &str) -> bool {
        self.inner.disconnect(address).await
    }

    /// Active connections, sorted by control address.
    pub fn active_connections(&self) -> Vec<Arc<InstanceConnection>> {
        let mut connections: Vec<Arc<InstanceConnection>> = self.inner.active.iter().map(|e| e.value().clone()).collect();
        connections.sort_by(|a, b| a.host().cmp(b.host()));
        connections
    }

    pub fn connection_for_instance(&self, instance: InstanceId) -> Option<Arc<InstanceConnection>> {
        self.inner
            .active
            .iter()
            .find(|e| e.value().instance_id() == instance)
            .map(|e| e.value().clone())
    }

    /// Opens a route to `node` through the connection to its instance.
    pub async fn get_route(&self, node: &NodeId) -> Result<String> {
        let connection = self
            .connection_for_instance(node.instance_id())
            .ok_or_else(|| ClusterError::not_found(format!("No connection to {}", node.instance_id())))?;
        connection.open_route(node).await
    }

    pub fn subscribe_to_connect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<InstanceConnection>) + Send + Sync + 'static,
    {
        self.inner.on_connect.subscribe(listener)
    }

    pub fn subscribe_to_disconnect<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<InstanceConnection>) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.subscribe(listener)
    }

    pub fn control(&self) -> &Arc<ControlService> {
        &self.inner.control
    }

    /// Resolves once every connect/disconnect event published so far was delivered.
    pub async fn flush(&self) {
        self.inner.dispatcher.flush().await;
    }
}
