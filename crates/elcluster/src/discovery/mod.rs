//! # Instance Discovery
//!
//! Keeps the best-known set of reachable hosts for one naming query and announces
//! changes to it.
//!
//! ## Algorithm
//!
//! Every poll queries the naming source for a record set `U` and compares it with the
//! previous set `P`:
//! - `U == P`: nothing happens.
//! - otherwise `U − P` is published as discoveries and `P − U` as undiscoveries.
//! - "not found" clears `P` and publishes every former member as an undiscovery.
//! - any other failure is logged and retried on the next tick.
//!
//! `start()` returns only after the first poll, so callers never see an empty host set
//! just because the poller had not run yet.

pub mod naming;
pub mod srv;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ClusterConfig;
use crate::config::DiscoveryStrategy;
use crate::error::ClusterError;
use crate::error::Result;
use crate::publisher::Dispatcher;
use crate::publisher::Publisher;
use crate::publisher::Subscription;

pub use naming::InstanceHostInfo;
pub use naming::Lookup;
pub use naming::NamingError;
pub use naming::NamingSource;
pub use naming::StaticNaming;
pub use srv::ServerListSrvNaming;
pub use srv::SystemSrvNaming;

/// The naming source selected by `config.strategy`.
pub fn naming_source(config: &ClusterConfig) -> Result<Arc<dyn NamingSource>> {
    let source: Arc<dyn NamingSource> = match config.strategy {
        DiscoveryStrategy::Static => Arc::new(StaticNaming::new(config.static_hosts.iter().cloned())),
        DiscoveryStrategy::SystemSrv => Arc::new(
            SystemSrvNaming::new(config.srv_query.clone()).map_err(|e| ClusterError::Config(e.to_string()))?,
        ),
        DiscoveryStrategy::ServerListSrv => Arc::new(
            ServerListSrvNaming::new(config.srv_query.clone(), &config.srv_servers)
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        ),
    };
    Ok(source)
}

/// The change one poll produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Update {
    pub hosts: BTreeSet<InstanceHostInfo>,
    pub added: Vec<InstanceHostInfo>,
    pub removed: Vec<InstanceHostInfo>,
}

/// Compares a lookup against the previous host set. `None` means no change.
pub(crate) fn reconcile(previous: &BTreeSet<InstanceHostInfo>, lookup: Lookup) -> Option<Update> {
    let current = match lookup {
        Lookup::Found(hosts) => hosts,
        Lookup::NotFound => BTreeSet::new(),
    };
    if &current == previous {
        return None;
    }

    let added = current.difference(previous).cloned().collect();
    let removed = previous.difference(&current).cloned().collect();
    Some(Update { hosts: current, added, removed })
}

struct Inner {
    naming: Arc<dyn NamingSource>,
    known: RwLock<Arc<BTreeSet<InstanceHostInfo>>>,
    discover: Publisher<InstanceHostInfo>,
    undiscover: Publisher<InstanceHostInfo>,
    dispatcher: Dispatcher,
}

impl Inner {
    async fn poll(&self) {
        let lookup = match self.naming.query().await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(error = %e, "Discovery query failed. Retrying next tick.");
                return;
            }
        };

        if lookup == Lookup::NotFound && !self.known.read().is_empty() {
            warn!("No hosts found. Dropping every known host.");
        }

        // Events are queued under the write lock so their order follows update order.
        let mut known = self.known.write();
        let Some(update) = reconcile(&known, lookup) else {
            return;
        };
        *known = Arc::new(update.hosts.clone());

        info!(
            hosts = update.hosts.len(),
            added = update.added.len(),
            removed = update.removed.len(),
            "Discovery update."
        );

        for host in update.removed {
            debug!(host = %host, "Undiscovered host.");
            self.undiscover.publish_async(host);
        }
        for host in update.added {
            debug!(host = %host, "Discovered host.");
            self.discover.publish_async(host);
        }
    }
}

struct Poller {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Polls a naming source and tracks the known host set.
pub struct InstanceDiscoveryService {
    inner: Arc<Inner>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    poller: Mutex<Option<Poller>>,
}

impl InstanceDiscoveryService {
    pub fn new(naming: Arc<dyn NamingSource>, poll_interval: Duration, shutdown_timeout: Duration) -> Self {
        let dispatcher = Dispatcher::spawn("discovery");
        Self {
            inner: Arc::new(Inner {
                naming,
                known: RwLock::new(Arc::new(BTreeSet::new())),
                discover: Publisher::new(dispatcher.clone()),
                undiscover: Publisher::new(dispatcher.clone()),
                dispatcher,
            }),
            poll_interval,
            shutdown_timeout,
            poller: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        Ok(Self::new(naming_source(config)?, config.poll_interval, config.shutdown_timeout))
    }

    /// Runs the first poll, then keeps polling on a dedicated task.
    pub async fn start(&self) -> Result<()> {
        let mut poller = self.poller.lock().await;
        if poller.is_some() {
            return Err(ClusterError::illegal_state("Already started."));
        }

        self.inner.poll().await;

        let (stop, mut stopped) = oneshot::channel();
        let inner = self.inner.clone();
        let period = self.poll_interval;
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticks.tick() => inner.poll().await,
                }
            }
        });

        *poller = Some(Poller { stop, task });
        info!(interval = ?self.poll_interval, "Discovery started.");
        Ok(())
    }

    /// Stops polling with a bounded wait, then closes the naming source regardless.
    pub async fn stop(&self) -> Result<()> {
        let Some(Poller { stop, mut task }) = self.poller.lock().await.take() else {
            return Err(ClusterError::illegal_state("Not running."));
        };

        let _ = stop.send(());
        match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(())) => debug!("Discovery poller stopped."),
            Ok(Err(e)) => warn!(error = %e, "Discovery poller ended abnormally."),
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Discovery poller did not stop in time. Aborting.");
                task.abort();
            }
        }

        self.inner.naming.close().await;
        info!("Discovery stopped.");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.poller.lock().await.is_some()
    }

    /// Polls once, out of schedule.
    pub async fn poll_now(&self) {
        self.inner.poll().await;
    }

    /// A point-in-time copy of the known hosts, sorted by connect address.
    pub fn known_hosts(&self) -> Vec<InstanceHostInfo> {
        self.inner.known.read().iter().cloned().collect()
    }

    pub fn subscribe_to_discovery<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&InstanceHostInfo) + Send + Sync + 'static,
    {
        self.inner.discover.subscribe(listener)
    }

    pub fn subscribe_to_undiscovery<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&InstanceHostInfo) + Send + Sync + 'static,
    {
        self.inner.undiscover.subscribe(listener)
    }

    /// Resolves once every event published so far has been delivered.
    pub async fn flush(&self) {
        self.inner.dispatcher.flush().await;
    }
}
