//! # Cluster
//!
//! Wires every service of one instance together and runs them as a unit.
//!
//! Start order: data-plane listener, control server, discovery, instance connections,
//! invoker registry. Stop runs in reverse and keeps going past failures; every failure
//! is reported in one `Aggregate` error.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use elwire::ApplicationId;
use elwire::InstanceId;
use elwire::NodeId;

use crate::config::ClusterConfig;
use crate::connection::InstanceConnectionService;
use crate::control::ControlService;
use crate::control::InvocationDispatcher;
use crate::control::LocalInstance;
use crate::control::server::ControlServer;
use crate::discovery::InstanceDiscoveryService;
use crate::discovery::NamingSource;
use crate::discovery::naming_source;
use crate::error::ClusterError;
use crate::error::Result;
use crate::instance_id::FileInstanceIdStore;
use crate::instance_id::load_or_create;
use crate::proxy::Proxy;
use crate::proxy::ProxyBuilder;
use crate::proxy::ServiceDescriptor;
use crate::registry::InvokerRegistry;
use crate::registry::InvokerSource;
use crate::registry::RegistrySettings;

pub struct Cluster {
    config: ClusterConfig,
    local: Arc<LocalInstance>,
    control: Arc<ControlService>,
    server: Mutex<Option<ControlServer>>,
    discovery: Arc<InstanceDiscoveryService>,
    connections: Arc<InstanceConnectionService>,
    registry: Arc<InvokerRegistry>,
}

impl Cluster {
    /// Builds the services described by `config`, reading or creating the persisted
    /// instance id.
    pub fn new(config: ClusterConfig, dispatcher: Arc<dyn InvocationDispatcher>) -> Result<Self> {
        let instance_id = load_or_create(&FileInstanceIdStore::new(config.instance_id_file.clone()))?;
        let naming = naming_source(&config)?;
        Ok(Self::with_parts(config, instance_id, naming, dispatcher))
    }

    /// Builds the services around an explicit instance id and naming source.
    pub fn with_parts(
        config: ClusterConfig,
        instance_id: InstanceId,
        naming: Arc<dyn NamingSource>,
        dispatcher: Arc<dyn InvocationDispatcher>,
    ) -> Self {
        let local = Arc::new(LocalInstance::new(instance_id, config.invoker_bind.clone()));
        let control = ControlService::start(local.clone(), dispatcher, config.connect_timeout);
        let discovery = Arc::new(InstanceDiscoveryService::new(
            naming,
            config.poll_interval,
            config.shutdown_timeout,
        ));
        let connections = Arc::new(InstanceConnectionService::new(
            discovery.clone(),
            control.clone(),
            config.connect_timeout,
            config.connection_refresh,
            config.report_interval,
            config.shutdown_timeout,
        ));
        let registry = Arc::new(InvokerRegistry::new(connections.clone(), control.clone(), RegistrySettings {
            refresh_interval: config.registry_refresh,
            metadata_timeout: config.metadata_timeout,
            connect_timeout: config.connect_timeout,
            call_timeout: config.call_timeout,
            shutdown_timeout: config.shutdown_timeout,
            report_interval: config.report_interval,
        }));

        Self {
            config,
            local,
            control,
            server: Mutex::new(None),
            discovery,
            connections,
            registry,
        }
    }

    /// Opens both listeners, then starts discovery, connections, and the registry.
    ///
    /// A failing step stops whatever this call already started before the error is
    /// returned.
    pub async fn start(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(ClusterError::illegal_state("Already started."));
        }

        let invoker_address = self.control.bind_address(&self.config.invoker_bind).await?;
        let control_server = match ControlServer::bind(&self.config.control_bind, self.control.clone()).await {
            Ok(control_server) => control_server,
            Err(e) => {
                self.roll_back(0, None, &invoker_address).await;
                return Err(e);
            }
        };
        if let Err((e, started)) = self.start_services().await {
            self.roll_back(started, Some(control_server), &invoker_address).await;
            return Err(e);
        }

        info!(
            instance = %self.local.instance_id(),
            invoker = %invoker_address,
            control = %control_server.address(),
            "Cluster started."
        );
        *server = Some(control_server);
        Ok(())
    }

    /// Starts discovery, connections, and the registry in order. On failure, reports how
    /// many of them are running.
    async fn start_services(&self) -> std::result::Result<(), (ClusterError, usize)> {
        self.discovery.start().await.map_err(|e| (e, 0))?;
        self.connections.start().await.map_err(|e| (e, 1))?;
        self.registry.start().await.map_err(|e| (e, 2))?;
        Ok(())
    }

    async fn roll_back(&self, started: usize, server: Option<ControlServer>, invoker_address: &str) {
        let mut failures = Vec::new();
        if started >= 2 {
            failures.extend(self.connections.stop().await.err());
        }
        if started >= 1 {
            failures.extend(self.discovery.stop().await.err());
        }
        if let Some(server) = server {
            server.stop();
        }
        failures.extend(self.control.unbind_address(invoker_address).await.err());

        for e in &failures {
            warn!(error = %e, "Rollback step failed.");
        }
        warn!(instance = %self.local.instance_id(), "Cluster start failed. Rolled back.");
    }

    /// Stops every service in reverse start order, collecting failures.
    pub async fn stop(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.registry.stop().await {
            errors.push(e);
        }
        if let Err(e) = self.connections.stop().await {
            errors.push(e);
        }
        if let Err(e) = self.discovery.stop().await {
            errors.push(e);
        }
        match self.server.lock().await.take() {
            Some(server) => server.stop(),
            None => errors.push(ClusterError::illegal_state("Control server not running.")),
        }
        if let Err(e) = self.control.stop(self.config.shutdown_timeout).await {
            errors.push(e);
        }

        if !errors.is_empty() {
            warn!(failures = errors.len(), "Cluster stopped with failures.");
        } else {
            info!(instance = %self.local.instance_id(), "Cluster stopped.");
        }
        ClusterError::collect(errors)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.local.instance_id()
    }

    pub fn local(&self) -> &Arc<LocalInstance> {
        &self.local
    }

    pub fn control(&self) -> &Arc<ControlService> {
        &self.control
    }

    pub fn discovery(&self) -> &Arc<InstanceDiscoveryService> {
        &self.discovery
    }

    pub fn connections(&self) -> &Arc<InstanceConnectionService> {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<InvokerRegistry> {
        &self.registry
    }

    /// The control address peers connect to, once started.
    pub async fn control_address(&self) -> Option<String> {
        self.server.lock().await.as_ref().map(|s| s.address().to_string())
    }

    /// Hosts `application` on this instance.
    pub async fn bind_application(&self, application: ApplicationId) -> Result<NodeId> {
        self.control.bind_node(application).await
    }

    pub async fn unbind_application(&self, application: ApplicationId) -> Result<()> {
        self.control.unbind_node(application).await
    }

    /// A proxy for `service` routed through this instance's registry.
    pub fn proxy(&self, service: ServiceDescriptor) -> Result<Proxy> {
        let source: Arc<dyn InvokerSource> = self.registry.clone();
        ProxyBuilder::new().build(service, source)
    }
}
