//! # Cluster Configuration
//!
//! Explicit configuration passed at construction. Nothing reads process-wide state: a
//! `ClusterConfig` is built from defaults, builder methods, or a set of named values.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::ClusterError;
use crate::error::Result;

pub const STRATEGY: &str = "cluster.discovery.strategy";
pub const SRV_QUERY: &str = "cluster.discovery.srv.query";
pub const SRV_SERVERS: &str = "cluster.discovery.srv.servers";
pub const STATIC_HOSTS: &str = "cluster.discovery.static.hosts";
pub const POLL_MILLIS: &str = "cluster.discovery.poll.millis";
pub const INSTANCE_ID_FILE: &str = "cluster.instance.id.file";
pub const CONTROL_BIND: &str = "cluster.control.bind";
pub const INVOKER_BIND: &str = "cluster.invoker.bind";
pub const REGISTRY_REFRESH_MILLIS: &str = "cluster.registry.refresh.millis";
pub const CONNECTION_REFRESH_MILLIS: &str = "cluster.connection.refresh.millis";
pub const CONNECT_TIMEOUT_MILLIS: &str = "cluster.timeout.connect.millis";
pub const CALL_TIMEOUT_MILLIS: &str = "cluster.timeout.call.millis";

/// How instances are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryStrategy {
    /// A fixed host set from configuration.
    #[default]
    Static,
    /// SRV lookups through the host's resolver configuration.
    SystemSrv,
    /// SRV lookups against the configured naming servers only.
    ServerListSrv,
}

impl FromStr for DiscoveryStrategy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "static" => Ok(Self::Static),
            "system-srv" => Ok(Self::SystemSrv),
            "server-list-srv" => Ok(Self::ServerListSrv),
            other => Err(ClusterError::Config(format!("unknown discovery strategy: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub strategy: DiscoveryStrategy,
    pub srv_query: String,
    pub srv_servers: Vec<String>,
    pub static_hosts: Vec<String>,
    pub poll_interval: Duration,
    pub instance_id_file: PathBuf,
    pub control_bind: String,
    pub invoker_bind: String,
    pub registry_refresh: Duration,
    pub connection_refresh: Duration,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    /// Bound on metadata fetches during a refresh.
    pub metadata_timeout: Duration,
    /// Bound on waiting for a periodic task to stop.
    pub shutdown_timeout: Duration,
    /// How often the routing table and connection set are logged.
    pub report_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            strategy: DiscoveryStrategy::Static,
            srv_query: "_elements._tcp.internal".into(),
            srv_servers: Vec::new(),
            static_hosts: Vec::new(),
            poll_interval: Duration::from_secs(1),
            instance_id_file: PathBuf::from("instance-id"),
            control_bind: "tcp://127.0.0.1:28883".into(),
            invoker_bind: "tcp://127.0.0.1:28884".into(),
            registry_refresh: Duration::from_secs(30),
            connection_refresh: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            report_interval: Duration::from_secs(15),
        }
    }
}

impl ClusterConfig {
    /// Builds a configuration from named values over the defaults.
    ///
    /// Unknown names are ignored; malformed values are a `Config` error.
    pub fn from_named_values<I, K, V>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in values {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                STRATEGY => config.strategy = value.parse()?,
                SRV_QUERY => config.srv_query = value.trim().to_string(),
                SRV_SERVERS => config.srv_servers = split_list(value),
                STATIC_HOSTS => config.static_hosts = split_list(value),
                POLL_MILLIS => config.poll_interval = millis(key, value)?,
                INSTANCE_ID_FILE => config.instance_id_file = PathBuf::from(value.trim()),
                CONTROL_BIND => config.control_bind = value.trim().to_string(),
                INVOKER_BIND => config.invoker_bind = value.trim().to_string(),
                REGISTRY_REFRESH_MILLIS => config.registry_refresh = millis(key, value)?,
                CONNECTION_REFRESH_MILLIS => config.connection_refresh = millis(key, value)?,
                CONNECT_TIMEOUT_MILLIS => config.connect_timeout = millis(key, value)?,
                CALL_TIMEOUT_MILLIS => config.call_timeout = millis(key, value)?,
                other => debug!(key = other, "Ignoring unknown configuration key."),
            }
        }
        Ok(config)
    }

    pub fn with_strategy(mut self, strategy: DiscoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_static_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_srv(mut self, query: impl Into<String>, servers: Vec<String>) -> Self {
        self.srv_query = query.into();
        self.srv_servers = servers;
        self
    }

    pub fn with_instance_id_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.instance_id_file = path.into();
        self
    }

    pub fn with_binds(mut self, control: impl Into<String>, invoker: impl Into<String>) -> Self {
        self.control_bind = control.into();
        self.invoker_bind = invoker.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_registry_refresh(mut self, interval: Duration) -> Self {
        self.registry_refresh = interval;
        self
    }

    pub fn with_connection_refresh(mut self, interval: Duration) -> Self {
        self.connection_refresh = interval;
        self
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// A positive number of milliseconds.
fn millis(key: &str, value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ClusterError::Config(format!("{}: must be greater than zero", key))),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ClusterError::Config(format!("{}: {}", key, e))),
    }
}
