//! Naming sources: where the set of reachable instances comes from.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::hash::Hasher;

use parking_lot::RwLock;

/// A discovered endpoint.
///
/// Identity is the connect address alone; priority and weight are advisory. The
/// instance behind the address is only known after a control handshake.
#[derive(Debug, Clone)]
pub struct InstanceHostInfo {
    connect_address: String,
    priority: u16,
    weight: u16,
}

impl InstanceHostInfo {
    pub fn new(connect_address: impl Into<String>) -> Self {
        Self { connect_address: connect_address.into(), priority: 0, weight: 0 }
    }

    /// Builds the host from one SRV answer. The target's trailing dot is dropped.
    pub fn from_srv(target: &str, port: u16, priority: u16, weight: u16) -> Self {
        let host = target.strip_suffix('.').unwrap_or(target);
        Self {
            connect_address: format!("tcp://{}:{}", host, port),
            priority,
            weight,
        }
    }

    pub fn connect_address(&self) -> &str {
        &self.connect_address
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }
}

impl PartialEq for InstanceHostInfo {
    fn eq(&self, other: &Self) -> bool {
        self.connect_address == other.connect_address
    }
}

impl Eq for InstanceHostInfo {}

impl Hash for InstanceHostInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connect_address.hash(state);
    }
}

impl PartialOrd for InstanceHostInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InstanceHostInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.connect_address.cmp(&other.connect_address)
    }
}

impl std::fmt::Display for InstanceHostInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.connect_address)
    }
}

/// Outcome of one naming query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(BTreeSet<InstanceHostInfo>),
    /// The name exists in no naming server: there are no hosts.
    NotFound,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NamingError {
    /// The resolver could not be configured.
    #[error("Naming source unavailable: {0}")]
    Unavailable(String),
    /// The query failed for a reason other than the name not existing.
    #[error("Naming query failed: {0}")]
    Query(String),
}

/// A source of host records for one query.
#[async_trait::async_trait]
pub trait NamingSource: Send + Sync + 'static {
    async fn query(&self) -> Result<Lookup, NamingError>;

    /// Releases resolver resources. Called once when discovery stops.
    async fn close(&self) {}
}

/// A configured host set. `replace` swaps it wholesale; the next poll sees the change.
pub struct StaticNaming {
    hosts: RwLock<BTreeSet<InstanceHostInfo>>,
}

impl StaticNaming {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { hosts: RwLock::new(collect_hosts(addresses)) }
    }

    pub fn replace<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.hosts.write() = collect_hosts(addresses);
    }
}

fn collect_hosts<I, S>(addresses: I) -> BTreeSet<InstanceHostInfo>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    addresses.into_iter().map(InstanceHostInfo::new).collect()
}

#[async_trait::async_trait]
impl NamingSource for StaticNaming {
    async fn query(&self) -> Result<Lookup, NamingError> {
        let hosts = self.hosts.read();
        if hosts.is_empty() {
            Ok(Lookup::NotFound)
        } else {
            Ok(Lookup::Found(hosts.clone()))
        }
    }
}
