//! SRV-record naming sources.
//!
//! Two interchangeable resolvers: one follows the host's resolver configuration, the
//! other queries an explicit list of naming servers in order, failing over on error.
//! Both disable caching so every poll sees current records.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::net::SocketAddr;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::NameServerConfigGroup;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::error::ResolveError;
use hickory_resolver::error::ResolveErrorKind;
use tracing::debug;

use super::naming::InstanceHostInfo;
use super::naming::Lookup;
use super::naming::NamingError;
use super::naming::NamingSource;

const DEFAULT_DNS_PORT: u16 = 53;

fn uncached() -> ResolverOpts {
    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts
}

async fn lookup(resolver: &TokioAsyncResolver, query: &str) -> Result<Lookup, ResolveError> {
    match resolver.srv_lookup(query).await {
        Ok(answer) => {
            let hosts: BTreeSet<InstanceHostInfo> = answer
                .iter()
                .map(|srv| {
                    InstanceHostInfo::from_srv(&srv.target().to_utf8(), srv.port(), srv.priority(), srv.weight())
                })
                .collect();
            if hosts.is_empty() { Ok(Lookup::NotFound) } else { Ok(Lookup::Found(hosts)) }
        }
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Lookup::NotFound),
        Err(e) => Err(e),
    }
}

/// SRV lookups through `/etc/resolv.conf` (or the platform equivalent).
pub struct SystemSrvNaming {
    query: String,
    resolver: TokioAsyncResolver,
}

impl SystemSrvNaming {
    pub fn new(query: impl Into<String>) -> Result<Self, NamingError> {
        let (config, _) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| NamingError::Unavailable(e.to_string()))?;
        Ok(Self {
            query: query.into(),
            resolver: TokioAsyncResolver::tokio(config, uncached()),
        })
    }
}

#[async_trait::async_trait]
impl NamingSource for SystemSrvNaming {
    async fn query(&self) -> Result<Lookup, NamingError> {
        lookup(&self.resolver, &self.query)
            .await
            .map_err(|e| NamingError::Query(e.to_string()))
    }
}

/// SRV lookups against an explicit naming-server list.
///
/// Servers are tried in configured order; the first that answers, with records or
/// with "not found", decides the result.
pub struct ServerListSrvNaming {
    query: String,
    resolvers: Vec<(SocketAddr, TokioAsyncResolver)>,
}

impl ServerListSrvNaming {
    pub fn new(query: impl Into<String>, servers: &[String]) -> Result<Self, NamingError> {
        if servers.is_empty() {
            return Err(NamingError::Unavailable("No naming servers configured.".into()));
        }

        let mut resolvers = Vec::with_capacity(servers.len());
        for server in servers {
            let addr = parse_server(server)?;
            let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            resolvers.push((addr, TokioAsyncResolver::tokio(config, uncached())));
        }

        Ok(Self { query: query.into(), resolvers })
    }
}

/// Accepts `ip`, `ip:port`, and `dns://ip[:port]`.
fn parse_server(server: &str) -> Result<SocketAddr, NamingError> {
    let raw = server.trim();
    let raw = raw.strip_prefix("dns://").unwrap_or(raw);
    let raw = raw.trim_end_matches('/');
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    raw.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| NamingError::Unavailable(format!("Invalid naming server: {}", server)))
}

#[async_trait::async_trait]
impl NamingSource for ServerListSrvNaming {
    async fn query(&self) -> Result<Lookup, NamingError> {
        let mut failures = Vec::new();
        for (server, resolver) in &self.resolvers {
            match lookup(resolver, &self.query).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    debug!(server = %server, error = %e, "Naming server failed. Trying next.");
                    failures.push(format!("{}: {}", server, e));
                }
            }
        }
        Err(NamingError::Query(failures.join("; ")))
    }
}
