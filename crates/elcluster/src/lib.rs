//! # elcluster
//!
//! Clustering and remote invocation for a fleet of application-server instances.
//!
//! An instance hosts nodes (one per application it serves). This crate finds the other
//! instances, opens routes to the nodes they host, keeps a load-ordered routing table
//! that can be read without locks, and dispatches remote calls through it.
//!
//! ## Layers
//!
//! - `discovery`: which control addresses are reachable.
//! - `control`: the connection-processing loop that owns every data-plane socket,
//!   plus the control server and client.
//! - `connection`: one identified `InstanceConnection` per reachable host.
//! - `invoker`: calls over one route, under four calling conventions.
//! - `registry`: the routing snapshot and the service that keeps it current.
//! - `proxy`: declarative service descriptions turned into callable proxies.
//! - `cluster`: all of the above, started and stopped as a unit.

pub mod cluster;
pub mod config;
pub mod connection;
pub mod control;
pub mod discovery;
pub mod error;
pub mod instance_id;
pub mod invoker;
pub mod logging;
pub mod mock_transport;
pub mod proxy;
pub mod publisher;
pub mod registry;
pub mod routes;
pub mod transport;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use config::DiscoveryStrategy;
pub use connection::InstanceConnection;
pub use connection::InstanceConnectionService;
pub use connection::InstanceMetadata;
pub use control::ControlService;
pub use control::InvocationDispatcher;
pub use control::LocalInstance;
pub use control::ReplySink;
pub use discovery::InstanceDiscoveryService;
pub use discovery::InstanceHostInfo;
pub use error::ClusterError;
pub use error::Result;
pub use invoker::Callbacks;
pub use invoker::RedirectingInvoker;
pub use invoker::RemoteInvoker;
pub use invoker::Request;
pub use invoker::ReturnShape;
pub use invoker::Staged;
pub use proxy::Proxy;
pub use proxy::ProxyBuilder;
pub use registry::InvokerRegistry;
pub use registry::InvokerSource;
pub use registry::Snapshot;
pub use transport::Transport;

pub use elwire::ApplicationId;
pub use elwire::DispatchType;
pub use elwire::InstanceId;
pub use elwire::Invocation;
pub use elwire::NodeId;

#[cfg(test)]
mod tests;
