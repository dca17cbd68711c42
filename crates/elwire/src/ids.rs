//! Cluster identifiers.
//!
//! An `ApplicationId` names a tenant application, an `InstanceId` names one running
//! server process, and a `NodeId` names one logical unit of an application hosted on
//! one instance. NodeIds order by instance first, then application.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::cursor::Reader;
use crate::cursor::Writer;
use crate::error::Result;

/// Identifier of one tenant application.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApplicationId(pub Uuid);

impl ApplicationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app-{}", self.0)
    }
}

/// Identifier of one running server process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.trim();
        let raw = raw.strip_prefix("instance-").unwrap_or(raw);
        Uuid::parse_str(raw).map(Self)
    }
}

/// Identifier of one application unit on one instance.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId {
    instance: InstanceId,
    application: ApplicationId,
}

impl NodeId {
    pub const PACKED_LEN: usize = 32;

    pub fn new(instance: InstanceId, application: ApplicationId) -> Self {
        Self { instance, application }
    }

    /// The node an instance hosts for itself, outside any application.
    pub fn for_master_node(instance: InstanceId) -> Self {
        Self { instance, application: ApplicationId(instance.0) }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn application_id(&self) -> ApplicationId {
        self.application
    }

    pub fn is_master(&self) -> bool {
        self.instance.0 == self.application.0
    }

    /// The 128-bit in-process route name for this node.
    ///
    /// Stable across processes: both ends of a route derive the same value.
    pub fn route_id(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, &self.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; Self::PACKED_LEN] {
        let mut out = [0u8; Self::PACKED_LEN];
        out[..16].copy_from_slice(self.instance.0.as_bytes());
        out[16..].copy_from_slice(self.application.0.as_bytes());
        out
    }

    pub fn write(&self, w: &mut Writer) {
        w.uuid(&self.instance.0);
        w.uuid(&self.application.0);
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self> {
        let instance = InstanceId(r.uuid()?);
        let application = ApplicationId(r.uuid()?);
        Ok(Self { instance, application })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}:{}", self.instance.0, self.application.0)
    }
}
