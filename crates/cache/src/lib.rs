//! The authoritative in-memory view of Services and Endpoints.
//!
//! Two keyed collections, mutated only from event callbacks: `services` and
//! `endpoints`, both indexed by [`ObjectId`]. Neither resource family is
//! indexed by cluster-IP — IP is a value carried by a `Service`, not a key.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::{Deref, DerefMut};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

/// A (namespace, name) pair identifying a Service and its same-named
/// Endpoints object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Layer-4 protocol a `ServicePort` or `NamedPort` may carry.
///
/// An empty protocol string is treated as TCP, matching the source's
/// `port.Protocol != "" && port.Protocol != "TCP"` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            "SCTP" => Protocol::Sctp,
            _ => Protocol::Udp,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp)
    }
}

/// `targetPort` as carried by a `ServicePort`: either numeric or a name that
/// must be resolved against the peer Endpoints subset's named-port list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub port: u16,
    pub target_port: TargetPort,
    pub protocol: Protocol,
}

/// Error returned when a Service object cannot be accepted into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidService {
    pub id: ObjectId,
    pub reason: String,
}

impl fmt::Display for InvalidService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid service {}: {}", self.id, self.reason)
    }
}

impl std::error::Error for InvalidService {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ObjectId,
    pub cluster_ip: Ipv6Addr,
    pub ports: Vec<ServicePort>,
}

impl Service {
    /// Builds a `Service` from loosely-typed fields, rejecting an
    /// unparseable or empty cluster-IP (I1/`InvalidService`).
    pub fn parse(
        id: ObjectId,
        cluster_ip: &str,
        ports: Vec<ServicePort>,
    ) -> Result<Self, InvalidService> {
        if cluster_ip.is_empty() {
            return Err(InvalidService {
                id,
                reason: "empty cluster-IP".into(),
            });
        }

        let parsed: IpAddr = cluster_ip.parse().map_err(|_| InvalidService {
            id: id.clone(),
            reason: format!("unparseable cluster-IP {cluster_ip:?}"),
        })?;

        Ok(Self {
            id,
            cluster_ip: to_ipv6_mapped(parsed),
            ports,
        })
    }
}

/// A named port in an Endpoints subset, used to resolve
/// `TargetPort::Name(_)` by matching the name against this list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPort {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subset {
    /// Ready pod addresses only — `NotReadyAddresses` are ignored at
    /// ingestion (spec rule 4).
    pub addresses: Vec<Ipv6Addr>,
    pub ports: Vec<NamedPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Endpoints {
    pub id: ObjectId,
    pub subsets: Vec<Subset>,
}

impl Endpoints {
    pub fn new(id: ObjectId, subsets: Vec<Subset>) -> Self {
        Self { id, subsets }
    }
}

/// Normalizes any parsed IP literal to its 16-byte IPv6-mapped form
/// (`::ffff:a.b.c.d` for IPv4).
pub fn to_ipv6_mapped(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Parses a pod/cluster IP literal straight into its 16-byte mapped form,
/// returning `None` for anything that doesn't parse (spec rule 2: addresses
/// that don't parse contribute nothing).
pub fn parse_ipv6_mapped(raw: &str) -> Option<Ipv6Addr> {
    raw.parse::<IpAddr>().ok().map(to_ipv6_mapped)
}

/// The default `HashMap` allocates no capacity up front; pre-size it since
/// churn here is one entry per live cluster object, not per packet.
pub struct Table<K, V>(HashMap<K, V>);

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self(HashMap::with_capacity(256))
    }
}

impl<K, V> Deref for Table<K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for Table<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The authoritative, in-memory view of live Services and Endpoints.
///
/// Mutation is only ever performed by the Reconciler's event handlers;
/// readers elsewhere in the process only ever see a consistent snapshot of
/// a single id at a time.
#[derive(Default)]
pub struct ResourceCache {
    services: RwLock<Table<ObjectId, Service>>,
    endpoints: RwLock<Table<ObjectId, Endpoints>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_service(&self, id: &ObjectId) -> Option<Service> {
        self.services.read().get(id).cloned()
    }

    pub fn get_endpoints(&self, id: &ObjectId) -> Option<Endpoints> {
        self.endpoints.read().get(id).cloned()
    }

    /// Stores a Service, returning whichever record previously occupied its
    /// id (the "old" half of an update).
    pub fn put_service(&self, service: Service) -> Option<Service> {
        self.services.write().insert(service.id.clone(), service)
    }

    pub fn put_endpoints(&self, endpoints: Endpoints) -> Option<Endpoints> {
        self.endpoints
            .write()
            .insert(endpoints.id.clone(), endpoints)
    }

    pub fn remove_service(&self, id: &ObjectId) -> Option<Service> {
        self.services.write().remove(id)
    }

    pub fn remove_endpoints(&self, id: &ObjectId) -> Option<Endpoints> {
        self.endpoints.write().remove(id)
    }

    pub fn services_len(&self) -> usize {
        self.services.read().len()
    }

    pub fn endpoints_len(&self) -> usize {
        self.endpoints.read().len()
    }
}
