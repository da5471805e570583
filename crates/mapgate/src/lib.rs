//! Typed accessor over the pinned `endpoints_to_service_map` hash table.
//!
//! The kernel datapath and possibly other userspace holders share this
//! table; [`MapGateway`] never assumes it is the only writer, so `put` is
//! offered only as a cooperative create-if-absent operation rather than an
//! atomic compare-and-swap.

use std::fmt;
use std::net::Ipv6Addr;
use std::path::Path;

/// 36-byte wire layout shared by both the key and the value side of the
/// table: a 16-byte IPv6-mapped address, 4 reserved/zeroed alignment bytes,
/// and a 32-bit port. Padding bytes are always written as zero and ignored
/// on read.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Endpoint {
    pub ip: [u8; 16],
    pub pad: [u8; 4],
    pub port: i32,
}

impl Endpoint {
    pub fn new(ip: Ipv6Addr, port: i32) -> Self {
        Self {
            ip: ip.octets(),
            pad: [0; 4],
            port,
        }
    }

    pub fn ip(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.ip)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

/// Safety: `Endpoint` is a `#[repr(C)]` struct of plain integers with no
/// padding beyond the explicit reserved field, so it is safe to read and
/// write byte-for-byte to/from the kernel map.
unsafe impl aya::Pod for Endpoint {}

/// Outcome of a cooperative create-if-absent `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was absent and the value has been written.
    Inserted,
    /// The key was already present with an identical value (benign).
    AlreadyPresent,
    /// The key was already present with a *different* value (I2 conflict).
    Conflict(Endpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    NotFound,
    Permission(String),
    Incompatible(String),
    Transport(String),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NotFound => write!(f, "key not found"),
            MapError::Permission(msg) => write!(f, "permission error: {msg}"),
            MapError::Incompatible(msg) => write!(f, "incompatible map: {msg}"),
            MapError::Transport(msg) => write!(f, "map transport error: {msg}"),
        }
    }
}

impl std::error::Error for MapError {}

/// Typed surface over the pinned `endpoints-to-service` table.
///
/// Implementations must not serialize concurrent callers themselves — the
/// Reconciler's single-writer lock is what makes `lookup`-then-`put`
/// safe from this process's point of view; the table may still be written
/// to by the kernel datapath or another holder at any time.
pub trait MapGateway: Send + Sync {
    fn lookup(&self, key: &Endpoint) -> Result<Option<Endpoint>, MapError>;

    /// Create-if-absent. Never overwrites an existing, differing value —
    /// the caller is expected to treat `Conflict` as I2 and move on.
    fn put_if_absent(&self, key: Endpoint, value: Endpoint) -> Result<PutOutcome, MapError>;

    fn delete(&self, key: &Endpoint) -> Result<(), MapError>;
}

/// Opens the pinned map at the given bpffs path and exposes it through the
/// [`MapGateway`] surface.
pub struct AyaMapGateway {
    inner: parking_lot::Mutex<aya::maps::HashMap<aya::maps::MapData, Endpoint, Endpoint>>,
}

impl AyaMapGateway {
    /// Opens an existing pinned table. Opening is idempotent — multiple
    /// holders may open the same pin concurrently.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MapError> {
        let path = path.as_ref();
        let map_data = aya::maps::MapData::from_pin(path)
            .map_err(|err| classify_open_err(path, &err))?;

        let inner = aya::maps::HashMap::try_from(map_data)
            .map_err(|err| MapError::Incompatible(err.to_string()))?;

        Ok(Self {
            inner: parking_lot::Mutex::new(inner),
        })
    }
}

/// `from_pin` folds "path missing", "permission denied on bpffs" and "wrong
/// map type/size pinned at this path" into one error type; tell them apart
/// by the path's existence and the error text so `open` can report
/// `NotFound`/`Permission`/`Incompatible` distinctly.
fn classify_open_err(path: &Path, err: &dyn fmt::Display) -> MapError {
    if !path.exists() {
        return MapError::NotFound;
    }

    let msg = err.to_string();
    if msg.to_lowercase().contains("permission denied") {
        MapError::Permission(msg)
    } else {
        MapError::Incompatible(msg)
    }
}

impl MapGateway for AyaMapGateway {
    fn lookup(&self, key: &Endpoint) -> Result<Option<Endpoint>, MapError> {
        match self.inner.lock().get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(aya::maps::MapError::KeyNotFound) => Ok(None),
            Err(err) => {
                log::warn!("map lookup failed: key={key}, err={err}");
                Err(MapError::Transport(err.to_string()))
            }
        }
    }

    fn put_if_absent(&self, key: Endpoint, value: Endpoint) -> Result<PutOutcome, MapError> {
        match self.lookup(&key)? {
            Some(existing) if existing == value => Ok(PutOutcome::AlreadyPresent),
            Some(existing) => Ok(PutOutcome::Conflict(existing)),
            None => {
                self.inner
                    .lock()
                    .insert(key, value, aya::maps::MapFlags::empty())
                    .map_err(|err| {
                        log::warn!("map insert failed: key={key}, value={value}, err={err}");
                        MapError::Transport(err.to_string())
                    })?;

                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn delete(&self, key: &Endpoint) -> Result<(), MapError> {
        match self.inner.lock().remove(key) {
            Ok(()) => Ok(()),
            Err(aya::maps::MapError::KeyNotFound) => Ok(()),
            Err(err) => {
                log::warn!("map delete failed: key={key}, err={err}");
                Err(MapError::Transport(err.to_string()))
            }
        }
    }
}

/// In-process stand-in for the pinned table, used by the reconciliation
/// engine's own tests so they don't require a kernel with bpffs mounted.
#[derive(Default)]
pub struct FakeMapGateway {
    table: parking_lot::RwLock<ahash::HashMap<Endpoint, Endpoint>>,
}

impl FakeMapGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<(Endpoint, Endpoint)> {
        self.table
            .read()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl MapGateway for FakeMapGateway {
    fn lookup(&self, key: &Endpoint) -> Result<Option<Endpoint>, MapError> {
        Ok(self.table.read().get(key).copied())
    }

    fn put_if_absent(&self, key: Endpoint, value: Endpoint) -> Result<PutOutcome, MapError> {
        let mut table = self.table.write();
        match table.get(&key) {
            Some(existing) if *existing == value => Ok(PutOutcome::AlreadyPresent),
            Some(existing) => Ok(PutOutcome::Conflict(*existing)),
            None => {
                table.insert(key, value);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn delete(&self, key: &Endpoint) -> Result<(), MapError> {
        self.table.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: i32) -> Endpoint {
        Endpoint::new(Ipv6Addr::LOCALHOST, port)
    }

    #[test]
    fn put_if_absent_inserts_once() {
        let gw = FakeMapGateway::new();
        assert_eq!(
            gw.put_if_absent(ep(1), ep(80)).unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(
            gw.put_if_absent(ep(1), ep(80)).unwrap(),
            PutOutcome::AlreadyPresent
        );
        assert_eq!(
            gw.put_if_absent(ep(1), ep(81)).unwrap(),
            PutOutcome::Conflict(ep(80))
        );
    }

    #[test]
    fn classify_open_err_reports_not_found_for_missing_path() {
        let path = Path::new("/sys/fs/bpf/does_not_exist_sockmap_agent_test");
        assert_eq!(
            classify_open_err(path, &"irrelevant"),
            MapError::NotFound
        );
    }

    #[test]
    fn classify_open_err_distinguishes_permission_from_incompatible() {
        let path = Path::new(".");
        assert_eq!(
            classify_open_err(path, &"Os { code: 13, kind: PermissionDenied, message: \"Permission denied\" }"),
            MapError::Permission(
                "Os { code: 13, kind: PermissionDenied, message: \"Permission denied\" }".into()
            )
        );
        assert_eq!(
            classify_open_err(path, &"invalid map type"),
            MapError::Incompatible("invalid map type".into())
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let gw = FakeMapGateway::new();
        gw.delete(&ep(1)).unwrap();
        gw.put_if_absent(ep(1), ep(80)).unwrap();
        gw.delete(&ep(1)).unwrap();
        gw.delete(&ep(1)).unwrap();
        assert!(gw.lookup(&ep(1)).unwrap().is_none());
    }
}
