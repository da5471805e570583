//! The event-driven state machine (C4). For every add/update/delete of
//! either resource kind, it updates the [`ResourceCache`], looks up the
//! peer object by the shared id, derives the delta between the old and new
//! projection, and applies that delta through the [`MapGateway`].
//!
//! All six event handlers are entered under a single `parking_lot::Mutex`:
//! a Service update can never race an Endpoints update for the same id,
//! and since the mutex is held across the MapGateway's blocking syscalls
//! too, a given id's external-table writes stay linearizable with respect
//! to this process's view of the cache.

use std::sync::Arc;

use cache::{Endpoints, ObjectId, ResourceCache, Service};
use mapgate::{MapError, MapGateway, PutOutcome};
use parking_lot::Mutex;

use crate::joiner::{self, Projection, ProjectionEntry};

pub struct Reconciler<M> {
    cache: Arc<ResourceCache>,
    map: Arc<M>,
    // Guards every event handler below; see module docs.
    write_lock: Mutex<()>,
}

impl<M> Reconciler<M>
where
    M: MapGateway,
{
    pub fn new(cache: Arc<ResourceCache>, map: Arc<M>) -> Self {
        Self {
            cache,
            map,
            write_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Handles `SvcAdd`/`SvcUpdate`.
    pub fn service_applied(&self, service: Service) {
        let _guard = self.write_lock.lock();

        let id = service.id.clone();
        let old = self.cache.put_service(service.clone());

        let Some(endpoints) = self.cache.get_endpoints(&id) else {
            // No peer yet: nothing to project until the Endpoints arrive.
            return;
        };

        match old {
            None => {
                // SvcAdd: Projection_old = ∅, every tuple is an add.
                let new_proj = joiner::project(&service, &endpoints);
                self.apply_adds(&id, new_proj);
            }
            Some(old_service) => {
                // SvcUpdate: full retraction + full re-projection, uniformly,
                // regardless of which fields actually changed.
                let old_proj = joiner::project(&old_service, &endpoints);
                let new_proj = joiner::project(&service, &endpoints);
                self.apply_removes(&id, old_proj);
                self.apply_adds(&id, new_proj);
            }
        }
    }

    /// Handles `SvcDel`.
    pub fn service_deleted(&self, id: &ObjectId) {
        let _guard = self.write_lock.lock();

        let Some(old_service) = self.cache.remove_service(id) else {
            return;
        };

        if let Some(endpoints) = self.cache.get_endpoints(id) {
            let old_proj = joiner::project(&old_service, &endpoints);
            self.apply_removes(id, old_proj);
        }
    }

    /// Handles `EpAdd`/`EpUpdate`.
    pub fn endpoints_applied(&self, endpoints: Endpoints) {
        let _guard = self.write_lock.lock();

        let id = endpoints.id.clone();
        let old = self.cache.put_endpoints(endpoints.clone());

        let Some(service) = self.cache.get_service(&id) else {
            return;
        };

        match old {
            None => {
                // EpAdd: Projection_old = ∅, every tuple is an add.
                let new_proj = joiner::project(&service, &endpoints);
                self.apply_adds(&id, new_proj);
            }
            Some(old_endpoints) => {
                // EpUpdate: recompute both and take the set difference — a
                // spurious update (resource-version-only change) yields an
                // identical projection and writes nothing.
                let old_proj = joiner::project(&service, &old_endpoints);
                let new_proj = joiner::project(&service, &endpoints);

                let removed: Projection = old_proj.difference(&new_proj).copied().collect();
                let added: Projection = new_proj.difference(&old_proj).copied().collect();

                self.apply_removes(&id, removed);
                self.apply_adds(&id, added);
            }
        }
    }

    /// Handles `EpDel`.
    pub fn endpoints_deleted(&self, id: &ObjectId) {
        let _guard = self.write_lock.lock();

        let Some(old_endpoints) = self.cache.remove_endpoints(id) else {
            return;
        };

        if let Some(service) = self.cache.get_service(id) {
            let old_proj = joiner::project(&service, &old_endpoints);
            self.apply_removes(id, old_proj);
        }
    }

    fn apply_adds(&self, id: &ObjectId, entries: Projection) {
        for ProjectionEntry { key, value } in entries {
            match self.map.put_if_absent(key, value) {
                Ok(PutOutcome::Inserted) => {
                    log::debug!("{id}: added {key} -> {value}");
                }
                Ok(PutOutcome::AlreadyPresent) => {
                    log::trace!("{id}: {key} -> {value} already present");
                }
                Ok(PutOutcome::Conflict(existing)) => {
                    log::warn!(
                        "{id}: conflict on {key}: wanted {value}, table already has {existing}"
                    );
                }
                Err(MapError::Transport(msg)) => {
                    log::warn!(
                        "{id}: map transport error adding {key} -> {value}: {msg} (will self-heal on resync)"
                    );
                }
                Err(err) => {
                    log::warn!("{id}: map error adding {key} -> {value}: {err}");
                }
            }
        }
    }

    fn apply_removes(&self, id: &ObjectId, entries: Projection) {
        for ProjectionEntry { key, .. } in entries {
            if let Err(err) = self.map.delete(&key) {
                log::warn!("{id}: map error removing {key}: {err}");
            } else {
                log::debug!("{id}: removed {key}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{ObjectId, Protocol, ServicePort, Subset, TargetPort, parse_ipv6_mapped};
    use mapgate::FakeMapGateway;

    fn id() -> ObjectId {
        ObjectId::new("default", "web")
    }

    fn service(cluster_ip: &str, ports: Vec<ServicePort>) -> Service {
        Service::parse(id(), cluster_ip, ports).unwrap()
    }

    fn tcp_port(port: u16, target: u16) -> ServicePort {
        ServicePort {
            port,
            target_port: TargetPort::Number(target),
            protocol: Protocol::Tcp,
        }
    }

    fn endpoints(addrs: &[&str]) -> Endpoints {
        Endpoints::new(
            id(),
            vec![Subset {
                addresses: addrs.iter().map(|a| parse_ipv6_mapped(a).unwrap()).collect(),
                ports: vec![],
            }],
        )
    }

    fn new_reconciler() -> (Reconciler<FakeMapGateway>, Arc<FakeMapGateway>) {
        let map = Arc::new(FakeMapGateway::new());
        let cache = Arc::new(ResourceCache::new());
        (Reconciler::new(cache, map.clone()), map)
    }

    #[test]
    fn bare_create_scenario() {
        let (r, map) = new_reconciler();
        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        assert!(map.is_empty());

        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn late_service_scenario_matches_bare_create() {
        let (r, map) = new_reconciler();
        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert!(map.is_empty());

        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn scale_up_then_scale_down() {
        let (r, map) = new_reconciler();
        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert_eq!(map.len(), 1);

        r.endpoints_applied(endpoints(&["1.2.3.4", "5.6.7.8"]));
        assert_eq!(map.len(), 2);

        r.endpoints_applied(endpoints(&["5.6.7.8"]));
        assert_eq!(map.len(), 1);
        let (key, _) = map.snapshot().into_iter().next().unwrap();
        assert_eq!(key.ip(), parse_ipv6_mapped("5.6.7.8").unwrap());
    }

    #[test]
    fn protocol_filter_scenario() {
        let (r, map) = new_reconciler();
        r.service_applied(service(
            "10.0.0.1",
            vec![
                tcp_port(80, 8080),
                ServicePort {
                    port: 53,
                    target_port: TargetPort::Number(53),
                    protocol: Protocol::Udp,
                },
            ],
        ));
        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn service_deletion_retracts_all_and_subsequent_endpoints_delete_is_noop() {
        let (r, map) = new_reconciler();
        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        r.endpoints_applied(endpoints(&["1.2.3.4", "5.6.7.8"]));
        assert_eq!(map.len(), 2);

        r.service_deleted(&id());
        assert!(map.is_empty());
        assert!(r.cache().get_service(&id()).is_none());

        r.endpoints_deleted(&id());
        assert!(map.is_empty());
    }

    #[test]
    fn spurious_endpoints_update_writes_nothing() {
        let (r, map) = new_reconciler();
        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert_eq!(map.len(), 1);

        // Same content, simulating a resourceVersion-only resync delivery.
        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn service_update_does_full_retract_and_reproject() {
        let (r, map) = new_reconciler();
        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        r.endpoints_applied(endpoints(&["1.2.3.4"]));
        assert_eq!(map.len(), 1);

        r.service_applied(service("10.0.0.9", vec![tcp_port(80, 8080)]));
        assert_eq!(map.len(), 1);
        let (_, value) = map.snapshot().into_iter().next().unwrap();
        assert_eq!(value.ip(), parse_ipv6_mapped("10.0.0.9").unwrap());
    }

    #[test]
    fn conflicting_key_is_left_untouched() {
        let (r, map) = new_reconciler();
        let key = mapgate::Endpoint::new(parse_ipv6_mapped("1.2.3.4").unwrap(), 8080);
        let foreign_value = mapgate::Endpoint::new(parse_ipv6_mapped("9.9.9.9").unwrap(), 80);
        map.put_if_absent(key, foreign_value).unwrap();

        r.service_applied(service("10.0.0.1", vec![tcp_port(80, 8080)]));
        r.endpoints_applied(endpoints(&["1.2.3.4"]));

        assert_eq!(map.lookup(&key).unwrap(), Some(foreign_value));
    }
}
