//! Pure projection derivation: given a Service and its same-named
//! Endpoints, produce the set of table tuples the pair contributes.
//!
//! Nothing in this module touches the cache or the map gateway. That is
//! deliberate — the join itself has to be replayable and diffable without
//! side effects, which is what lets the Reconciler compute `Δ` by simply
//! subtracting two `Projection`s.

use ahash::HashSet;
use cache::{Endpoints, Protocol, Service, TargetPort};
use mapgate::Endpoint as TableEndpoint;

/// One (pod-ip, pod-port) -> (svc-ip, svc-port) tuple, in the table's wire
/// shape. Equality/hash only consider the byte-level fields actually
/// written, matching the table's key/value layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProjectionEntry {
    pub key: TableEndpoint,
    pub value: TableEndpoint,
}

pub type Projection = HashSet<ProjectionEntry>;

/// Computes the full projection for a Service joined with its Endpoints.
///
/// Rules (exhaustive):
/// 1. Empty `Endpoints.subsets` yields an empty projection.
/// 2. Every (subset address, `ServicePort`) pair where the address parses
///    and the port's protocol is empty/TCP contributes one tuple.
/// 3. A named `targetPort` is resolved against the subset's own named-port
///    list; an unresolved name omits the tuple rather than erroring.
/// 4. `NotReadyAddresses` never reach this function — the cache only ever
///    stores ready addresses (spec rule 4 is enforced at ingestion).
/// 5. The return order is unspecified; callers must treat it as a set.
pub fn project(service: &Service, endpoints: &Endpoints) -> Projection {
    let mut out = Projection::default();

    for subset in &endpoints.subsets {
        for pod_ip in &subset.addresses {
            for svc_port in &service.ports {
                if !svc_port.protocol.is_tcp() {
                    continue;
                }

                let Some(target_port) = resolve_target_port(svc_port, subset) else {
                    continue;
                };

                out.insert(ProjectionEntry {
                    key: TableEndpoint::new(*pod_ip, target_port as i32),
                    value: TableEndpoint::new(service.cluster_ip, svc_port.port as i32),
                });
            }
        }
    }

    out
}

fn resolve_target_port(svc_port: &cache::ServicePort, subset: &cache::Subset) -> Option<u16> {
    match &svc_port.target_port {
        TargetPort::Number(port) => Some(*port),
        TargetPort::Name(name) => subset
            .ports
            .iter()
            .find(|p| p.protocol.is_tcp() && p.name.as_deref() == Some(name.as_str()))
            .map(|p| p.port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache::{NamedPort, ObjectId, ServicePort, Subset, parse_ipv6_mapped};

    fn svc(ports: Vec<ServicePort>) -> Service {
        Service::parse(ObjectId::new("default", "web"), "10.0.0.1", ports).unwrap()
    }

    fn tcp_port(port: u16, target: u16) -> ServicePort {
        ServicePort {
            port,
            target_port: TargetPort::Number(target),
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn empty_subsets_yield_empty_projection() {
        let service = svc(vec![tcp_port(80, 8080)]);
        let endpoints = Endpoints::new(ObjectId::new("default", "web"), vec![]);
        assert!(project(&service, &endpoints).is_empty());
    }

    #[test]
    fn bare_create_scenario() {
        let service = svc(vec![tcp_port(80, 8080)]);
        let endpoints = Endpoints::new(
            ObjectId::new("default", "web"),
            vec![Subset {
                addresses: vec![parse_ipv6_mapped("1.2.3.4").unwrap()],
                ports: vec![],
            }],
        );

        let got = project(&service, &endpoints);
        assert_eq!(got.len(), 1);
        let entry = got.into_iter().next().unwrap();
        assert_eq!(entry.key.ip(), parse_ipv6_mapped("1.2.3.4").unwrap());
        assert_eq!(entry.key.port, 8080);
        assert_eq!(entry.value.ip(), parse_ipv6_mapped("10.0.0.1").unwrap());
        assert_eq!(entry.value.port, 80);
    }

    #[test]
    fn udp_and_sctp_ports_are_filtered() {
        let service = svc(vec![
            tcp_port(80, 8080),
            ServicePort {
                port: 53,
                target_port: TargetPort::Number(53),
                protocol: Protocol::Udp,
            },
        ]);

        let endpoints = Endpoints::new(
            ObjectId::new("default", "web"),
            vec![Subset {
                addresses: vec![parse_ipv6_mapped("1.2.3.4").unwrap()],
                ports: vec![],
            }],
        );

        assert_eq!(project(&service, &endpoints).len(), 1);
    }

    #[test]
    fn named_target_port_resolves_against_subset() {
        let service = svc(vec![ServicePort {
            port: 80,
            target_port: TargetPort::Name("http".into()),
            protocol: Protocol::Tcp,
        }]);

        let endpoints = Endpoints::new(
            ObjectId::new("default", "web"),
            vec![Subset {
                addresses: vec![parse_ipv6_mapped("1.2.3.4").unwrap()],
                ports: vec![NamedPort {
                    name: Some("http".into()),
                    port: 9090,
                    protocol: Protocol::Tcp,
                }],
            }],
        );

        let got = project(&service, &endpoints);
        assert_eq!(got.len(), 1);
        assert_eq!(got.into_iter().next().unwrap().key.port, 9090);
    }

    #[test]
    fn unresolvable_named_target_port_is_omitted() {
        let service = svc(vec![ServicePort {
            port: 80,
            target_port: TargetPort::Name("missing".into()),
            protocol: Protocol::Tcp,
        }]);

        let endpoints = Endpoints::new(
            ObjectId::new("default", "web"),
            vec![Subset {
                addresses: vec![parse_ipv6_mapped("1.2.3.4").unwrap()],
                ports: vec![],
            }],
        );

        assert!(project(&service, &endpoints).is_empty());
    }

    #[test]
    fn scale_up_and_scale_down() {
        let service = svc(vec![tcp_port(80, 8080)]);
        let one = Endpoints::new(
            ObjectId::new("default", "web"),
            vec![Subset {
                addresses: vec![parse_ipv6_mapped("1.2.3.4").unwrap()],
                ports: vec![],
            }],
        );
        let two = Endpoints::new(
            ObjectId::new("default", "web"),
            vec![Subset {
                addresses: vec![
                    parse_ipv6_mapped("1.2.3.4").unwrap(),
                    parse_ipv6_mapped("5.6.7.8").unwrap(),
                ],
                ports: vec![],
            }],
        );

        let p1 = project(&service, &one);
        let p2 = project(&service, &two);
        assert_eq!(p2.len() - p1.len(), 1);
        assert!(p2.is_superset(&p1));
    }
}
