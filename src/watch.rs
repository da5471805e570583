//! C5 WatchDriver: subscribes to the cluster collaborator's Service and
//! Endpoints change streams, demultiplexes add/update/delete into
//! Reconciler calls, and waits for the initial listing before declaring
//! the process ready.
//!
//! Credential discovery, transport, and informer caching/resync are all
//! supplied by `kube` (the cluster-client collaborator) — this module
//! only adapts its event shapes onto the Reconciler's six handlers and
//! adds a periodic full relist alongside the watch, since `kube-runtime`
//! does not expose a resync-period knob the way Go's informers do.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cache::{
    Endpoints as CacheEndpoints, NamedPort, ObjectId, Protocol, Service as CacheService,
    ServicePort, Subset, TargetPort, parse_ipv6_mapped,
};
use engine::Reconciler;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints as K8sEndpoints, Service as K8sService};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use mapgate::MapGateway;
use tokio::sync::oneshot;

pub struct WatchDriver {
    client: Client,
}

impl WatchDriver {
    /// Tries an explicit kubeconfig first, then the home-directory
    /// default, then in-cluster discovery.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kc = kube::config::Kubeconfig::read_from(path)
                    .with_context(|| format!("reading kubeconfig at {}", path.display()))?;
                let config =
                    kube::Config::from_custom_kubeconfig(kc, &Default::default()).await?;
                Client::try_from(config)?
            }
            None => {
                let config = kube::Config::infer()
                    .await
                    .context("no explicit kubeconfig, home-directory default and in-cluster discovery both failed")?;
                Client::try_from(config)?
            }
        };

        Ok(Self { client })
    }

    /// Runs both watch loops (plus their periodic resync) until either
    /// fails, returning only after the initial listing of both kinds has
    /// been observed.
    pub async fn run<M>(
        &self,
        reconciler: Arc<Reconciler<M>>,
        resync_period: Duration,
    ) -> Result<()>
    where
        M: MapGateway + 'static,
    {
        let services: Api<K8sService> = Api::all(self.client.clone());
        let endpoints: Api<K8sEndpoints> = Api::all(self.client.clone());

        let (svc_ready_tx, svc_ready_rx) = oneshot::channel();
        let (ep_ready_tx, ep_ready_rx) = oneshot::channel();

        let svc_task = tokio::spawn(watch_services(
            services,
            reconciler.clone(),
            resync_period,
            svc_ready_tx,
        ));

        let ep_task = tokio::spawn(watch_endpoints(
            endpoints,
            reconciler,
            resync_period,
            ep_ready_tx,
        ));

        // Before the driver declares "ready", the initial listing of both
        // kinds has been observed.
        let _ = svc_ready_rx.await;
        let _ = ep_ready_rx.await;
        log::info!("initial cache sync complete, watch driver is ready");

        tokio::select! {
            res = svc_task => res.context("service watch task panicked")??,
            res = ep_task => res.context("endpoints watch task panicked")??,
        }

        Ok(())
    }
}

async fn watch_services<M>(
    api: Api<K8sService>,
    reconciler: Arc<Reconciler<M>>,
    resync_period: Duration,
    ready: oneshot::Sender<()>,
) -> Result<()>
where
    M: MapGateway + 'static,
{
    let mut ready = Some(ready);
    let mut stream = std::pin::pin!(watcher::watcher(api.clone(), watcher::Config::default()));
    let mut resync = tokio::time::interval(resync_period);
    resync.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Apply(obj) | Event::InitApply(obj))) => {
                        apply_service(&reconciler, obj);
                    }
                    Some(Ok(Event::Delete(obj))) => {
                        if let Some(id) = object_id(&obj.metadata) {
                            reconciler.service_deleted(&id);
                        }
                    }
                    Some(Ok(Event::Init)) => {}
                    Some(Ok(Event::InitDone)) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(());
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("service watch error: {err}");
                    }
                    None => return Ok(()),
                }
            }
            _ = resync.tick() => {
                if let Err(err) = relist_services(&api, &reconciler).await {
                    log::warn!("periodic service resync failed: {err}");
                }
            }
        }
    }
}

async fn watch_endpoints<M>(
    api: Api<K8sEndpoints>,
    reconciler: Arc<Reconciler<M>>,
    resync_period: Duration,
    ready: oneshot::Sender<()>,
) -> Result<()>
where
    M: MapGateway + 'static,
{
    let mut ready = Some(ready);
    let mut stream = std::pin::pin!(watcher::watcher(api.clone(), watcher::Config::default()));
    let mut resync = tokio::time::interval(resync_period);
    resync.tick().await;

    loop {
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Apply(obj) | Event::InitApply(obj))) => {
                        reconciler.endpoints_applied(convert_endpoints(&obj));
                    }
                    Some(Ok(Event::Delete(obj))) => {
                        if let Some(id) = object_id(&obj.metadata) {
                            reconciler.endpoints_deleted(&id);
                        }
                    }
                    Some(Ok(Event::Init)) => {}
                    Some(Ok(Event::InitDone)) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(());
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("endpoints watch error: {err}");
                    }
                    None => return Ok(()),
                }
            }
            _ = resync.tick() => {
                if let Err(err) = relist_endpoints(&api, &reconciler).await {
                    log::warn!("periodic endpoints resync failed: {err}");
                }
            }
        }
    }
}

async fn relist_services<M>(api: &Api<K8sService>, reconciler: &Arc<Reconciler<M>>) -> Result<()>
where
    M: MapGateway + 'static,
{
    for obj in api.list(&Default::default()).await?.items {
        apply_service(reconciler, obj);
    }
    Ok(())
}

async fn relist_endpoints<M>(
    api: &Api<K8sEndpoints>,
    reconciler: &Arc<Reconciler<M>>,
) -> Result<()>
where
    M: MapGateway + 'static,
{
    for obj in api.list(&Default::default()).await?.items {
        reconciler.endpoints_applied(convert_endpoints(&obj));
    }
    Ok(())
}

fn apply_service<M>(reconciler: &Arc<Reconciler<M>>, obj: K8sService)
where
    M: MapGateway + 'static,
{
    let Some(id) = object_id(&obj.metadata) else {
        return;
    };

    match convert_service(&id, &obj) {
        Ok(service) => reconciler.service_applied(service),
        Err(err) => {
            log::warn!("{err}");
            // InvalidService: not stored, any prior entry for the id is removed.
            reconciler.service_deleted(&id);
        }
    }
}

fn object_id(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Option<ObjectId> {
    Some(ObjectId::new(meta.namespace.clone()?, meta.name.clone()?))
}

fn convert_service(
    id: &ObjectId,
    obj: &K8sService,
) -> Result<CacheService, cache::InvalidService> {
    let spec = obj.spec.as_ref();
    let cluster_ip = spec.and_then(|s| s.cluster_ip.clone()).unwrap_or_default();

    let ports = spec
        .map(|s| s.ports.clone().unwrap_or_default())
        .unwrap_or_default()
        .into_iter()
        .map(|p| ServicePort {
            port: p.port as u16,
            target_port: match p.target_port {
                Some(IntOrString::Int(n)) => TargetPort::Number(n as u16),
                Some(IntOrString::String(name)) => TargetPort::Name(name),
                None => TargetPort::Number(p.port as u16),
            },
            protocol: Protocol::parse(p.protocol.as_deref().unwrap_or("")),
        })
        .collect();

    CacheService::parse(id.clone(), &cluster_ip, ports)
}

fn convert_endpoints(obj: &K8sEndpoints) -> CacheEndpoints {
    let id = object_id(&obj.metadata).unwrap_or_else(|| {
        ObjectId::new(
            obj.metadata.namespace.clone().unwrap_or_default(),
            obj.metadata.name.clone().unwrap_or_default(),
        )
    });

    let subsets = obj
        .subsets
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|subset| Subset {
            // NotReadyAddresses are ignored at ingestion (spec rule 4).
            addresses: subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .filter_map(|addr| parse_ipv6_mapped(&addr.ip))
                .collect(),
            ports: subset
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| NamedPort {
                    name: p.name,
                    port: p.port as u16,
                    protocol: Protocol::parse(p.protocol.as_deref().unwrap_or("")),
                })
                .collect(),
        })
        .collect();

    CacheEndpoints::new(id, subsets)
}
