use crate::{
    certificate::InMemoryCertManager,
    control_plane::ControlPlane,
    events::Events,
    generator::MeshConfigGenerator,
    index_list::IndexList,
    k8s::{Index, IndexCatalog, MeshConfigRef},
    metrics::ControlPlaneMetrics,
    scheduler::SchedulerConfig,
    workerpool::WorkerPool,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use k8s_openapi::api::{
    core::v1::{ConfigMap, Pod, Service},
    discovery::v1::EndpointSlice,
};
use kube::runtime::watcher;
use meshplane_controller_broker::{Broker, BrokerConfig, BrokerMetrics, ResyncTicker};
use meshplane_controller_core::{
    identity::{Issuer, IssuerInfo},
    GoDuration,
};
use meshplane_controller_xds::{
    AdsService, DiscoveryMetrics, DiscoveryServer, SnapshotCache, StreamCallbacks, XdsLog,
};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, info_span, instrument, warn, Instrument};

/// The control plane as wired by [`Args`].
pub type MeshControlPlane = ControlPlane<MeshConfigGenerator, SnapshotCache>;

#[derive(Debug, Parser)]
#[clap(name = "meshplane", about = "A service mesh proxy configuration controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "meshplane=info,warn",
        env = "MESHPLANE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:15128")]
    grpc_addr: SocketAddr,

    /// PEM-encoded certificate the discovery server presents to proxies.
    #[clap(long, requires = "grpc_tls_key")]
    grpc_tls_cert: Option<PathBuf>,

    #[clap(long, requires = "grpc_tls_cert")]
    grpc_tls_key: Option<PathBuf>,

    /// PEM-encoded roots that proxy client certificates must chain to.
    /// Proxies are only admitted over mutually authenticated connections.
    #[clap(long, requires = "grpc_tls_cert")]
    grpc_client_ca: Option<PathBuf>,

    /// Workers generating proxy configuration. Defaults to one per CPU.
    #[clap(long, default_value = "0")]
    workers: usize,

    #[clap(long, default_value = "1024")]
    event_queue_capacity: usize,

    /// Events held while the queue is full before they are dropped in favor
    /// of a resync of every proxy.
    #[clap(long, default_value = "1024")]
    event_backlog_capacity: usize,

    /// Events dispatched per second.
    #[clap(long, default_value = "100")]
    event_qps: f64,

    #[clap(long, default_value = "1000")]
    event_burst: u32,

    #[clap(long, default_value = "2s")]
    broadcast_window: GoDuration,

    #[clap(long, default_value = "10s")]
    broadcast_max_window: GoDuration,

    /// The longest a proxy goes without its configuration being regenerated.
    #[clap(long, default_value = "5m")]
    update_ceiling: GoDuration,

    #[clap(long, default_value = "1s")]
    update_cooldown: GoDuration,

    /// Periodic resync intervals below this are rejected.
    #[clap(long, default_value = "1m")]
    min_resync_interval: GoDuration,

    #[clap(long, default_value = "cluster.local")]
    trust_domain: String,

    /// Reads proxy identities from SPIFFE IDs rather than common names.
    #[clap(long)]
    spiffe_enabled: bool,

    /// Certificates are reissued once they expire within this window.
    #[clap(long, default_value = "30m")]
    cert_rotation_window: GoDuration,

    #[clap(long, default_value = "1m")]
    cert_rotation_check_interval: GoDuration,

    #[clap(long, default_value = "meshplane-system", env = "MESHPLANE_NAMESPACE")]
    control_plane_namespace: String,

    #[clap(long, default_value = "meshplane-mesh-config")]
    mesh_config_name: String,
}

/// A running controller. The discovery server is owned by its serving task,
/// which releases it once shutdown is signaled.
pub struct Controller {
    runtime: kubert::Runtime,
    pool: WorkerPool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        self.build().await?.run().await
    }

    /// Starts every watch, background task and the discovery server.
    pub async fn build(self) -> Result<Controller> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            grpc_addr,
            grpc_tls_cert,
            grpc_tls_key,
            grpc_client_ca,
            workers,
            event_queue_capacity,
            event_backlog_capacity,
            event_qps,
            event_burst,
            broadcast_window,
            broadcast_max_window,
            update_ceiling,
            update_cooldown,
            min_resync_interval,
            trust_domain,
            spiffe_enabled,
            cert_rotation_window,
            cert_rotation_check_interval,
            control_plane_namespace,
            mesh_config_name,
        } = self;

        let tls = tls_config(grpc_tls_cert, grpc_tls_key, grpc_client_ca)?;

        let mut prom = <Registry>::default();
        let broker_metrics = BrokerMetrics::register(prom.sub_registry_with_prefix("broker"));
        let control_plane_metrics =
            ControlPlaneMetrics::register(prom.sub_registry_with_prefix("control_plane"));
        let discovery_metrics =
            DiscoveryMetrics::register(prom.sub_registry_with_prefix("discovery"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let shutdown = runtime.shutdown_handle();

        let broker = Broker::new(
            BrokerConfig {
                queue_capacity: event_queue_capacity,
                backlog_capacity: event_backlog_capacity,
                qps: event_qps,
                burst: event_burst,
                broadcast_window: broadcast_window.into(),
                broadcast_max_window: broadcast_max_window.into(),
                ..Default::default()
            },
            broker_metrics,
            shutdown.clone(),
        );

        // Keep the catalog index and emit broker events from the same watches.
        // The index is updated before the event for a change is emitted.
        let mesh_config_ref = MeshConfigRef {
            namespace: control_plane_namespace.clone(),
            name: mesh_config_name.clone(),
        };
        let index = Index::shared(mesh_config_ref.clone());
        let events = Events::shared(broker.clone(), mesh_config_ref);

        let pods = runtime.watch_all::<Pod>(watcher::Config::default());
        let pods_indexes = IndexList::new(index.clone()).push(events.clone()).shared();
        tokio::spawn(
            kubert::index::namespaced(pods_indexes, pods).instrument(info_span!("pods")),
        );

        let services = runtime.watch_all::<Service>(watcher::Config::default());
        let services_indexes = IndexList::new(index.clone()).push(events.clone()).shared();
        tokio::spawn(
            kubert::index::namespaced(services_indexes, services)
                .instrument(info_span!("services")),
        );

        let slices = runtime.watch_all::<EndpointSlice>(watcher::Config::default());
        let slices_indexes = IndexList::new(index.clone()).push(events.clone()).shared();
        tokio::spawn(
            kubert::index::namespaced(slices_indexes, slices)
                .instrument(info_span!("endpointslices")),
        );

        let mesh_configs = runtime.watch_all::<ConfigMap>(watcher::Config::default().fields(
            &format!("metadata.namespace={control_plane_namespace},metadata.name={mesh_config_name}"),
        ));
        let mesh_configs_indexes = IndexList::new(index.clone()).push(events).shared();
        tokio::spawn(
            kubert::index::namespaced(mesh_configs_indexes, mesh_configs)
                .instrument(info_span!("meshconfig")),
        );

        tokio::spawn(
            ResyncTicker::new(broker.clone(), min_resync_interval.into())
                .run(shutdown.clone())
                .instrument(info_span!("resync")),
        );

        let certs = InMemoryCertManager::new(
            IssuerInfo::single(Issuer {
                id: "meshplane-root".to_string(),
                trust_domain,
                spiffe_enabled,
            }),
            cert_rotation_window.into(),
        );
        tokio::spawn(
            certs
                .clone()
                .run_rotations(cert_rotation_check_interval.into(), shutdown.clone())
                .instrument(info_span!("certificates")),
        );
        let certs = Arc::new(certs);

        let catalog = Arc::new(IndexCatalog::new(index));
        let cache = SnapshotCache::default();
        let pool = WorkerPool::new(workers);
        let control_plane = ControlPlane::new(
            catalog.clone(),
            certs.clone(),
            Arc::new(MeshConfigGenerator::new(catalog, certs.clone())),
            Arc::new(cache.clone()),
            broker,
            pool.clone(),
            SchedulerConfig {
                ceiling: update_ceiling.into(),
                cooldown: update_cooldown.into(),
            },
            control_plane_metrics,
            shutdown.clone(),
        );
        let discovery = DiscoveryServer::new(
            Arc::new(control_plane),
            cache,
            XdsLog::default(),
            discovery_metrics,
            shutdown.clone(),
        );

        // Serve proxies until shutdown. The serving task owns the discovery
        // server so that its shutdown handles are released with it.
        tokio::spawn(async move {
            if let Err(error) = grpc(grpc_addr, tls, discovery, shutdown).await {
                error!(%error, "Discovery server failed");
            }
        });
        info!(workers = pool.workers(), "Controller started");

        Ok(Controller { runtime, pool })
    }
}

fn tls_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    client_ca: Option<PathBuf>,
) -> Result<Option<ServerTlsConfig>> {
    let (cert, key) = match (cert, key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => {
            warn!("Discovery server TLS is not configured; proxies cannot authenticate");
            return Ok(None);
        }
        _ => bail!("--grpc-tls-cert and --grpc-tls-key must be set together"),
    };
    let read = |path: &PathBuf| {
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    };

    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(read(&cert)?, read(&key)?));
    match client_ca {
        Some(ca) => tls = tls.client_ca_root(Certificate::from_pem(read(&ca)?)),
        None => warn!("No client CA configured; proxies cannot authenticate"),
    }
    Ok(Some(tls))
}

/// Serves the aggregated discovery service until `drain` is signaled, then
/// stops accepting streams and waits for open ones to close.
#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn grpc<C: StreamCallbacks>(
    addr: SocketAddr,
    tls: Option<ServerTlsConfig>,
    discovery: DiscoveryServer<C>,
    drain: drain::Watch,
) -> Result<()> {
    let svc = AdsService::new(discovery).svc();

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = builder.add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "Discovery gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

// === impl Controller ===

impl Controller {
    /// Blocks on the shutdown signal. Once it fires, waits for background
    /// tasks, open streams and in-flight updates to complete.
    pub async fn run(self) -> Result<()> {
        let Self { runtime, pool } = self;
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }
        pool.stop().await;
        Ok(())
    }
}
