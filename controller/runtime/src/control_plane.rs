use crate::{
    metrics::{ControlPlaneMetrics, RejectReason},
    registry::{ProxyRegistry, TooManyConnections},
    scheduler::{SchedulerConfig, Schedulers},
    validation::{validate_client, ValidationError},
    workerpool::WorkerPool,
};
use meshplane_controller_broker::Broker;
use meshplane_controller_core::{
    catalog::MeshCatalog, certificate::CertificateManager, ConnectionId, Proxy,
    ProxyConfigGenerator, ProxyUpdater,
};
use meshplane_controller_xds::{PeerInfo, StreamCallbacks};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Admits proxies as their discovery streams open and starts scheduling
/// their updates.
pub struct ControlPlane<G, U> {
    catalog: Arc<dyn MeshCatalog>,
    registry: ProxyRegistry,
    schedulers: Schedulers<G, U>,
    metrics: ControlPlaneMetrics,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    TooManyConnections(#[from] TooManyConnections),

    #[error("proxy failed verification: {0}")]
    Verification(#[source] anyhow::Error),
}

// === impl ControlPlane ===

impl<G, U> ControlPlane<G, U>
where
    G: ProxyConfigGenerator,
    U: ProxyUpdater<G::Config>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn MeshCatalog>,
        certs: Arc<dyn CertificateManager>,
        generator: Arc<G>,
        updater: Arc<U>,
        broker: Broker,
        pool: WorkerPool,
        config: SchedulerConfig,
        metrics: ControlPlaneMetrics,
        shutdown: drain::Watch,
    ) -> Self {
        Self {
            catalog,
            registry: ProxyRegistry::default(),
            schedulers: Schedulers {
                generator,
                updater,
                pool,
                config,
                metrics: metrics.clone(),
                broker,
                certs,
                shutdown,
            },
            metrics,
        }
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    fn connect(
        &self,
        peer: &PeerInfo,
        connection_id: ConnectionId,
    ) -> Result<Arc<Proxy>, ConnectError> {
        let client = validate_client(peer, &self.schedulers.certs.issuers())?;
        let proxy = Arc::new(Proxy::new(
            client.kind,
            client.uuid,
            client.identity,
            peer.addr,
            connection_id,
        ));

        self.catalog
            .verify_proxy(&proxy)
            .map_err(ConnectError::Verification)?;

        let limit = self
            .catalog
            .get_mesh_config()
            .sidecar
            .max_data_plane_connections;
        self.registry.try_register_proxy(proxy.clone(), limit)?;
        Ok(proxy)
    }
}

impl<G, U> StreamCallbacks for ControlPlane<G, U>
where
    G: ProxyConfigGenerator,
    U: ProxyUpdater<G::Config>,
{
    fn proxy_connected(
        &self,
        peer: &PeerInfo,
        connection_id: ConnectionId,
        cancel: CancellationToken,
    ) -> Result<Arc<Proxy>, tonic::Status> {
        let proxy = match self.connect(peer, connection_id) {
            Ok(proxy) => proxy,
            Err(error) => {
                warn!(%connection_id, peer = ?peer.addr, %error, "Rejected proxy connection");
                self.metrics.rejected(error.reason());
                return Err(error.into());
            }
        };

        info!(%proxy, "Proxy connected");
        self.metrics.connected();
        self.schedulers.spawn(proxy.clone(), &cancel);
        Ok(proxy)
    }

    fn proxy_disconnected(&self, connection_id: ConnectionId) {
        match self.registry.unregister_proxy(connection_id) {
            Some(proxy) => {
                info!(%proxy, "Proxy disconnected");
                self.metrics.disconnected();
            }
            None => debug!(%connection_id, "Connection was not registered"),
        }
    }
}

// === impl ConnectError ===

impl ConnectError {
    fn reason(&self) -> RejectReason {
        match self {
            Self::Validation(_) => RejectReason::Unauthenticated,
            Self::Verification(_) => RejectReason::Verification,
            Self::TooManyConnections(_) => RejectReason::MaxConnections,
        }
    }
}

impl From<ConnectError> for tonic::Status {
    fn from(error: ConnectError) -> Self {
        let msg = error.to_string();
        match error {
            ConnectError::Validation(_) => tonic::Status::unauthenticated(msg),
            ConnectError::Verification(_) => tonic::Status::permission_denied(msg),
            ConnectError::TooManyConnections(_) => tonic::Status::resource_exhausted(msg),
        }
    }
}
