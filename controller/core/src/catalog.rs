use crate::{mesh_config::MeshConfig, Proxy};
use serde::Serialize;
use std::{fmt, net::IpAddr, sync::Arc};

/// A service known to the mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MeshService {
    pub namespace: String,
    pub name: String,
    pub ports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

/// Read-only queries over mesh state.
pub trait MeshCatalog: Send + Sync + 'static {
    fn get_mesh_config(&self) -> Arc<MeshConfig>;

    /// Confirms that the proxy's claimed identity belongs to a known workload.
    fn verify_proxy(&self, proxy: &Proxy) -> anyhow::Result<()>;

    /// The services the proxy's workload backs.
    fn list_services_for_proxy(&self, proxy: &Proxy) -> Vec<MeshService>;

    /// The services the proxy is allowed to reach.
    fn list_outbound_services(&self, proxy: &Proxy) -> Vec<MeshService>;

    fn list_endpoints(&self, service: &MeshService) -> Vec<Endpoint>;
}

// === impl MeshService ===

impl MeshService {
    /// A name unique within the mesh, used to key generated resources.
    pub fn fqdn(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for MeshService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}
