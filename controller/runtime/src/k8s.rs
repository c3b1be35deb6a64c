//! Indexes the cluster resources the mesh catalog is built from.

use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Pod, Service},
    discovery::v1::EndpointSlice,
};
use kube::ResourceExt;
use meshplane_controller_broker::PROXY_UUID_LABEL;
use meshplane_controller_core::{
    catalog::{Endpoint, MeshCatalog, MeshService},
    mesh_config::MeshConfig,
    Proxy, Uuid,
};
use parking_lot::RwLock;
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};
use tracing::{debug, info, warn};

/// The ConfigMap key holding the JSON-encoded mesh configuration.
pub const MESH_CONFIG_KEY: &str = "mesh-config.json";

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Identifies the ConfigMap holding the mesh configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshConfigRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug)]
pub struct Index {
    mesh_config_ref: MeshConfigRef,
    mesh_config: Arc<MeshConfig>,
    pods: HashMap<ObjectKey, PodInfo>,
    services: HashMap<ObjectKey, ServiceInfo>,
    /// Endpoints by service, then by slice name.
    endpoints: HashMap<ObjectKey, HashMap<String, Vec<Endpoint>>>,
}

pub type SharedIndex = Arc<RwLock<Index>>;

/// Answers catalog queries from the index.
#[derive(Clone, Debug)]
pub struct IndexCatalog(SharedIndex);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ObjectKey {
    namespace: String,
    name: String,
}

#[derive(Debug, PartialEq, Eq)]
struct PodInfo {
    labels: BTreeMap<String, String>,
    service_account: String,
    uuid: Option<Uuid>,
}

#[derive(Debug, PartialEq, Eq)]
struct ServiceInfo {
    selector: BTreeMap<String, String>,
    ports: Vec<u16>,
}

// === impl MeshConfigRef ===

impl MeshConfigRef {
    pub(crate) fn matches(&self, cm: &ConfigMap) -> bool {
        cm.namespace().as_deref() == Some(self.namespace.as_str())
            && cm.name_unchecked() == self.name
    }
}

/// Reads the mesh configuration from its ConfigMap.
pub(crate) fn parse_mesh_config(cm: &ConfigMap) -> Result<MeshConfig> {
    let Some(json) = cm.data.as_ref().and_then(|d| d.get(MESH_CONFIG_KEY)) else {
        bail!("ConfigMap has no {MESH_CONFIG_KEY} key");
    };
    serde_json::from_str(json).context("invalid mesh configuration")
}

// === impl Index ===

impl Index {
    pub fn shared(mesh_config_ref: MeshConfigRef) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            mesh_config_ref,
            mesh_config: Default::default(),
            pods: HashMap::default(),
            services: HashMap::default(),
            endpoints: HashMap::default(),
        }))
    }

    fn pod_for_proxy(&self, proxy: &Proxy) -> Option<(&ObjectKey, &PodInfo)> {
        self.pods.iter().find(|(key, pod)| {
            key.namespace == proxy.identity.namespace && pod.uuid == Some(proxy.uuid)
        })
    }

    fn mesh_service(key: &ObjectKey, svc: &ServiceInfo) -> MeshService {
        MeshService {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            ports: svc.ports.clone(),
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        let Some(namespace) = pod.namespace() else {
            return;
        };
        let key = ObjectKey {
            namespace,
            name: pod.name_unchecked(),
        };

        let uuid = pod
            .labels()
            .get(PROXY_UUID_LABEL)
            .and_then(|v| match v.parse() {
                Ok(uuid) => Some(uuid),
                Err(error) => {
                    warn!(pod = %key.name, ns = %key.namespace, %error, "Invalid proxy UUID label");
                    None
                }
            });
        let info = PodInfo {
            labels: pod.labels().clone(),
            service_account: pod
                .spec
                .as_ref()
                .and_then(|s| s.service_account_name.clone())
                .unwrap_or_else(|| "default".to_string()),
            uuid,
        };
        self.pods.insert(key, info);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.pods.remove(&ObjectKey { namespace, name });
    }
}

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, svc: Service) {
        let Some(namespace) = svc.namespace() else {
            return;
        };
        let key = ObjectKey {
            namespace,
            name: svc.name_unchecked(),
        };
        let spec = svc.spec.unwrap_or_default();
        let mut ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| u16::try_from(p.port).ok())
            .collect::<Vec<_>>();
        ports.sort_unstable();
        ports.dedup();

        let info = ServiceInfo {
            selector: spec.selector.unwrap_or_default(),
            ports,
        };
        self.services.insert(key, info);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.services.remove(&ObjectKey { namespace, name });
    }
}

impl kubert::index::IndexNamespacedResource<EndpointSlice> for Index {
    fn apply(&mut self, slice: EndpointSlice) {
        let (Some(namespace), Some(service)) = (
            slice.namespace(),
            slice.labels().get(SERVICE_NAME_LABEL).cloned(),
        ) else {
            return;
        };
        let slice_name = slice.name_unchecked();

        let ports = slice
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.port.and_then(|p| u16::try_from(p).ok()))
            .collect::<Vec<_>>();
        let mut endpoints = Vec::new();
        for ep in slice.endpoints {
            let ready = ep
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if !ready {
                continue;
            }
            for addr in ep.addresses {
                let Ok(ip) = addr.parse::<IpAddr>() else {
                    debug!(%addr, "Skipping non-IP endpoint address");
                    continue;
                };
                endpoints.extend(ports.iter().map(|&port| Endpoint { ip, port }));
            }
        }

        self.endpoints
            .entry(ObjectKey {
                namespace,
                name: service,
            })
            .or_default()
            .insert(slice_name, endpoints);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.endpoints.retain(|svc, slices| {
            if svc.namespace == namespace {
                slices.remove(&name);
            }
            !slices.is_empty()
        });
    }
}

impl kubert::index::IndexNamespacedResource<ConfigMap> for Index {
    fn apply(&mut self, cm: ConfigMap) {
        if !self.mesh_config_ref.matches(&cm) {
            return;
        }
        match parse_mesh_config(&cm) {
            Ok(config) => {
                info!("Updated mesh configuration");
                self.mesh_config = Arc::new(config);
            }
            Err(error) => warn!(%error, "Ignoring mesh configuration update"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        // The last good configuration is kept.
        if namespace == self.mesh_config_ref.namespace && name == self.mesh_config_ref.name {
            warn!(%namespace, %name, "Mesh configuration deleted");
        }
    }
}

// === impl IndexCatalog ===

impl IndexCatalog {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl MeshCatalog for IndexCatalog {
    fn get_mesh_config(&self) -> Arc<MeshConfig> {
        self.0.read().mesh_config.clone()
    }

    fn verify_proxy(&self, proxy: &Proxy) -> Result<()> {
        let index = self.0.read();
        let Some((key, pod)) = index.pod_for_proxy(proxy) else {
            bail!(
                "no pod in namespace {} has proxy UUID {}",
                proxy.identity.namespace,
                proxy.uuid
            );
        };
        if pod.service_account != proxy.identity.service_account {
            bail!(
                "pod {} runs as service account {}, not {}",
                key.name,
                pod.service_account,
                proxy.identity.service_account
            );
        }
        Ok(())
    }

    fn list_services_for_proxy(&self, proxy: &Proxy) -> Vec<MeshService> {
        let index = self.0.read();
        let Some((_, pod)) = index.pod_for_proxy(proxy) else {
            return Vec::new();
        };
        let mut services = index
            .services
            .iter()
            .filter(|(key, svc)| {
                key.namespace == proxy.identity.namespace
                    && !svc.selector.is_empty()
                    && svc
                        .selector
                        .iter()
                        .all(|(k, v)| pod.labels.get(k) == Some(v))
            })
            .map(|(key, svc)| Index::mesh_service(key, svc))
            .collect::<Vec<_>>();
        services.sort();
        services
    }

    fn list_outbound_services(&self, proxy: &Proxy) -> Vec<MeshService> {
        let local = self.list_services_for_proxy(proxy);
        let index = self.0.read();
        let mut services = index
            .services
            .iter()
            .map(|(key, svc)| Index::mesh_service(key, svc))
            .filter(|svc| !local.contains(svc))
            .collect::<Vec<_>>();
        services.sort();
        services
    }

    fn list_endpoints(&self, service: &MeshService) -> Vec<Endpoint> {
        let index = self.0.read();
        let key = ObjectKey {
            namespace: service.namespace.clone(),
            name: service.name.clone(),
        };
        let mut endpoints = index
            .endpoints
            .get(&key)
            .into_iter()
            .flat_map(|slices| slices.values().flatten().cloned())
            .collect::<Vec<_>>();
        endpoints.sort_by_key(|e| (e.ip, e.port));
        endpoints.dedup();
        endpoints
    }
}
