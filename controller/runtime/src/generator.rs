//! Builds the discovery resources served to each proxy.
//!
//! Payloads are JSON documents describing each resource. Rendering them into
//! a particular proxy's native format is left to the transport.

use anyhow::{Context, Result};
use meshplane_controller_core::{
    catalog::{Endpoint, MeshCatalog, MeshService},
    certificate::{Certificate, CertificateManager},
    mesh_config::MeshConfig,
    resources::{Resource, ResourceBundle, TypeUrl},
    Proxy, ProxyConfigGenerator,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument};

const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

pub const INBOUND_LISTENER: &str = "inbound-listener";
pub const OUTBOUND_LISTENER: &str = "outbound-listener";
pub const INBOUND_ROUTES: &str = "rds-inbound";
pub const OUTBOUND_ROUTES: &str = "rds-outbound";
pub const EGRESS_CLUSTER: &str = "passthrough-outbound";
pub const TRACING_CLUSTER: &str = "tracing";

/// Generates each proxy's resources from the mesh catalog.
#[derive(Clone)]
pub struct MeshConfigGenerator {
    catalog: Arc<dyn MeshCatalog>,
    certs: Arc<dyn CertificateManager>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecretPayload<'a> {
    common_name: &'a str,
    serial_number: &'a str,
    expiration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trusted_ca: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    trust_domains: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterPayload<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a MeshService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_secret: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointsPayload<'a> {
    cluster_name: &'a str,
    endpoints: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoutePayload<'a> {
    name: &'a str,
    virtual_hosts: Vec<VirtualHost<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VirtualHost<'a> {
    domains: Vec<String>,
    cluster: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListenerPayload<'a> {
    name: &'a str,
    route_config: &'a str,
    tls_secrets: Vec<&'a str>,
    #[serde(skip_serializing_if = "<[u16]>::is_empty")]
    excluded_ports: &'a [u16],
    #[serde(skip_serializing_if = "Option::is_none")]
    external_authz: Option<String>,
}

impl MeshConfigGenerator {
    pub fn new(catalog: Arc<dyn MeshCatalog>, certs: Arc<dyn CertificateManager>) -> Self {
        Self { catalog, certs }
    }

    fn cert_validity(config: &MeshConfig) -> Duration {
        let validity = config.certificate.service_cert_validity_duration;
        if validity.is_zero() {
            DEFAULT_CERT_VALIDITY
        } else {
            validity.as_duration()
        }
    }
}

#[async_trait::async_trait]
impl ProxyConfigGenerator for MeshConfigGenerator {
    type Config = ResourceBundle;

    #[instrument(skip_all, fields(proxy = %proxy))]
    async fn generate_config(&self, proxy: &Proxy) -> Result<ResourceBundle> {
        let config = self.catalog.get_mesh_config();
        let cert = self
            .certs
            .issue_certificate(&proxy.identity, Self::cert_validity(&config))
            .context("failed to issue service certificate")?;

        let mut bundle = ResourceBundle::default();
        let (identity_secret, root_secret) = secrets(
            &mut bundle,
            proxy,
            &cert,
            self.certs.trust_domains(),
        )?;

        // Outbound: one cluster and load assignment per reachable service.
        let mut outbound_hosts = Vec::new();
        let outbound = self.catalog.list_outbound_services(proxy);
        for svc in &outbound {
            let name = svc.fqdn();
            let endpoints = self.catalog.list_endpoints(svc);
            bundle.push(
                TypeUrl::Cluster,
                Resource::new(
                    &name,
                    json(&ClusterPayload {
                        name: &name,
                        service: Some(svc),
                        address: None,
                        tls_secret: Some(&identity_secret),
                    })?,
                )
                .with_reference(TypeUrl::Endpoint, &name)
                .with_reference(TypeUrl::Secret, &identity_secret),
            );
            bundle.push(TypeUrl::Endpoint, endpoints_resource(&name, &endpoints)?);
            outbound_hosts.push((svc, name));
        }

        if config.traffic.enable_egress {
            bundle.push(
                TypeUrl::Cluster,
                Resource::new(
                    EGRESS_CLUSTER,
                    json(&ClusterPayload {
                        name: EGRESS_CLUSTER,
                        service: None,
                        address: None,
                        tls_secret: None,
                    })?,
                ),
            );
        }

        let tracing = &config.observability.tracing;
        if tracing.enable {
            bundle.push(
                TypeUrl::Cluster,
                Resource::new(
                    TRACING_CLUSTER,
                    json(&ClusterPayload {
                        name: TRACING_CLUSTER,
                        service: None,
                        address: Some(format!("{}:{}", tracing.address, tracing.port)),
                        tls_secret: None,
                    })?,
                ),
            );
        }

        // Inbound: a local cluster for each service the proxy's workload backs.
        let mut inbound_hosts = Vec::new();
        let local = self.catalog.list_services_for_proxy(proxy);
        for svc in &local {
            let name = format!("{}|local", svc.fqdn());
            bundle.push(
                TypeUrl::Cluster,
                Resource::new(
                    &name,
                    json(&ClusterPayload {
                        name: &name,
                        service: Some(svc),
                        address: Some("127.0.0.1".to_string()),
                        tls_secret: None,
                    })?,
                ),
            );
            inbound_hosts.push((svc, name));
        }

        bundle.push(TypeUrl::Route, route_resource(OUTBOUND_ROUTES, &outbound_hosts)?);
        bundle.push(TypeUrl::Route, route_resource(INBOUND_ROUTES, &inbound_hosts)?);

        let authz = &config.traffic.inbound_external_authorization;
        bundle.push(
            TypeUrl::Listener,
            Resource::new(
                OUTBOUND_LISTENER,
                json(&ListenerPayload {
                    name: OUTBOUND_LISTENER,
                    route_config: OUTBOUND_ROUTES,
                    tls_secrets: vec![identity_secret.as_str()],
                    excluded_ports: &config.traffic.outbound_port_exclusion_list,
                    external_authz: None,
                })?,
            )
            .with_reference(TypeUrl::Route, OUTBOUND_ROUTES)
            .with_reference(TypeUrl::Secret, &identity_secret),
        );
        bundle.push(
            TypeUrl::Listener,
            Resource::new(
                INBOUND_LISTENER,
                json(&ListenerPayload {
                    name: INBOUND_LISTENER,
                    route_config: INBOUND_ROUTES,
                    tls_secrets: vec![identity_secret.as_str(), root_secret.as_str()],
                    excluded_ports: &config.traffic.inbound_port_exclusion_list,
                    external_authz: authz
                        .enable
                        .then(|| format!("{}:{}", authz.address, authz.port)),
                })?,
            )
            .with_reference(TypeUrl::Route, INBOUND_ROUTES)
            .with_reference(TypeUrl::Secret, &identity_secret)
            .with_reference(TypeUrl::Secret, &root_secret),
        );

        debug!(
            resources = bundle.len(),
            outbound = outbound.len(),
            local = local.len(),
            "Generated config"
        );
        Ok(bundle)
    }
}

/// Adds the proxy's identity and trust secrets, returning their names.
fn secrets(
    bundle: &mut ResourceBundle,
    proxy: &Proxy,
    cert: &Certificate,
    trust_domains: Vec<String>,
) -> Result<(String, String)> {
    let ns_sa = format!(
        "{}/{}",
        proxy.identity.namespace, proxy.identity.service_account
    );
    let identity = format!("service-cert:{ns_sa}");
    let root = format!("root-cert-for-mtls:{ns_sa}");

    let expiration = cert.expiration.to_rfc3339();
    bundle.push(
        TypeUrl::Secret,
        Resource::new(
            &identity,
            json(&SecretPayload {
                common_name: &cert.common_name,
                serial_number: &cert.serial_number,
                expiration: expiration.clone(),
                cert_chain: Some(String::from_utf8_lossy(&cert.cert_chain).into_owned()),
                trusted_ca: None,
                trust_domains: Vec::new(),
            })?,
        ),
    );
    bundle.push(
        TypeUrl::Secret,
        Resource::new(
            &root,
            json(&SecretPayload {
                common_name: &cert.common_name,
                serial_number: &cert.serial_number,
                expiration,
                cert_chain: None,
                trusted_ca: Some(String::from_utf8_lossy(&cert.issuing_ca).into_owned()),
                trust_domains,
            })?,
        ),
    );
    Ok((identity, root))
}

fn endpoints_resource(cluster_name: &str, endpoints: &[Endpoint]) -> Result<Resource> {
    let payload = EndpointsPayload {
        cluster_name,
        endpoints: endpoints
            .iter()
            .map(|e| std::net::SocketAddr::new(e.ip, e.port).to_string())
            .collect(),
    };
    Ok(Resource::new(cluster_name, json(&payload)?))
}

fn route_resource(name: &str, hosts: &[(&MeshService, String)]) -> Result<Resource> {
    let payload = RoutePayload {
        name,
        virtual_hosts: hosts
            .iter()
            .map(|(svc, cluster)| VirtualHost {
                domains: svc
                    .ports
                    .iter()
                    .map(|port| format!("{svc}:{port}"))
                    .chain(std::iter::once(svc.to_string()))
                    .collect(),
                cluster,
            })
            .collect(),
    };
    let mut resource = Resource::new(name, json(&payload)?);
    for (_, cluster) in hosts {
        resource = resource.with_reference(TypeUrl::Cluster, cluster);
    }
    Ok(resource)
}

fn json<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).context("failed to encode resource")
}
