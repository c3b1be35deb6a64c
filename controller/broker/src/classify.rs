use meshplane_controller_core::{
    event::{EventType, Kind, Payload, PubSubMessage},
    mesh_config::MeshConfig,
};

/// Pods carrying this label are bound to the proxy with the given UUID.
pub const PROXY_UUID_LABEL: &str = "meshplane.io/proxy-uuid";

/// Which proxies an event must refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyUpdateTarget {
    /// Every connected proxy. Broadcasts may be coalesced.
    All,
    /// A single proxy, by UUID. Delivered without coalescing.
    Proxy(String),
}

/// Returns whether the event requires any proxy's config to be regenerated.
pub fn should_update_proxy(msg: &PubSubMessage) -> bool {
    proxy_update_target(msg).is_some()
}

pub fn proxy_update_target(msg: &PubSubMessage) -> Option<ProxyUpdateTarget> {
    match msg.kind.kind {
        Kind::Proxy
        | Kind::Endpoint
        | Kind::Service
        | Kind::Ingress
        | Kind::Egress
        | Kind::IngressBackend
        | Kind::Retry
        | Kind::UpstreamTrafficSetting
        | Kind::TrafficSplit
        | Kind::TrafficTarget
        | Kind::RouteGroup
        | Kind::TcpRoute => Some(ProxyUpdateTarget::All),

        Kind::Pod if msg.kind.event_type == EventType::Updated => match (&msg.old, &msg.new) {
            (Some(Payload::Pod(_)), Some(Payload::Pod(new))) => {
                match new.labels.get(PROXY_UUID_LABEL) {
                    Some(uuid) if !uuid.is_empty() => Some(ProxyUpdateTarget::Proxy(uuid.clone())),
                    _ => Some(ProxyUpdateTarget::All),
                }
            }
            (old, new) => {
                tracing::error!(
                    old = old.as_ref().map(Payload::type_name),
                    new = new.as_ref().map(Payload::type_name),
                    "Expected Pod payloads"
                );
                None
            }
        },
        Kind::Pod => Some(ProxyUpdateTarget::All),

        Kind::MeshConfig if msg.kind.event_type == EventType::Updated => {
            match (&msg.old, &msg.new) {
                (Some(Payload::MeshConfig(old)), Some(Payload::MeshConfig(new))) => {
                    mesh_config_affects_proxies(old, new).then_some(ProxyUpdateTarget::All)
                }
                (old, new) => {
                    tracing::error!(
                        old = old.as_ref().map(Payload::type_name),
                        new = new.as_ref().map(Payload::type_name),
                        "Expected MeshConfig payloads"
                    );
                    None
                }
            }
        }

        Kind::MeshConfig
        | Kind::Namespace
        | Kind::ServiceAccount
        | Kind::MeshRootCertificate
        | Kind::Telemetry
        | Kind::ExtensionService => None,
    }
}

/// Only fields that are rendered into proxy config are compared; changes to
/// anything else must not cause fleet-wide churn.
fn mesh_config_affects_proxies(old: &MeshConfig, new: &MeshConfig) -> bool {
    let old_authz = &old.traffic.inbound_external_authorization;
    let new_authz = &new.traffic.inbound_external_authorization;

    old.traffic.enable_egress != new.traffic.enable_egress
        || old.traffic.enable_permissive_traffic_policy_mode
            != new.traffic.enable_permissive_traffic_policy_mode
        || old.observability.tracing != new.observability.tracing
        || old_authz.enable != new_authz.enable
        || (new_authz.enable && old_authz != new_authz)
        || old.feature_flags != new.feature_flags
}
