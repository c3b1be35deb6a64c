//! Mesh-wide settings, read from the mesh configuration resource.
//!
//! Only the fields this controller consumes are modeled. Unknown fields are
//! ignored when deserializing.

use crate::GoDuration;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    pub sidecar: SidecarSpec,
    pub traffic: TrafficSpec,
    pub observability: ObservabilitySpec,
    pub certificate: CertificateSpec,
    pub feature_flags: FeatureFlags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarSpec {
    pub log_level: String,

    /// The most proxies allowed to be connected at once. Zero disables the limit.
    pub max_data_plane_connections: usize,

    /// How often every proxy is resynced regardless of changes. Zero disables
    /// the periodic resync.
    pub config_resync_interval: GoDuration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficSpec {
    pub enable_egress: bool,
    pub enable_permissive_traffic_policy_mode: bool,
    pub outbound_port_exclusion_list: Vec<u16>,
    pub inbound_port_exclusion_list: Vec<u16>,
    pub inbound_external_authorization: ExternalAuthzSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalAuthzSpec {
    pub enable: bool,
    pub address: String,
    pub port: u16,
    pub stat_prefix: String,
    pub timeout: GoDuration,
    pub failure_mode_allow: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservabilitySpec {
    pub log_level: String,
    pub enable_debug_server: bool,
    pub tracing: TracingSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracingSpec {
    pub enable: bool,
    pub address: String,
    pub port: u16,
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateSpec {
    pub service_cert_validity_duration: GoDuration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    #[serde(rename = "enableWASMStats")]
    pub enable_wasm_stats: bool,
    pub enable_egress_policy: bool,
    pub enable_ingress_backend_policy: bool,
    pub enable_envoy_active_health_checks: bool,
    pub enable_retry_policy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn deserializes_partial_config() {
        let config: MeshConfig = serde_json::from_str(
            r#"{
                "sidecar": {
                    "logLevel": "error",
                    "maxDataPlaneConnections": 100,
                    "configResyncInterval": "90s",
                    "envoyImage": "ignored"
                },
                "traffic": {
                    "enableEgress": true,
                    "inboundExternalAuthorization": {"enable": true, "timeout": "1s"}
                },
                "featureFlags": {"enableWASMStats": true}
            }"#,
        )
        .expect("should deserialize");

        assert_eq!(config.sidecar.max_data_plane_connections, 100);
        assert_eq!(
            config.sidecar.config_resync_interval.as_duration(),
            Duration::from_secs(90)
        );
        assert!(config.traffic.enable_egress);
        assert!(!config.traffic.enable_permissive_traffic_policy_mode);
        assert!(config.traffic.inbound_external_authorization.enable);
        assert!(config.feature_flags.enable_wasm_stats);
        assert_eq!(config.observability, ObservabilitySpec::default());
    }
}
