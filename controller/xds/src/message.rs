use std::net::SocketAddr;

/// A state-of-the-world discovery request, as sent on an aggregated stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// The version the proxy last accepted for this type; empty initially.
    pub version_info: String,
    pub node_id: String,
    /// Resources the proxy is interested in. Empty means all of them.
    pub resource_names: Vec<String>,
    pub type_url: String,
    /// The nonce of the response being acknowledged; empty initially.
    pub response_nonce: String,
    /// Set when the proxy rejected the response named by `response_nonce`.
    pub error_detail: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<prost_types::Any>,
    pub type_url: String,
    pub nonce: String,
}

/// What the transport knows about a connecting proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: Option<SocketAddr>,
    /// The verified client certificate, if the stream is authenticated.
    pub certificate: Option<PeerCertificate>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerCertificate {
    pub common_name: String,
    pub serial_number: String,
    pub uri_sans: Vec<String>,
}

// === impl DiscoveryRequest ===

impl DiscoveryRequest {
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}
