//! Serves [`DiscoveryServer`] streams as Envoy's aggregated discovery gRPC
//! service.

use crate::{
    message::{DiscoveryRequest, DiscoveryResponse, PeerCertificate, PeerInfo},
    server::{DiscoveryServer, StreamCallbacks},
};
use envoy_types::pb::{
    envoy::service::discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest as EnvoyRequest,
        DiscoveryResponse as EnvoyResponse,
    },
    google::protobuf::Any,
};
use futures::prelude::*;
use std::pin::Pin;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};
use x509_parser::{certificate::X509Certificate, extensions::GeneralName};

/// The aggregated discovery service, backed by a [`DiscoveryServer`].
#[derive(Debug)]
pub struct AdsService<C> {
    server: DiscoveryServer<C>,
}

type EnvoyStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

// === impl AdsService ===

impl<C: StreamCallbacks> AdsService<C> {
    pub fn new(server: DiscoveryServer<C>) -> Self {
        Self { server }
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl<C: StreamCallbacks> AggregatedDiscoveryService for AdsService<C> {
    type StreamAggregatedResourcesStream = EnvoyStream<EnvoyResponse>;
    type DeltaAggregatedResourcesStream = EnvoyStream<DeltaDiscoveryResponse>;

    async fn stream_aggregated_resources(
        &self,
        req: Request<Streaming<EnvoyRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let peer = peer_info(&req);
        let requests = req.into_inner().map_ok(DiscoveryRequest::from);
        let responses = self.server.stream_aggregated_resources(peer, requests)?;
        Ok(Response::new(Box::pin(
            responses.map_ok(EnvoyResponse::from),
        )))
    }

    async fn delta_aggregated_resources(
        &self,
        req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        let peer = peer_info(&req);
        match self
            .server
            .delta_aggregated_resources(peer, req.into_inner())
        {
            Ok(_) => Err(Status::unimplemented("delta discovery is not supported")),
            Err(status) => Err(status),
        }
    }
}

fn peer_info<T>(req: &Request<T>) -> PeerInfo {
    let certificate = req.peer_certs().and_then(|certs| {
        // The leaf certificate comes first.
        let leaf = certs.first()?;
        parse_certificate(leaf.as_ref())
    });
    PeerInfo {
        addr: req.remote_addr(),
        certificate,
    }
}

/// Reads the fields a proxy's identity is derived from out of a DER-encoded
/// certificate.
fn parse_certificate(der: &[u8]) -> Option<PeerCertificate> {
    let cert = match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => cert,
        Err(error) => {
            warn!(%error, "Failed to parse client certificate");
            return None;
        }
    };

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let uri_sans = uri_sans(&cert);
    debug!(%common_name, ?uri_sans, "Parsed client certificate");
    Some(PeerCertificate {
        common_name,
        serial_number: cert.raw_serial_as_string(),
        uri_sans,
    })
}

fn uri_sans(cert: &X509Certificate<'_>) -> Vec<String> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::URI(uri) => Some(uri.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(error) => {
            warn!(%error, "Invalid subject alternative names");
            Vec::new()
        }
    }
}

// === impl DiscoveryRequest ===

impl From<EnvoyRequest> for DiscoveryRequest {
    fn from(req: EnvoyRequest) -> Self {
        Self {
            version_info: req.version_info,
            node_id: req.node.map(|node| node.id).unwrap_or_default(),
            resource_names: req.resource_names,
            type_url: req.type_url,
            response_nonce: req.response_nonce,
            error_detail: req.error_detail.map(|status| status.message),
        }
    }
}

// === impl DiscoveryResponse ===

impl From<DiscoveryResponse> for EnvoyResponse {
    fn from(rsp: DiscoveryResponse) -> Self {
        Self {
            version_info: rsp.version_info,
            resources: rsp
                .resources
                .into_iter()
                .map(|any| Any {
                    type_url: any.type_url,
                    value: any.value,
                })
                .collect(),
            type_url: rsp.type_url,
            nonce: rsp.nonce,
            ..Default::default()
        }
    }
}
