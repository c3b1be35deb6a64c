#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Versioned per-proxy snapshots and the aggregated discovery streams that
//! serve them over gRPC.

mod cache;
mod grpc;
mod message;
mod metrics;
mod server;
mod snapshot;
mod xds_log;

#[cfg(test)]
mod tests;

pub use self::{
    cache::{SnapshotCache, SnapshotRx},
    grpc::AdsService,
    message::{DiscoveryRequest, DiscoveryResponse, PeerCertificate, PeerInfo},
    metrics::DiscoveryMetrics,
    server::{DiscoveryServer, ResponseStream, StreamCallbacks},
    snapshot::{InconsistentSnapshot, Snapshot},
    xds_log::{XdsLog, MAX_ENTRIES as MAX_XDS_LOG_ENTRIES},
};
