#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Wires the broker, per-proxy update schedulers, config generation and the
//! discovery server into a running control plane.

pub use meshplane_controller_broker as broker;
pub use meshplane_controller_core as core;
pub use meshplane_controller_xds as xds;

mod args;
mod certificate;
mod control_plane;
mod events;
mod generator;
mod index_list;
mod k8s;
mod metrics;
mod registry;
mod scheduler;
mod single_flight;
mod validation;
mod workerpool;


pub use self::{
    args::{Args, Controller, MeshControlPlane},
    certificate::InMemoryCertManager,
    control_plane::{ConnectError, ControlPlane},
    events::Events,
    generator::MeshConfigGenerator,
    k8s::{Index, IndexCatalog, MeshConfigRef, SharedIndex, MESH_CONFIG_KEY},
    metrics::{ControlPlaneMetrics, RejectReason, UpdateStage},
    registry::{ProxyRegistry, TooManyConnections},
    scheduler::SchedulerConfig,
    single_flight::{Flight, SingleFlight},
    validation::{validate_client, ClientIdentity, ValidationError},
    workerpool::{JobHandle, PoolStopped, WorkerPool},
};
