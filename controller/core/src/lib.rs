#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod catalog;
pub mod certificate;
mod duration;
pub mod event;
pub mod identity;
pub mod mesh_config;
pub mod proxy;
pub mod pubsub;
pub mod resources;

pub use self::{
    duration::{GoDuration, ParseError},
    identity::ServiceIdentity,
    proxy::{ConnectionId, Proxy, ProxyKind},
};
pub use uuid::Uuid;

/// Turns a proxy into the configuration it should be serving.
///
/// Implementations must be safe to call concurrently for different proxies.
/// A single proxy is never generated for concurrently.
#[async_trait::async_trait]
pub trait ProxyConfigGenerator: Send + Sync + 'static {
    type Config: Send + 'static;

    async fn generate_config(&self, proxy: &Proxy) -> anyhow::Result<Self::Config>;
}

/// Accepts generated configuration for a proxy.
#[async_trait::async_trait]
pub trait ProxyUpdater<T>: Send + Sync + 'static {
    async fn update_proxy(&self, proxy: &Proxy, config: T) -> anyhow::Result<()>;
}
