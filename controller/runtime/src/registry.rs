use ahash::AHashMap as HashMap;
use meshplane_controller_core::{ConnectionId, Proxy, Uuid};
use parking_lot::RwLock;
use std::sync::Arc;

/// The proxies with an open discovery stream, keyed by connection id.
#[derive(Clone, Debug, Default)]
pub struct ProxyRegistry {
    proxies: Arc<RwLock<HashMap<ConnectionId, Arc<Proxy>>>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("too many data plane connections (limit {limit})")]
pub struct TooManyConnections {
    pub limit: usize,
}

impl ProxyRegistry {
    pub fn register_proxy(&self, proxy: Arc<Proxy>) {
        self.proxies.write().insert(proxy.connection_id, proxy);
    }

    /// Registers the proxy unless `limit` proxies are already connected. A
    /// limit of 0 admits every proxy.
    pub fn try_register_proxy(
        &self,
        proxy: Arc<Proxy>,
        limit: usize,
    ) -> Result<(), TooManyConnections> {
        let mut proxies = self.proxies.write();
        if limit > 0 && proxies.len() >= limit {
            return Err(TooManyConnections { limit });
        }
        proxies.insert(proxy.connection_id, proxy);
        Ok(())
    }

    /// Returns the proxy if it was registered.
    pub fn unregister_proxy(&self, connection_id: ConnectionId) -> Option<Arc<Proxy>> {
        self.proxies.write().remove(&connection_id)
    }

    pub fn get_connected_proxy(&self, connection_id: ConnectionId) -> Option<Arc<Proxy>> {
        self.proxies.read().get(&connection_id).cloned()
    }

    pub fn get_connected_proxy_count(&self) -> usize {
        self.proxies.read().len()
    }

    /// Lists one proxy per UUID. When a proxy has reconnected, only its newest
    /// connection is listed.
    pub fn list_connected_proxies(&self) -> Vec<Arc<Proxy>> {
        let proxies = self.proxies.read();
        let mut by_uuid = HashMap::<Uuid, &Arc<Proxy>>::default();
        for proxy in proxies.values() {
            by_uuid
                .entry(proxy.uuid)
                .and_modify(|p| {
                    if proxy.connection_id > p.connection_id {
                        *p = proxy;
                    }
                })
                .or_insert(proxy);
        }
        let mut list = by_uuid.into_values().cloned().collect::<Vec<_>>();
        list.sort_by_key(|p| p.connection_id);
        list
    }
}
