use crate::snapshot::Snapshot;
use ahash::AHashMap as HashMap;
use meshplane_controller_core::{resources::ResourceBundle, Proxy, ProxyUpdater, Uuid};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::watch;
use tracing::{debug, trace};

pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// Holds the latest snapshot for each proxy and notifies its streams when a
/// new one is set.
///
/// A proxy's versions never go backwards, even across a prune: new entries
/// start above the highest version any pruned entry reached, so a
/// reconnecting proxy never sees a version it has already acknowledged.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCache {
    entries: Arc<RwLock<HashMap<Uuid, Entry>>>,
    floor: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Entry {
    /// The last version published. Held while a snapshot is built and
    /// published so versions are assigned and observed in order.
    version: Mutex<u64>,
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl Entry {
    fn new(floor: u64) -> Self {
        Self {
            version: Mutex::new(floor),
            tx: watch::channel(None).0,
        }
    }

    fn publish(&self, uuid: Uuid, bundle: ResourceBundle) -> anyhow::Result<u64> {
        let mut version = self.version.lock();
        let next = *version + 1;
        let snapshot = Snapshot::new(next, bundle)?;
        *version = next;
        self.tx.send_replace(Some(Arc::new(snapshot)));
        trace!(%uuid, version = next, "Published snapshot");
        Ok(next)
    }
}

impl SnapshotCache {
    /// Builds a snapshot from `bundle` at the proxy's next version and
    /// publishes it.
    ///
    /// Inconsistent bundles are rejected without consuming a version, and the
    /// previous snapshot remains in place.
    pub fn set_snapshot(&self, uuid: Uuid, bundle: ResourceBundle) -> anyhow::Result<u64> {
        // The map lock is held while publishing so a concurrent prune cannot
        // detach the entry being published to.
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&uuid) {
                return entry.publish(uuid, bundle);
            }
        }
        let mut entries = self.entries.write();
        let floor = self.floor.load(Ordering::Acquire);
        entries
            .entry(uuid)
            .or_insert_with(|| Entry::new(floor))
            .publish(uuid, bundle)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<Snapshot>> {
        let entries = self.entries.read();
        let entry = entries.get(uuid)?;
        let snapshot = entry.tx.borrow().clone();
        snapshot
    }

    /// Watches a proxy's snapshots. The receiver initially holds the current
    /// snapshot, if there is one.
    pub fn watch(&self, uuid: Uuid) -> SnapshotRx {
        let mut entries = self.entries.write();
        let floor = self.floor.load(Ordering::Acquire);
        entries
            .entry(uuid)
            .or_insert_with(|| Entry::new(floor))
            .tx
            .subscribe()
    }

    /// Forgets a proxy once no stream is watching it. Returns true if the
    /// entry was removed.
    pub fn prune(&self, uuid: &Uuid) -> bool {
        let mut entries = self.entries.write();
        match entries.get(uuid) {
            Some(entry) if entry.tx.receiver_count() == 0 => {
                let version = *entry.version.lock();
                self.floor.fetch_max(version, Ordering::AcqRel);
                entries.remove(uuid);
                debug!(%uuid, version, "Removed snapshot");
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ProxyUpdater<ResourceBundle> for SnapshotCache {
    async fn update_proxy(&self, proxy: &Proxy, bundle: ResourceBundle) -> anyhow::Result<()> {
        let version = self.set_snapshot(proxy.uuid, bundle)?;
        debug!(%proxy, version, "Updated proxy snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_controller_core::resources::{Resource, TypeUrl};

    fn bundle(cluster: &str) -> ResourceBundle {
        ResourceBundle::default().with(TypeUrl::Cluster, Resource::new(cluster, "c"))
    }

    #[test]
    fn versions_increase_per_proxy() {
        let cache = SnapshotCache::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(cache.set_snapshot(a, bundle("a")).unwrap(), 1);
        assert_eq!(cache.set_snapshot(a, bundle("a")).unwrap(), 2);
        assert_eq!(cache.set_snapshot(b, bundle("b")).unwrap(), 1);
        assert_eq!(cache.get(&a).unwrap().version(), 2);
    }

    #[test]
    fn inconsistent_snapshots_are_not_published() {
        let cache = SnapshotCache::default();
        let uuid = Uuid::new_v4();
        cache.set_snapshot(uuid, bundle("a")).unwrap();

        let dangling = ResourceBundle::default().with(
            TypeUrl::Listener,
            Resource::new("l", "l").with_reference(TypeUrl::Route, "missing"),
        );
        assert!(cache.set_snapshot(uuid, dangling).is_err());
        assert_eq!(cache.get(&uuid).unwrap().version(), 1);

        // No version is skipped.
        assert_eq!(cache.set_snapshot(uuid, bundle("a")).unwrap(), 2);
    }

    #[test]
    fn concurrent_updates_do_not_skip_versions() {
        let cache = SnapshotCache::default();
        let uuid = Uuid::new_v4();
        let threads = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| cache.set_snapshot(uuid, bundle("a")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut versions = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect::<Vec<_>>();
        versions.sort_unstable();
        assert_eq!(versions, (1..=400).collect::<Vec<_>>());
        assert_eq!(cache.get(&uuid).unwrap().version(), 400);
    }

    #[tokio::test]
    async fn watchers_observe_new_snapshots() {
        let cache = SnapshotCache::default();
        let uuid = Uuid::new_v4();
        let mut rx = cache.watch(uuid);
        assert!(rx.borrow().is_none());

        cache.set_snapshot(uuid, bundle("a")).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().version(), 1);

        assert!(!cache.prune(&uuid), "entry is still watched");
        drop(rx);
        assert!(cache.prune(&uuid));
        assert!(cache.is_empty());
    }

    #[test]
    fn versions_survive_reconnects() {
        let cache = SnapshotCache::default();
        let uuid = Uuid::new_v4();
        let rx = cache.watch(uuid);
        cache.set_snapshot(uuid, bundle("a")).unwrap();
        let before = cache.set_snapshot(uuid, bundle("a")).unwrap();
        assert_eq!(before, 2);

        drop(rx);
        assert!(cache.prune(&uuid));
        assert!(cache.get(&uuid).is_none());

        let rx = cache.watch(uuid);
        assert!(rx.borrow().is_none());
        let after = cache.set_snapshot(uuid, bundle("a")).unwrap();
        assert!(after > before, "{after} must follow {before}");
        assert_eq!(rx.borrow().as_ref().unwrap().version(), after);
    }

    #[test]
    fn prunes_do_not_race_publishes() {
        let cache = SnapshotCache::default();
        let uuid = Uuid::new_v4();

        let publisher = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                (0..500)
                    .map(|_| cache.set_snapshot(uuid, bundle("a")).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        let pruner = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    drop(cache.watch(uuid));
                    cache.prune(&uuid);
                }
            })
        };

        let versions = publisher.join().unwrap();
        pruner.join().unwrap();
        assert!(
            versions.windows(2).all(|w| w[0] < w[1]),
            "versions must strictly increase"
        );
        if let Some(snapshot) = cache.get(&uuid) {
            assert_eq!(Some(&snapshot.version()), versions.last());
        }
    }
}
