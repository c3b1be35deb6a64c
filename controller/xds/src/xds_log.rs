use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use meshplane_controller_core::{resources::TypeUrl, Uuid};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

/// The number of response timestamps kept per proxy and type.
pub const MAX_ENTRIES: usize = 20;

/// Records when each proxy was last sent each resource type, for debugging.
#[derive(Clone, Debug, Default)]
pub struct XdsLog(Arc<Mutex<HashMap<Uuid, HashMap<TypeUrl, VecDeque<DateTime<Utc>>>>>>);

impl XdsLog {
    pub fn record(&self, uuid: Uuid, type_url: TypeUrl) {
        self.record_at(uuid, type_url, Utc::now())
    }

    fn record_at(&self, uuid: Uuid, type_url: TypeUrl, at: DateTime<Utc>) {
        let mut log = self.0.lock();
        let entries = log.entry(uuid).or_default().entry(type_url).or_default();
        if entries.len() == MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(at);
    }

    /// Returns a copy of the entries for a proxy, oldest first.
    pub fn get(&self, uuid: &Uuid) -> Vec<(TypeUrl, Vec<DateTime<Utc>>)> {
        let log = self.0.lock();
        let Some(by_type) = log.get(uuid) else {
            return Vec::new();
        };
        let mut entries = by_type
            .iter()
            .map(|(t, ts)| (*t, ts.iter().copied().collect()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(t, _)| *t);
        entries
    }

    pub fn remove(&self, uuid: &Uuid) {
        self.0.lock().remove(uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn keeps_most_recent_entries() {
        let log = XdsLog::default();
        let uuid = Uuid::new_v4();
        let start = Utc::now();
        for i in 0..(MAX_ENTRIES as i64 + 5) {
            log.record_at(uuid, TypeUrl::Cluster, start + TimeDelta::seconds(i));
        }
        log.record(uuid, TypeUrl::Secret);

        let entries = log.get(&uuid);
        assert_eq!(entries.len(), 2);
        let (type_url, cds) = &entries[0];
        assert_eq!(*type_url, TypeUrl::Cluster);
        assert_eq!(cds.len(), MAX_ENTRIES);
        assert_eq!(cds[0], start + TimeDelta::seconds(5));
        assert_eq!(entries[1].1.len(), 1);

        log.remove(&uuid);
        assert!(log.get(&uuid).is_empty());
    }
}
