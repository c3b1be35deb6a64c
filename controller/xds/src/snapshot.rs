use meshplane_controller_core::resources::{Resource, ResourceBundle, TypeUrl};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;

/// An immutable, versioned set of resources for one proxy.
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    resources: BTreeMap<TypeUrl, Vec<Resource>>,
    created_at: Instant,
}

/// A resource refers to another that is not part of the same snapshot.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{type_url} resource {name} references missing {missing_type} resource {missing}")]
pub struct InconsistentSnapshot {
    pub type_url: TypeUrl,
    pub name: String,
    pub missing_type: TypeUrl,
    pub missing: String,
}

impl Snapshot {
    /// Builds a snapshot, failing if any resource references one that the
    /// bundle does not contain.
    pub fn new(version: u64, bundle: ResourceBundle) -> Result<Self, InconsistentSnapshot> {
        let resources = bundle.into_inner();

        let names = resources
            .iter()
            .flat_map(|(t, rs)| rs.iter().map(move |r| (*t, r.name.as_str())))
            .collect::<BTreeSet<_>>();

        for (type_url, rs) in &resources {
            for r in rs {
                for (ref_type, ref_name) in &r.references {
                    if !names.contains(&(*ref_type, ref_name.as_str())) {
                        return Err(InconsistentSnapshot {
                            type_url: *type_url,
                            name: r.name.clone(),
                            missing_type: *ref_type,
                            missing: ref_name.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            version,
            resources,
            created_at: Instant::now(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn version_info(&self) -> String {
        self.version.to_string()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn resources(&self, type_url: TypeUrl) -> &[Resource] {
        self.resources.get(&type_url).map_or(&[], Vec::as_slice)
    }

    /// The resources of a type, limited to `names` unless it is empty.
    pub fn select<'a>(
        &'a self,
        type_url: TypeUrl,
        names: &'a [String],
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources(type_url)
            .iter()
            .filter(move |r| names.is_empty() || names.iter().any(|n| *n == r.name))
    }
}
