use bytes::Bytes;
use std::{collections::BTreeMap, fmt, str::FromStr};

/// The aggregated discovery resource types served to proxies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeUrl {
    Cluster,
    Endpoint,
    Listener,
    Route,
    Secret,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown resource type: {0}")]
pub struct UnknownTypeUrl(pub String);

/// A single named discovery resource.
///
/// `references` names the resources this one depends on. Each must be
/// present in the same bundle for the bundle to be served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub references: Vec<(TypeUrl, String)>,
    pub payload: Bytes,
}

/// Everything generated for one proxy, grouped by type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceBundle {
    by_type: BTreeMap<TypeUrl, Vec<Resource>>,
}

// === impl TypeUrl ===

impl TypeUrl {
    pub const ALL: [TypeUrl; 5] = [
        Self::Cluster,
        Self::Endpoint,
        Self::Listener,
        Self::Route,
        Self::Secret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            Self::Endpoint => "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment",
            Self::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            Self::Route => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            Self::Secret => "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
        }
    }

    /// A short label for logs and metrics.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Cluster => "CDS",
            Self::Endpoint => "EDS",
            Self::Listener => "LDS",
            Self::Route => "RDS",
            Self::Secret => "SDS",
        }
    }
}

impl fmt::Display for TypeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for TypeUrl {
    type Err = UnknownTypeUrl;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTypeUrl(s.to_string()))
    }
}

// === impl Resource ===

impl Resource {
    pub fn new(name: impl ToString, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            references: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_reference(mut self, type_url: TypeUrl, name: impl ToString) -> Self {
        self.references.push((type_url, name.to_string()));
        self
    }
}

// === impl ResourceBundle ===

impl ResourceBundle {
    pub fn push(&mut self, type_url: TypeUrl, resource: Resource) {
        self.by_type.entry(type_url).or_default().push(resource);
    }

    pub fn with(mut self, type_url: TypeUrl, resource: Resource) -> Self {
        self.push(type_url, resource);
        self
    }

    pub fn get(&self, type_url: TypeUrl) -> &[Resource] {
        self.by_type.get(&type_url).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeUrl, &[Resource])> + '_ {
        self.by_type.iter().map(|(t, rs)| (*t, rs.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> BTreeMap<TypeUrl, Vec<Resource>> {
        self.by_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_urls_parse() {
        for t in TypeUrl::ALL {
            assert_eq!(t.as_str().parse::<TypeUrl>(), Ok(t));
        }
        assert!("type.googleapis.com/envoy.config.core.v3.Node"
            .parse::<TypeUrl>()
            .is_err());
    }

    #[test]
    fn bundle_groups_by_type() {
        let bundle = ResourceBundle::default()
            .with(TypeUrl::Cluster, Resource::new("a", "x"))
            .with(TypeUrl::Cluster, Resource::new("b", "y"))
            .with(TypeUrl::Secret, Resource::new("s", "z"));
        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.get(TypeUrl::Cluster).len(), 2);
        assert!(bundle.get(TypeUrl::Route).is_empty());
    }
}
