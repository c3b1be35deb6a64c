use crate::mesh_config::MeshConfig;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// The kinds of resources whose changes flow through the broker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A synthetic kind requesting that proxies regenerate their config.
    Proxy,
    Pod,
    Endpoint,
    Namespace,
    Service,
    ServiceAccount,
    Ingress,
    TrafficSplit,
    RouteGroup,
    TcpRoute,
    TrafficTarget,
    MeshConfig,
    MeshRootCertificate,
    Egress,
    IngressBackend,
    Retry,
    UpstreamTrafficSetting,
    Telemetry,
    ExtensionService,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

/// A resource kind paired with what happened to it. Its string form, e.g.
/// `endpoint-added`, names the topic the event is published on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKind {
    pub kind: Kind,
    pub event_type: EventType,
}

/// A change notification.
///
/// The payload variant carried depends on `kind`; consumers must match on
/// it and treat an unexpected variant as a no-op.
#[derive(Clone, Debug, PartialEq)]
pub struct PubSubMessage {
    pub kind: EventKind,
    pub old: Option<Payload>,
    pub new: Option<Payload>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    MeshConfig(Arc<MeshConfig>),
    Pod(Arc<PodMeta>),
    Object(ObjectRef),
}

/// The parts of a pod the broker inspects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodMeta {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub namespace: Option<String>,
    pub name: String,
}

// === impl Kind ===

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Pod => "pod",
            Self::Endpoint => "endpoint",
            Self::Namespace => "namespace",
            Self::Service => "service",
            Self::ServiceAccount => "serviceaccount",
            Self::Ingress => "ingress",
            Self::TrafficSplit => "trafficsplit",
            Self::RouteGroup => "routegroup",
            Self::TcpRoute => "tcproute",
            Self::TrafficTarget => "traffictarget",
            Self::MeshConfig => "meshconfig",
            Self::MeshRootCertificate => "meshrootcertificate",
            Self::Egress => "egress",
            Self::IngressBackend => "ingressbackend",
            Self::Retry => "retry",
            Self::UpstreamTrafficSetting => "upstreamtrafficsetting",
            Self::Telemetry => "telemetry",
            Self::ExtensionService => "extensionservice",
        }
    }

    pub fn added(self) -> EventKind {
        EventKind::new(self, EventType::Added)
    }

    pub fn updated(self) -> EventKind {
        EventKind::new(self, EventType::Updated)
    }

    pub fn deleted(self) -> EventKind {
        EventKind::new(self, EventType::Deleted)
    }
}

// === impl EventType ===

impl EventType {
    pub const ALL: [EventType; 3] = [Self::Added, Self::Updated, Self::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

// === impl EventKind ===

impl EventKind {
    pub const PROXY_UPDATE: Self = Self::new(Kind::Proxy, EventType::Updated);

    pub const fn new(kind: Kind, event_type: EventType) -> Self {
        Self { kind, event_type }
    }

    pub fn topic(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.as_str(), self.event_type.as_str())
    }
}

// === impl PubSubMessage ===

impl PubSubMessage {
    pub fn added(kind: Kind, new: Payload) -> Self {
        Self {
            kind: kind.added(),
            old: None,
            new: Some(new),
        }
    }

    pub fn updated(kind: Kind, old: Payload, new: Payload) -> Self {
        Self {
            kind: kind.updated(),
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn deleted(kind: Kind, old: Payload) -> Self {
        Self {
            kind: kind.deleted(),
            old: Some(old),
            new: None,
        }
    }

    /// A request that every proxy regenerate its config.
    pub fn proxy_update() -> Self {
        Self {
            kind: EventKind::PROXY_UPDATE,
            old: None,
            new: None,
        }
    }
}

// === impl Payload ===

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MeshConfig(_) => "MeshConfig",
            Self::Pod(_) => "Pod",
            Self::Object(_) => "Object",
        }
    }

    pub fn object(namespace: Option<String>, name: impl ToString) -> Self {
        Self::Object(ObjectRef {
            namespace,
            name: name.to_string(),
        })
    }
}
