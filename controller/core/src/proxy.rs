use crate::ServiceIdentity;
use chrono::{DateTime, Utc};
use std::{fmt, net::SocketAddr, str::FromStr};
use uuid::Uuid;

/// Identifies a single discovery stream. Assigned in increasing order, so a
/// reconnecting proxy's newest stream always carries the largest id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Sidecar,
    Gateway,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown proxy kind: {0}")]
pub struct InvalidProxyKind(String);

/// A connected data-plane instance.
///
/// Created once its stream's client identity has been validated, and never
/// modified afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proxy {
    pub kind: ProxyKind,
    pub uuid: Uuid,
    pub identity: ServiceIdentity,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub peer_addr: Option<SocketAddr>,
}

// === impl ConnectionId ===

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl ProxyKind ===

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sidecar => "sidecar",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = InvalidProxyKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sidecar" => Ok(Self::Sidecar),
            "gateway" => Ok(Self::Gateway),
            _ => Err(InvalidProxyKind(s.to_string())),
        }
    }
}

// === impl Proxy ===

impl Proxy {
    pub fn new(
        kind: ProxyKind,
        uuid: Uuid,
        identity: ServiceIdentity,
        peer_addr: Option<SocketAddr>,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            kind,
            uuid,
            identity,
            connection_id,
            connected_at: Utc::now(),
            peer_addr,
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind, self.identity, self.uuid, self.connection_id
        )
    }
}
