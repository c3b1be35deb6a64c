//! Derives a proxy's identity from its client certificate.

use meshplane_controller_core::{
    identity::IssuerInfo, ProxyKind, ServiceIdentity, Uuid,
};
use meshplane_controller_xds::PeerInfo;
use tracing::{debug, info};

/// The identity a proxy's certificate claims.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdentity {
    pub kind: ProxyKind,
    pub uuid: Uuid,
    pub identity: ServiceIdentity,
    pub serial_number: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no verified client certificate")]
    NoCertificate,

    #[error("invalid certificate common name {0:?}")]
    InvalidCommonName(String),

    #[error("invalid proxy UUID {0:?}")]
    InvalidUuid(String),

    #[error("unknown proxy kind {0:?}")]
    InvalidKind(String),

    #[error("expected exactly one SPIFFE ID, found {0}")]
    SpiffeIdCount(usize),

    #[error("invalid SPIFFE ID {0:?}")]
    InvalidSpiffeId(String),

    #[error("trust domain {0:?} does not match any issuer")]
    UntrustedDomain(String),

    #[error("SPIFFE ID {0:?} does not match the certificate common name")]
    SpiffeIdMismatch(String),
}

/// Validates the peer's certificate.
///
/// The common name must be `<uuid>.<kind>.<service-account>.<namespace>.<trust-domain>`.
/// The trust domain must belong to the signing or validating issuer. When
/// every issuer sets SPIFFE IDs, the service identity is read from the
/// certificate's SPIFFE ID instead, whose UUID and kind must agree with the
/// common name.
pub fn validate_client(
    peer: &PeerInfo,
    issuers: &IssuerInfo,
) -> Result<ClientIdentity, ValidationError> {
    let cert = peer
        .certificate
        .as_ref()
        .ok_or(ValidationError::NoCertificate)?;

    let cn = parse_common_name(&cert.common_name)?;
    check_trust_domain(cn.trust_domain, issuers)?;
    let identity = if issuers.spiffe_enabled() {
        parse_spiffe_id(&cert.uri_sans, &cn, issuers)?
    } else {
        cn.identity
    };
    let (kind, uuid) = (cn.kind, cn.uuid);

    debug!(serial = %cert.serial_number, %uuid, %kind, %identity, "Validated client certificate");
    Ok(ClientIdentity {
        kind,
        uuid,
        identity,
        serial_number: cert.serial_number.clone(),
    })
}

struct CommonName<'a> {
    kind: ProxyKind,
    uuid: Uuid,
    identity: ServiceIdentity,
    trust_domain: &'a str,
}

fn check_trust_domain(trust_domain: &str, issuers: &IssuerInfo) -> Result<(), ValidationError> {
    if trust_domain == issuers.signing.trust_domain || trust_domain == issuers.validating.trust_domain
    {
        return Ok(());
    }
    Err(ValidationError::UntrustedDomain(trust_domain.to_string()))
}

fn parse_common_name(cn: &str) -> Result<CommonName<'_>, ValidationError> {
    let invalid = || ValidationError::InvalidCommonName(cn.to_string());

    // The trust domain may itself contain dots.
    let mut parts = cn.splitn(5, '.');
    let mut label = || parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid);
    let uuid = label()?;
    let kind = label()?;
    let sa = label()?;
    let ns = label()?;
    let trust_domain = label()?;

    let uuid = uuid
        .parse::<Uuid>()
        .map_err(|_| ValidationError::InvalidUuid(uuid.to_string()))?;
    let kind = kind
        .parse::<ProxyKind>()
        .map_err(|_| ValidationError::InvalidKind(kind.to_string()))?;
    Ok(CommonName {
        kind,
        uuid,
        identity: ServiceIdentity::new(sa, ns),
        trust_domain,
    })
}

/// Parses `spiffe://<trust-domain>/<uuid>/<kind>/<service-account>/<namespace>`.
fn parse_spiffe_id(
    uris: &[String],
    cn: &CommonName<'_>,
    issuers: &IssuerInfo,
) -> Result<ServiceIdentity, ValidationError> {
    let [uri] = uris else {
        return Err(ValidationError::SpiffeIdCount(uris.len()));
    };
    let invalid = || ValidationError::InvalidSpiffeId(uri.clone());

    let (trust_domain, path) = uri
        .strip_prefix("spiffe://")
        .and_then(|rest| rest.split_once('/'))
        .ok_or_else(invalid)?;
    let parts = path.trim_matches('/').split('/').collect::<Vec<_>>();
    let [uuid, kind, sa, ns] = parts.as_slice() else {
        return Err(invalid());
    };
    if sa.is_empty() || ns.is_empty() {
        return Err(invalid());
    }
    check_trust_domain(trust_domain, issuers)?;

    let same_uuid = uuid.parse::<Uuid>().is_ok_and(|u| u == cn.uuid);
    let same_kind = kind.parse::<ProxyKind>().is_ok_and(|k| k == cn.kind);
    if !same_uuid || !same_kind {
        return Err(ValidationError::SpiffeIdMismatch(uri.clone()));
    }

    let identity = ServiceIdentity::new(sa, ns);
    info!(spiffe_id = %uri, %identity, "Extracted proxy identity from SPIFFE ID");
    Ok(identity)
}
