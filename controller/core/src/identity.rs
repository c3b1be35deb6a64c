use std::{fmt, str::FromStr};

/// The trust identity a workload presents, rendered as `<service-account>.<namespace>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    pub service_account: String,
    pub namespace: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid service identity: {0}")]
pub struct InvalidIdentity(String);

/// The issuers a certificate manager signs and validates with.
///
/// During root rotation the two may differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerInfo {
    pub signing: Issuer,
    pub validating: Issuer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issuer {
    pub id: String,
    pub trust_domain: String,
    pub spiffe_enabled: bool,
}

// === impl ServiceIdentity ===

impl ServiceIdentity {
    pub fn new(service_account: impl ToString, namespace: impl ToString) -> Self {
        Self {
            service_account: service_account.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// The name used as a SAN for this identity within the given trust domain.
    pub fn to_dns_name(&self, trust_domain: &str) -> String {
        format!("{self}.{trust_domain}")
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_account, self.namespace)
    }
}

impl FromStr for ServiceIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((sa, ns)) if !sa.is_empty() && !ns.is_empty() && !ns.contains('.') => {
                Ok(Self::new(sa, ns))
            }
            _ => Err(InvalidIdentity(s.to_string())),
        }
    }
}

// === impl IssuerInfo ===

impl IssuerInfo {
    pub fn single(issuer: Issuer) -> Self {
        Self {
            signing: issuer.clone(),
            validating: issuer,
        }
    }

    /// SPIFFE IDs may only be trusted as the primary identity when every
    /// issuer in play sets them.
    pub fn spiffe_enabled(&self) -> bool {
        self.signing.spiffe_enabled && self.validating.spiffe_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity() {
        let si = "bookstore.bookstore-ns"
            .parse::<ServiceIdentity>()
            .expect("should parse");
        assert_eq!(si, ServiceIdentity::new("bookstore", "bookstore-ns"));
        assert_eq!(si.to_string(), "bookstore.bookstore-ns");
        assert_eq!(
            si.to_dns_name("cluster.local"),
            "bookstore.bookstore-ns.cluster.local"
        );
    }

    #[test]
    fn rejects_malformed_identity() {
        for s in ["", "bookstore", ".ns", "sa.", "a.b.c"] {
            assert!(s.parse::<ServiceIdentity>().is_err(), "{s} must not parse");
        }
    }
}
