use crate::{identity::IssuerInfo, pubsub::Subscription, ServiceIdentity};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};

/// An issued certificate and its key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub common_name: String,
    pub serial_number: String,
    pub identity: ServiceIdentity,
    pub expiration: DateTime<Utc>,
    pub cert_chain: Bytes,
    pub private_key: Bytes,
    pub issuing_ca: Bytes,
    pub signing_issuer_id: String,
    pub validating_issuer_id: String,
}

pub type Rotations = Subscription<Arc<Certificate>>;

/// Issues workload certificates and reports when they are rotated.
#[async_trait::async_trait]
pub trait CertificateManager: Send + Sync + 'static {
    /// Returns a certificate for the identity, reusing a cached one unless it
    /// is due for rotation.
    fn issue_certificate(
        &self,
        identity: &ServiceIdentity,
        validity: Duration,
    ) -> anyhow::Result<Arc<Certificate>>;

    /// Notifies on every rotation of the identity's certificate. Must be
    /// paired with [`CertificateManager::unsubscribe_rotations`].
    fn subscribe_rotations(&self, identity: &ServiceIdentity) -> Rotations;

    async fn unsubscribe_rotations(&self, rotations: &mut Rotations);

    fn issuers(&self) -> IssuerInfo;

    fn trust_domains(&self) -> Vec<String> {
        let IssuerInfo {
            signing,
            validating,
        } = self.issuers();
        if signing.trust_domain == validating.trust_domain {
            vec![signing.trust_domain]
        } else {
            vec![signing.trust_domain, validating.trust_domain]
        }
    }
}

impl Certificate {
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => self.expiration - now <= window,
            Err(_) => true,
        }
    }
}
