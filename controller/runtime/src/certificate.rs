//! Tracks issued workload certificates and rotates them before they expire.
//!
//! Certificates carry no real key material; signing is left to an external
//! issuer.

use ahash::AHashMap as HashMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use meshplane_controller_core::{
    certificate::{Certificate, CertificateManager, Rotations},
    identity::IssuerInfo,
    pubsub::PubSub,
    ServiceIdentity,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct InMemoryCertManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    issuers: IssuerInfo,
    /// Certificates expiring within this window are reissued.
    rotation_window: Duration,
    issued: Mutex<HashMap<ServiceIdentity, Issued>>,
    rotations: PubSub<Arc<Certificate>>,
    next_serial: AtomicU64,
}

#[derive(Clone, Debug)]
struct Issued {
    cert: Arc<Certificate>,
    validity: Duration,
}

impl InMemoryCertManager {
    pub fn new(issuers: IssuerInfo, rotation_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuers,
                rotation_window,
                issued: Mutex::new(HashMap::default()),
                rotations: PubSub::new(16),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Reissues every certificate that is due, until `shutdown` is signaled.
    pub async fn run_rotations(self, interval: Duration, shutdown: drain::Watch) {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = ticks.tick() => self.rotate_expiring(Utc::now()).await,
            }
        }
    }

    /// Reissues the identity's certificate and notifies subscribers. Returns
    /// false if no certificate has been issued for it.
    pub async fn rotate(&self, identity: &ServiceIdentity) -> bool {
        let validity = match self.inner.issued.lock().get(identity) {
            Some(issued) => issued.validity,
            None => return false,
        };
        let cert = self.issue(identity, validity, Utc::now());
        self.publish_rotation(cert).await;
        true
    }

    async fn rotate_expiring(&self, now: DateTime<Utc>) {
        let due = self
            .inner
            .issued
            .lock()
            .iter()
            .filter(|(_, i)| i.cert.expires_within(now, self.inner.rotation_window))
            .map(|(id, i)| (id.clone(), i.validity))
            .collect::<Vec<_>>();

        for (identity, validity) in due {
            let cert = self.issue(&identity, validity, now);
            self.publish_rotation(cert).await;
        }
    }

    async fn publish_rotation(&self, cert: Arc<Certificate>) {
        info!(identity = %cert.identity, serial = %cert.serial_number, expiration = %cert.expiration, "Rotated certificate");
        self.inner
            .rotations
            .publish(&cert.identity.to_string(), cert.clone())
            .await;
    }

    fn issue(
        &self,
        identity: &ServiceIdentity,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Arc<Certificate> {
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let expiration = chrono::Duration::from_std(validity)
            .ok()
            .and_then(|v| now.checked_add_signed(v))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let IssuerInfo {
            signing,
            validating,
        } = &self.inner.issuers;

        let common_name = identity.to_dns_name(&signing.trust_domain);
        let cert = Arc::new(Certificate {
            cert_chain: Bytes::from(format!("cert:{common_name}:{serial}")),
            private_key: Bytes::new(),
            issuing_ca: Bytes::from(format!("ca:{}", signing.id)),
            common_name,
            serial_number: serial.to_string(),
            identity: identity.clone(),
            expiration,
            signing_issuer_id: signing.id.clone(),
            validating_issuer_id: validating.id.clone(),
        });

        debug!(%identity, serial, %expiration, "Issued certificate");
        self.inner.issued.lock().insert(
            identity.clone(),
            Issued {
                cert: cert.clone(),
                validity,
            },
        );
        cert
    }
}

#[async_trait::async_trait]
impl CertificateManager for InMemoryCertManager {
    fn issue_certificate(
        &self,
        identity: &ServiceIdentity,
        validity: Duration,
    ) -> anyhow::Result<Arc<Certificate>> {
        let now = Utc::now();
        if let Some(issued) = self.inner.issued.lock().get(identity) {
            if !issued.cert.expires_within(now, self.inner.rotation_window) {
                return Ok(issued.cert.clone());
            }
        }
        Ok(self.issue(identity, validity, now))
    }

    fn subscribe_rotations(&self, identity: &ServiceIdentity) -> Rotations {
        self.inner.rotations.subscribe([identity.to_string()])
    }

    async fn unsubscribe_rotations(&self, rotations: &mut Rotations) {
        self.inner.rotations.unsubscribe(rotations).await
    }

    fn issuers(&self) -> IssuerInfo {
        self.inner.issuers.clone()
    }
}
