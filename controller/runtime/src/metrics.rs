use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Duration;

#[derive(Clone, Debug)]
pub struct ControlPlaneMetrics {
    connected: Gauge,
    connects: Counter,
    rejected: Family<RejectLabels, Counter>,
    updates: Counter,
    update_errors: Family<StageLabels, Counter>,
    update_duration: Histogram,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RejectReason {
    Unauthenticated,
    Verification,
    MaxConnections,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UpdateStage {
    Generate,
    Push,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RejectLabels {
    reason: RejectReason,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StageLabels {
    stage: UpdateStage,
}

// === impl ControlPlaneMetrics ===

impl ControlPlaneMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let connected = Gauge::default();
        reg.register(
            "proxies_connected",
            "Number of proxies currently connected",
            connected.clone(),
        );

        let connects = Counter::default();
        reg.register(
            "proxy_connects",
            "Total number of proxy connections admitted",
            connects.clone(),
        );

        let rejected = Family::default();
        reg.register(
            "proxy_connects_rejected",
            "Total number of proxy connections rejected",
            rejected.clone(),
        );

        let updates = Counter::default();
        reg.register(
            "proxy_updates",
            "Total number of proxy configurations generated and pushed",
            updates.clone(),
        );

        let update_errors = Family::default();
        reg.register(
            "proxy_update_errors",
            "Total number of proxy updates abandoned because of an error",
            update_errors.clone(),
        );

        let update_duration = Histogram::new([0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]);
        reg.register_with_unit(
            "proxy_update_duration",
            "Histogram of the time (seconds) taken to generate and push a proxy's configuration",
            Unit::Seconds,
            update_duration.clone(),
        );

        Self {
            connected,
            connects,
            rejected,
            updates,
            update_errors,
            update_duration,
        }
    }

    pub(crate) fn connected(&self) {
        self.connects.inc();
        self.connected.inc();
    }

    pub(crate) fn disconnected(&self) {
        self.connected.dec();
    }

    pub(crate) fn rejected(&self, reason: RejectReason) {
        self.rejected.get_or_create(&RejectLabels { reason }).inc();
    }

    pub(crate) fn updated(&self, elapsed: Duration) {
        self.updates.inc();
        self.update_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn update_failed(&self, stage: UpdateStage) {
        self.update_errors.get_or_create(&StageLabels { stage }).inc();
    }

    pub fn connected_proxies(&self) -> i64 {
        self.connected.get()
    }

    pub fn total_connects(&self) -> u64 {
        self.connects.get()
    }

    pub fn total_rejected(&self, reason: RejectReason) -> u64 {
        self.rejected.get_or_create(&RejectLabels { reason }).get()
    }

    pub fn total_updates(&self) -> u64 {
        self.updates.get()
    }

    pub fn total_update_errors(&self, stage: UpdateStage) -> u64 {
        self.update_errors.get_or_create(&StageLabels { stage }).get()
    }
}

impl Default for ControlPlaneMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
