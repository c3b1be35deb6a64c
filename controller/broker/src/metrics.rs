use meshplane_controller_core::event::EventKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct BrokerMetrics {
    pub(crate) queue_depth: Gauge,
    pub(crate) queue_retries: Counter,
    pub(crate) backlog: Gauge,
    pub(crate) dropped_events: Counter,
    pub(crate) events: Family<EventLabels, Counter>,
    pub(crate) proxy_update_events: Counter,
    pub(crate) dispatched_proxy_updates: Counter,
    pub(crate) broadcasts: Counter,
    pub(crate) resync_ticks: Counter,
    pub(crate) resync_invalid_intervals: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct EventLabels {
    kind: &'static str,
    event_type: &'static str,
}

// === impl BrokerMetrics ===

impl BrokerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let queue_depth = Gauge::default();
        reg.register(
            "queue_depth",
            "Number of events waiting to be dispatched",
            queue_depth.clone(),
        );

        let queue_retries = Counter::default();
        reg.register(
            "queue_retries",
            "Number of times an event was requeued because the queue was full",
            queue_retries.clone(),
        );

        let backlog = Gauge::default();
        reg.register(
            "backlog",
            "Number of events waiting for room in the queue",
            backlog.clone(),
        );

        let dropped_events = Counter::default();
        reg.register(
            "dropped_events",
            "Number of events dropped because the backlog was full",
            dropped_events.clone(),
        );

        let events = Family::default();
        reg.register(
            "events",
            "Number of events dispatched from the queue",
            events.clone(),
        );

        let proxy_update_events = Counter::default();
        reg.register(
            "proxy_update_events",
            "Number of dispatched events that required a proxy update",
            proxy_update_events.clone(),
        );

        let dispatched_proxy_updates = Counter::default();
        reg.register(
            "dispatched_proxy_updates",
            "Number of proxy updates published to proxies",
            dispatched_proxy_updates.clone(),
        );

        let broadcasts = Counter::default();
        reg.register(
            "broadcasts",
            "Number of coalesced proxy update broadcasts",
            broadcasts.clone(),
        );

        let resync_ticks = Counter::default();
        reg.register(
            "resync_ticks",
            "Number of periodic resyncs requested",
            resync_ticks.clone(),
        );

        let resync_invalid_intervals = Counter::default();
        reg.register(
            "resync_invalid_intervals",
            "Number of resync intervals rejected for being below the minimum",
            resync_invalid_intervals.clone(),
        );

        Self {
            queue_depth,
            queue_retries,
            backlog,
            dropped_events,
            events,
            proxy_update_events,
            dispatched_proxy_updates,
            broadcasts,
            resync_ticks,
            resync_invalid_intervals,
        }
    }

    pub(crate) fn event(&self, kind: EventKind) {
        self.events
            .get_or_create(&EventLabels {
                kind: kind.kind.as_str(),
                event_type: kind.event_type.as_str(),
            })
            .inc();
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }

    pub fn backlog_depth(&self) -> i64 {
        self.backlog.get()
    }

    pub fn total_dropped_events(&self) -> u64 {
        self.dropped_events.get()
    }

    /// Events read from the queue that required a proxy update.
    pub fn total_proxy_update_events(&self) -> u64 {
        self.proxy_update_events.get()
    }

    /// Proxy updates actually published, after coalescing.
    pub fn total_dispatched_proxy_updates(&self) -> u64 {
        self.dispatched_proxy_updates.get()
    }

    pub fn total_broadcasts(&self) -> u64 {
        self.broadcasts.get()
    }

    pub fn total_resync_ticks(&self) -> u64 {
        self.resync_ticks.get()
    }

    pub fn total_invalid_resync_intervals(&self) -> u64 {
        self.resync_invalid_intervals.get()
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
