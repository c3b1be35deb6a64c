#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Ingests change events, decides which of them require proxies to be
//! reconfigured, and fans the results out to subscribers.
//!
//! All events pass through a single bounded queue, drained by one dispatcher
//! task at a bounded rate. Events that affect every proxy are coalesced
//! within a sliding window before being broadcast.
//!
//! Events added without waiting spill into a bounded backlog when the queue
//! is full. One requeue task moves them back into the queue. When the backlog
//! overflows, events are dropped and every proxy is resynced once the backlog
//! drains.

mod classify;
mod metrics;
mod rate_limit;
mod ticker;

#[cfg(test)]
mod tests;

pub use self::{
    classify::{proxy_update_target, should_update_proxy, ProxyUpdateTarget, PROXY_UUID_LABEL},
    metrics::BrokerMetrics,
    ticker::ResyncTicker,
};

use meshplane_controller_core::{
    event::{EventKind, PubSubMessage},
    pubsub::{PubSub, Subscription},
    Uuid,
};
use parking_lot::Mutex;
use rate_limit::TokenBucket;
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::{mpsc, watch, Notify},
    time::{self, Duration, Instant},
};
use tracing::{debug, info, trace, warn, Instrument};

/// The topic on which updates for every proxy are published.
pub const PROXY_UPDATE_TOPIC: &str = "proxy-update";

/// The topic on which updates for a single proxy are published.
pub fn proxy_topic(uuid: impl std::fmt::Display) -> String {
    format!("proxy:{uuid}")
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub queue_capacity: usize,
    pub subscriber_capacity: usize,

    /// Sustained dispatch rate.
    pub qps: f64,
    pub burst: u32,

    /// Events held while the queue is full. Beyond this, events are dropped
    /// and replaced by a resync of every proxy.
    pub backlog_capacity: usize,

    /// Retries with backoff before a full queue is waited on.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,

    /// Broadcasts received within this long of the previous one are merged.
    pub broadcast_window: Duration,
    /// No broadcast is held for longer than this.
    pub broadcast_max_window: Duration,
}

/// A request for proxies to regenerate their config.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProxyUpdate {
    /// The most recent event that caused the update.
    pub trigger: EventKind,
}

pub type ProxyUpdates = Subscription<ProxyUpdate>;
pub type KubeEvents = Subscription<PubSubMessage>;

/// A handle to the event broker. Cloning is cheap; all clones share the same
/// queue and subscribers.
#[derive(Clone, Debug)]
pub struct Broker {
    tx: mpsc::Sender<PubSubMessage>,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    config: BrokerConfig,
    proxy_updates: PubSub<ProxyUpdate>,
    kube_events: PubSub<PubSubMessage>,
    metrics: BrokerMetrics,
    backlog: Mutex<Backlog>,
    requeue: Notify,
}

/// Events waiting for room in the queue, in arrival order.
#[derive(Debug, Default)]
struct Backlog {
    events: VecDeque<PubSubMessage>,
    /// Set when an event was dropped since the backlog last drained.
    dropped: bool,
}

// === impl BrokerConfig ===

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            subscriber_capacity: 64,
            qps: 100.0,
            burst: 1000,
            backlog_capacity: 1024,
            max_retries: 5,
            retry_base: Duration::from_millis(5),
            retry_max: Duration::from_secs(10),
            broadcast_window: Duration::from_secs(2),
            broadcast_max_window: Duration::from_secs(10),
        }
    }
}

// === impl Broker ===

impl Broker {
    /// Creates the broker and spawns its dispatcher tasks, which run until
    /// `shutdown` is signaled.
    pub fn new(config: BrokerConfig, metrics: BrokerMetrics, shutdown: drain::Watch) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        // Only the latest pending broadcast is kept.
        let (broadcast_tx, broadcast_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            proxy_updates: PubSub::new(config.subscriber_capacity),
            kube_events: PubSub::new(config.subscriber_capacity),
            config,
            metrics,
            backlog: Mutex::new(Backlog::default()),
            requeue: Notify::new(),
        });

        tokio::spawn(
            dispatch(shared.clone(), rx, broadcast_tx, shutdown.clone())
                .instrument(tracing::info_span!("dispatcher")),
        );
        tokio::spawn(
            broadcast(shared.clone(), broadcast_rx, shutdown.clone())
                .instrument(tracing::info_span!("broadcaster")),
        );
        tokio::spawn(
            requeue(shared.clone(), tx.clone(), shutdown)
                .instrument(tracing::info_span!("requeue")),
        );

        Self { tx, shared }
    }

    /// Adds an event to the queue, waiting for room if it is full.
    pub async fn enqueue(&self, msg: PubSubMessage) {
        self.shared.metrics.queue_depth.inc();
        if self.tx.send(msg).await.is_err() {
            self.shared.metrics.queue_depth.dec();
            debug!("Broker has stopped; dropping event");
        }
    }

    /// Adds an event to the queue without waiting. If the queue is full the
    /// event is held in the backlog and requeued in the background with
    /// exponential backoff.
    pub fn add_rate_limited(&self, msg: PubSubMessage) {
        let mut backlog = self.shared.backlog.lock();

        // Once events are backlogged, later ones queue behind them.
        let msg = if backlog.events.is_empty() {
            match self.tx.try_send(msg) {
                Ok(()) => {
                    self.shared.metrics.queue_depth.inc();
                    return;
                }
                Err(mpsc::error::TrySendError::Full(msg)) => msg,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Broker has stopped; dropping event");
                    return;
                }
            }
        } else {
            msg
        };

        if backlog.events.contains(&msg) {
            trace!(kind = %msg.kind, "Event is already backlogged");
        } else if backlog.events.len() >= self.shared.config.backlog_capacity {
            if !backlog.dropped {
                warn!(
                    capacity = self.shared.config.backlog_capacity,
                    "Event backlog is full; proxies will be resynced once it drains"
                );
            }
            backlog.dropped = true;
            self.shared.metrics.dropped_events.inc();
            trace!(kind = %msg.kind, "Dropped event");
        } else {
            backlog.events.push_back(msg);
            self.shared.metrics.backlog.inc();
        }
        drop(backlog);
        self.shared.requeue.notify_one();
    }

    /// Requests that every proxy regenerate its config.
    pub async fn broadcast_proxy_update(&self) {
        self.enqueue(PubSubMessage::proxy_update()).await
    }

    /// Subscribes to updates for every proxy and for the proxy with `uuid`.
    pub fn subscribe_proxy_updates(&self, uuid: &Uuid) -> ProxyUpdates {
        self.shared
            .proxy_updates
            .subscribe([PROXY_UPDATE_TOPIC.to_string(), proxy_topic(uuid)])
    }

    pub async fn unsubscribe_proxy_updates(&self, sub: &mut ProxyUpdates) {
        self.shared.proxy_updates.unsubscribe(sub).await
    }

    /// Subscribes to raw events of the given kinds, whether or not they
    /// affect proxies.
    pub fn subscribe_kube_events(&self, kinds: impl IntoIterator<Item = EventKind>) -> KubeEvents {
        self.shared
            .kube_events
            .subscribe(kinds.into_iter().map(|k| k.topic()))
    }

    pub async fn unsubscribe_kube_events(&self, sub: &mut KubeEvents) {
        self.shared.kube_events.unsubscribe(sub).await
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.shared.metrics
    }
}

/// Moves backlogged events into the queue as room frees up.
async fn requeue(shared: Arc<Shared>, tx: mpsc::Sender<PubSubMessage>, shutdown: drain::Watch) {
    let BrokerConfig {
        max_retries,
        retry_base,
        retry_max,
        ..
    } = shared.config;
    tokio::pin! {
        let shutdown = shutdown.signaled();
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = shared.requeue.notified() => {}
        }

        let mut retries = 0;
        loop {
            let permit = match tx.try_reserve() {
                Ok(permit) => permit,
                Err(mpsc::error::TrySendError::Closed(())) => return,
                Err(mpsc::error::TrySendError::Full(())) if retries < max_retries => {
                    retries += 1;
                    shared.metrics.queue_retries.inc();
                    trace!(retries, "Queue is full");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => return,
                        _ = time::sleep(rate_limit::backoff(retries, retry_base, retry_max)) => {}
                    }
                    continue;
                }
                Err(mpsc::error::TrySendError::Full(())) => {
                    // Out of retries; wait for room rather than drop events.
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => return,
                        permit = tx.reserve() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    }
                }
            };
            retries = 0;

            let Some(msg) = shared.backlog.lock().pop(&shared.metrics) else {
                break;
            };
            shared.metrics.queue_depth.inc();
            permit.send(msg);
        }
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<PubSubMessage>,
    broadcasts: watch::Sender<Option<ProxyUpdate>>,
    shutdown: drain::Watch,
) {
    let mut limiter = TokenBucket::new(shared.config.qps, shared.config.burst);
    tokio::pin! {
        let shutdown = shutdown.signaled();
    }

    loop {
        let msg = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutting down");
                return;
            }
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        shared.metrics.queue_depth.dec();

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutting down");
                return;
            }
            _ = limiter.acquire() => {}
        }

        process(&shared, &broadcasts, msg).await;
    }
}

async fn process(
    shared: &Shared,
    broadcasts: &watch::Sender<Option<ProxyUpdate>>,
    msg: PubSubMessage,
) {
    trace!(kind = %msg.kind, "Processing event");
    shared.metrics.event(msg.kind);

    match proxy_update_target(&msg) {
        Some(ProxyUpdateTarget::All) => {
            trace!(kind = %msg.kind, "Event updates all proxies");
            shared.metrics.proxy_update_events.inc();
            broadcasts.send_replace(Some(ProxyUpdate { trigger: msg.kind }));
        }
        Some(ProxyUpdateTarget::Proxy(uuid)) => {
            trace!(kind = %msg.kind, %uuid, "Event updates one proxy");
            shared.metrics.proxy_update_events.inc();
            shared
                .proxy_updates
                .publish(&proxy_topic(&uuid), ProxyUpdate { trigger: msg.kind })
                .await;
            shared.metrics.dispatched_proxy_updates.inc();
        }
        None => {}
    }

    let topic = msg.kind.topic();
    shared.kube_events.publish(&topic, msg).await;
}

/// Publishes broadcasts once no new one has arrived for the sliding window,
/// or once the max window has elapsed since the first unpublished one.
async fn broadcast(
    shared: Arc<Shared>,
    mut rx: watch::Receiver<Option<ProxyUpdate>>,
    shutdown: drain::Watch,
) {
    let window = shared.config.broadcast_window;
    let max_window = shared.config.broadcast_max_window;
    tokio::pin! {
        let shutdown = shutdown.signaled();
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            res = rx.changed() => if res.is_err() {
                return;
            },
        }

        let max_deadline = Instant::now() + max_window;
        let mut deadline = (Instant::now() + window).min(max_deadline);
        let mut merged = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => return,
                _ = time::sleep_until(deadline) => break,
                res = rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    merged += 1;
                    deadline = (Instant::now() + window).min(max_deadline);
                }
            }
        }

        let Some(update) = *rx.borrow_and_update() else {
            continue;
        };
        debug!(merged, trigger = %update.trigger, "Broadcasting proxy update");
        shared.metrics.broadcasts.inc();
        shared.metrics.dispatched_proxy_updates.inc();
        shared.proxy_updates.publish(PROXY_UPDATE_TOPIC, update).await;
    }
}

// === impl Backlog ===

impl Backlog {
    /// Takes the oldest event. Once the backlog drains after dropping events,
    /// a single update for every proxy stands in for them.
    fn pop(&mut self, metrics: &BrokerMetrics) -> Option<PubSubMessage> {
        if let Some(msg) = self.events.pop_front() {
            metrics.backlog.dec();
            return Some(msg);
        }
        if std::mem::take(&mut self.dropped) {
            info!("Event backlog drained after dropping events; resyncing all proxies");
            return Some(PubSubMessage::proxy_update());
        }
        None
    }
}
