use crate::Broker;
use meshplane_controller_core::{
    event::{Kind, Payload, PubSubMessage},
    mesh_config::MeshConfig,
};
use std::future;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Periodically requests a resync of every proxy, at the interval set by the
/// mesh config's `sidecar.configResyncInterval`.
///
/// Intervals below `min_interval` are ignored. An interval of zero stops the
/// ticker.
#[derive(Debug)]
pub struct ResyncTicker {
    broker: Broker,
    min_interval: Duration,
}

impl ResyncTicker {
    pub fn new(broker: Broker, min_interval: Duration) -> Self {
        Self {
            broker,
            min_interval,
        }
    }

    /// Watches mesh config updates until `shutdown` is signaled.
    pub async fn run(self, shutdown: drain::Watch) {
        let mut updates = self.broker.subscribe_kube_events([Kind::MeshConfig.updated()]);
        let mut ticker: Option<Interval> = None;
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,

                msg = updates.recv() => match msg {
                    Some(msg) => self.reconfigure(&msg, &mut ticker),
                    None => break,
                },

                _ = tick(&mut ticker) => {
                    trace!("Resyncing proxies");
                    self.broker.metrics().resync_ticks.inc();
                    self.broker.add_rate_limited(PubSubMessage::proxy_update());
                }
            }
        }

        self.broker.unsubscribe_kube_events(&mut updates).await;
        debug!("Resync ticker stopped");
    }

    fn reconfigure(&self, msg: &PubSubMessage, ticker: &mut Option<Interval>) {
        let (old, new) = match (&msg.old, &msg.new) {
            (Some(Payload::MeshConfig(old)), Some(Payload::MeshConfig(new))) => (old, new),
            (old, new) => {
                error!(
                    old = old.as_ref().map(Payload::type_name),
                    new = new.as_ref().map(Payload::type_name),
                    "Expected MeshConfig payloads"
                );
                return;
            }
        };

        let interval = |c: &MeshConfig| c.sidecar.config_resync_interval.as_duration();
        let (old, new) = (interval(old), interval(new));
        if old == new {
            return;
        }

        if new.is_zero() {
            if ticker.take().is_some() {
                info!("Resync interval set to 0; stopping resync ticker");
            }
        } else if new >= self.min_interval {
            info!(interval = ?new, "Updating resync ticker");
            let mut interval = time::interval_at(Instant::now() + new, new);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *ticker = Some(interval);
        } else {
            warn!(
                interval = ?new,
                min = ?self.min_interval,
                "Resync interval is below the minimum; ignoring"
            );
            self.broker.metrics().resync_invalid_intervals.inc();
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
