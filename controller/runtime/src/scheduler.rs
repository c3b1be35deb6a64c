//! Decides when a connected proxy's configuration is regenerated.
//!
//! Every trigger requests an update. At most one update per proxy runs at a
//! time, and each is followed by a cooldown; requests arriving meanwhile are
//! coalesced into a single follow-up update.

use crate::{
    metrics::{ControlPlaneMetrics, UpdateStage},
    single_flight::SingleFlight,
    workerpool::WorkerPool,
};
use meshplane_controller_broker::Broker;
use meshplane_controller_core::{
    certificate::CertificateManager, Proxy, ProxyConfigGenerator, ProxyUpdater,
};
use std::sync::Arc;
use tokio::{
    sync::Notify,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, Instrument};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// The longest a proxy goes without an update.
    pub ceiling: Duration,
    /// The least time between the end of one update and the start of the next.
    pub cooldown: Duration,
}

/// Everything a proxy's scheduler needs besides the proxy itself.
pub(crate) struct Schedulers<G, U> {
    pub(crate) generator: Arc<G>,
    pub(crate) updater: Arc<U>,
    pub(crate) pool: WorkerPool,
    pub(crate) config: SchedulerConfig,
    pub(crate) metrics: ControlPlaneMetrics,
    pub(crate) broker: Broker,
    pub(crate) certs: Arc<dyn CertificateManager>,
    pub(crate) shutdown: drain::Watch,
}

/// Schedules the updates of a single proxy.
struct UpdateScheduler<G, U> {
    proxy: Arc<Proxy>,
    flight: SingleFlight,
    reset_ceiling: Notify,
    /// Cancelled when the proxy's stream closes or the scheduler stops.
    stop: CancellationToken,
    ctx: Schedulers<G, U>,
}

// === impl SchedulerConfig ===

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ceiling: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(1),
        }
    }
}

// === impl UpdateScheduler ===

impl<G, U> UpdateScheduler<G, U>
where
    G: ProxyConfigGenerator,
    U: ProxyUpdater<G::Config>,
{
    /// Listens for triggers until the proxy's stream closes or `shutdown` is
    /// signaled. An update already running is left to finish.
    async fn run(self: Arc<Self>) {
        let Schedulers {
            broker,
            certs,
            shutdown,
            config,
            ..
        } = &self.ctx;
        let mut updates = broker.subscribe_proxy_updates(&self.proxy.uuid);
        let mut rotations = certs.subscribe_rotations(&self.proxy.identity);
        let mut rotations_open = true;

        let ceiling = time::sleep(config.ceiling);
        tokio::pin!(ceiling);
        tokio::pin! {
            let shutdown = shutdown.clone().signaled();
        }

        // Proxies are configured as soon as they connect.
        self.try_update();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Shutting down");
                    break;
                }
                _ = self.stop.cancelled() => {
                    debug!("Stream closed");
                    break;
                }

                update = updates.recv() => match update {
                    Some(update) => {
                        trace!(trigger = %update.trigger, "Proxy update requested");
                        self.try_update();
                    }
                    None => break,
                },

                cert = rotations.recv(), if rotations_open => match cert {
                    Some(cert) => {
                        debug!(serial = %cert.serial_number, "Certificate rotated");
                        self.try_update();
                    }
                    None => rotations_open = false,
                },

                _ = &mut ceiling => {
                    trace!("No update within the ceiling interval");
                    self.try_update();
                    ceiling.as_mut().reset(Instant::now() + config.ceiling);
                }

                _ = self.reset_ceiling.notified() => {
                    ceiling.as_mut().reset(Instant::now() + config.ceiling);
                }
            }
        }

        self.stop.cancel();
        broker.unsubscribe_proxy_updates(&mut updates).await;
        certs.unsubscribe_rotations(&mut rotations).await;
    }

    /// Requests an update, starting one unless one is already in flight.
    fn try_update(self: &Arc<Self>) {
        let Some(flight) = self.flight.request() else {
            trace!("Update in flight; coalescing");
            return;
        };

        let this = self.clone();
        tokio::spawn(
            async move {
                match this.ctx.pool.add_job(this.clone().update()).await {
                    Ok(job) => {
                        job.wait().await;
                    }
                    Err(error) => {
                        debug!(%error, "Update not scheduled");
                        return;
                    }
                }
                this.reset_ceiling.notify_one();

                tokio::select! {
                    _ = this.stop.cancelled() => {}
                    _ = time::sleep(this.ctx.config.cooldown) => {}
                }
                drop(flight);

                if this.flight.is_requested() && !this.stop.is_cancelled() {
                    this.try_update();
                }
            }
            .in_current_span(),
        );
    }

    async fn update(self: Arc<Self>) {
        if self.stop.is_cancelled() {
            trace!("Stream closed; skipping update");
            return;
        }
        // Cleared before generating so that any later trigger runs again.
        self.flight.take_request();

        let start = Instant::now();
        let config = match self.ctx.generator.generate_config(&self.proxy).await {
            Ok(config) => config,
            Err(error) => {
                error!(%error, "Failed to generate proxy config");
                self.ctx.metrics.update_failed(UpdateStage::Generate);
                return;
            }
        };
        if let Err(error) = self.ctx.updater.update_proxy(&self.proxy, config).await {
            error!(%error, "Failed to push proxy config");
            self.ctx.metrics.update_failed(UpdateStage::Push);
            return;
        }

        let elapsed = start.elapsed();
        debug!(?elapsed, "Updated proxy");
        self.ctx.metrics.updated(elapsed);
    }
}

// === impl Schedulers ===

impl<G, U> Schedulers<G, U>
where
    G: ProxyConfigGenerator,
    U: ProxyUpdater<G::Config>,
{
    /// Starts a scheduler for a newly connected proxy. It stops once `stream`
    /// is cancelled.
    pub(crate) fn spawn(&self, proxy: Arc<Proxy>, stream: &CancellationToken) {
        let span = info_span!("scheduler", proxy = %proxy);
        let scheduler = Arc::new(UpdateScheduler {
            proxy,
            flight: SingleFlight::default(),
            reset_ceiling: Notify::new(),
            stop: stream.child_token(),
            ctx: self.clone(),
        });
        tokio::spawn(scheduler.run().instrument(span));
    }
}

impl<G, U> Clone for Schedulers<G, U> {
    fn clone(&self) -> Self {
        Self {
            generator: self.generator.clone(),
            updater: self.updater.clone(),
            pool: self.pool.clone(),
            config: self.config,
            metrics: self.metrics.clone(),
            broker: self.broker.clone(),
            certs: self.certs.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
